//! Observability setup: structured logging with optional OpenTelemetry export.

pub mod tracing_setup;
