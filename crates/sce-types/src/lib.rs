//! Shared domain types for the service composition engine.
//!
//! This crate contains the value types used across the workspace: identifiers,
//! service definitions, workflow graphs, execution results, events, engine
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod ids;
pub mod service;
pub mod workflow;
