//! Infrastructure layer for the service engine.
//!
//! Contains implementations of the ports defined in `sce-core`: the
//! in-process durable host, the in-memory definition repository, and the
//! engine configuration loader.

pub mod config;
pub mod host;
pub mod repository;
