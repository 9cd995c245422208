//! Service definition aggregate and workflow execution engine.
//!
//! This crate defines the "ports" (repository and durable-host traits) that
//! the infrastructure layer implements. It depends only on `sce-types` --
//! never on `sce-infra` or any storage or I/O crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod workflow;
