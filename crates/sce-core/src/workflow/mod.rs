//! Workflow engine core: graph utilities, node dispatch, and the interpreter.
//!
//! - `graph` -- arena index, deterministic topological order, structural checks
//! - `expression` -- JEXL evaluator for edge and decision conditions
//! - `context` -- variable lookup, template interpolation, node input building
//! - `retry` -- deterministic backoff schedule for node calls
//! - `host` -- the durable host port (clock, activities, timers, signals)
//! - `node` -- node kinds and their dispatch
//! - `engine` -- the interpreter and error policies
//! - `runtime` -- submit, query, signal, cancel and wait for instances

pub mod context;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod host;
pub mod node;
pub mod retry;
pub mod runtime;

#[cfg(test)]
mod test_host;

pub use engine::{InstanceRun, WorkflowEngine};
pub use host::{ActivityCall, ChildWorkflowCall, DurableHost, HostError, HostFuture};
pub use runtime::{InstanceHandle, RuntimeError, WorkflowRuntime};
