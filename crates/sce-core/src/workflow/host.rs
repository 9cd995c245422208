//! The durable execution host port.
//!
//! The interpreter never reads the wall clock, sleeps, or waits for signals
//! on its own. Every such primitive goes through a `DurableHost` passed in
//! explicitly, so a replaying host can return recorded values and tests can
//! script the whole environment.
//!
//! The trait is object-safe with boxed futures, so the engine can hold
//! `Arc<dyn DurableHost>`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use sce_types::ids::InstanceId;
use sce_types::workflow::RetryPolicy;

/// Boxed future returned by host operations.
pub type HostFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HostError>> + Send + 'a>>;

/// Errors surfaced by the durable host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The external call returned an error after exhausting its retries.
    #[error("activity '{name}' failed after {attempts} attempt(s): {message}")]
    ActivityFailed {
        name: String,
        attempts: u32,
        message: String,
    },

    /// The call did not finish within its start-to-close timeout.
    #[error("activity '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    /// No handler is registered under this name.
    #[error("no handler registered for '{0}'")]
    NotRegistered(String),

    /// The host is shutting down or the call was abandoned.
    #[error("host call cancelled")]
    Cancelled,

    /// Signal delivery failed (unknown instance, closed mailbox).
    #[error("signal error: {0}")]
    Signal(String),
}

/// A named external call issued by an activity-like node.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityCall {
    pub instance_id: InstanceId,
    pub node_id: String,
    /// Registered name of the operation (`ReserveInventory`, `CallLLM`, ...).
    pub name: String,
    pub input: Value,
    /// Start-to-close timeout for each attempt.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Routing hint for hosts with dedicated worker pools.
    pub task_queue: Option<String>,
}

/// A request to run another workflow by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildWorkflowCall {
    pub parent_instance_id: InstanceId,
    pub workflow_name: String,
    pub input: Value,
    /// Block until the child finishes and return its output. When false the
    /// host only acknowledges the start.
    pub wait_for_completion: bool,
}

/// Replay-safe primitives the interpreter runs on.
pub trait DurableHost: Send + Sync {
    /// Replay-safe current time.
    fn now(&self) -> DateTime<Utc>;

    /// Run an external call with the call's retry policy and timeout.
    fn execute_activity<'a>(&'a self, call: ActivityCall) -> HostFuture<'a, Value>;

    /// Durable timer.
    fn sleep<'a>(&'a self, duration: Duration) -> HostFuture<'a, ()>;

    /// Wait for a named signal addressed to an instance.
    ///
    /// Resolves to `Ok(None)` if `timeout` elapses first. With no timeout
    /// the wait only ends on delivery or when the future is dropped.
    fn wait_signal<'a>(
        &'a self,
        instance_id: InstanceId,
        name: &'a str,
        timeout: Option<Duration>,
    ) -> HostFuture<'a, Option<Value>>;

    /// Deliver a signal. Signals sent before anyone waits are buffered.
    fn deliver_signal(&self, instance_id: InstanceId, name: &str, payload: Value) -> Result<(), HostError>;

    /// Start a child workflow (subflows and compensation hand-off).
    fn start_child_workflow<'a>(&'a self, call: ChildWorkflowCall) -> HostFuture<'a, Value>;

    /// Drop any buffered state held for a finished instance.
    fn release_instance(&self, _instance_id: InstanceId) {}
}
