//! In-process durable host.
//!
//! [`LocalHost`] implements the [`DurableHost`] port from sce-core on top of
//! tokio: activities run from a [`HandlerRegistry`] with per-attempt timeouts
//! and the node's retry schedule, timers are `tokio::time::sleep`, and
//! signals go through per-instance mailboxes that buffer deliveries made
//! before anyone waits.
//!
//! Nothing here is replayed after a restart. It is the host for local runs
//! and tests; a production deployment plugs a replaying host into the same
//! port.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use sce_core::workflow::host::{ActivityCall, ChildWorkflowCall, DurableHost, HostError, HostFuture};
use sce_core::workflow::retry::RetryHandler;
use sce_types::ids::InstanceId;

use super::registry::HandlerRegistry;

/// One signal mailbox. The sender side is cloned out for delivery; the
/// receiver is locked by the single waiter.
#[derive(Clone)]
struct Mailbox {
    tx: mpsc::UnboundedSender<Value>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Value>>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Durable host backed by the local tokio runtime.
#[derive(Clone, Default)]
pub struct LocalHost {
    activities: HandlerRegistry,
    workflows: HandlerRegistry,
    mailboxes: Arc<DashMap<(InstanceId, String), Mailbox>>,
}

impl LocalHost {
    pub fn new(activities: HandlerRegistry, workflows: HandlerRegistry) -> Self {
        Self {
            activities,
            workflows,
            mailboxes: Arc::new(DashMap::new()),
        }
    }

    pub fn activities(&self) -> &HandlerRegistry {
        &self.activities
    }

    pub fn workflows(&self) -> &HandlerRegistry {
        &self.workflows
    }

    fn mailbox(&self, instance_id: InstanceId, name: &str) -> Mailbox {
        self.mailboxes
            .entry((instance_id, name.to_string()))
            .or_insert_with(Mailbox::new)
            .clone()
    }

    async fn run_activity(&self, call: ActivityCall) -> Result<Value, HostError> {
        let handler = self
            .activities
            .get(&call.name)
            .ok_or_else(|| HostError::NotRegistered(call.name.clone()))?;

        let mut attempt = 1;
        loop {
            tracing::debug!(
                instance_id = %call.instance_id,
                node_id = %call.node_id,
                activity = %call.name,
                attempt,
                "activity attempt"
            );
            let error = match tokio::time::timeout(call.timeout, handler.call(call.input.clone())).await {
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(message)) => HostError::ActivityFailed {
                    name: call.name.clone(),
                    attempts: attempt,
                    message,
                },
                Err(_) => HostError::Timeout {
                    name: call.name.clone(),
                    timeout_secs: call.timeout.as_secs(),
                },
            };

            if !RetryHandler::should_retry(&call.retry, attempt) {
                tracing::warn!(
                    instance_id = %call.instance_id,
                    node_id = %call.node_id,
                    activity = %call.name,
                    attempts = attempt,
                    error = %error,
                    "activity failed, retries exhausted"
                );
                return Err(error);
            }

            let delay = RetryHandler::backoff_delay(&call.retry, attempt);
            tracing::info!(
                node_id = %call.node_id,
                activity = %call.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "activity failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn run_child(&self, call: ChildWorkflowCall) -> Result<Value, HostError> {
        let handler = self
            .workflows
            .get(&call.workflow_name)
            .ok_or_else(|| HostError::NotRegistered(call.workflow_name.clone()))?;

        if call.wait_for_completion {
            return handler
                .call(call.input)
                .await
                .map_err(|message| HostError::ActivityFailed {
                    name: call.workflow_name,
                    attempts: 1,
                    message,
                });
        }

        let name = call.workflow_name.clone();
        let parent = call.parent_instance_id;
        let input = call.input;
        tokio::spawn(async move {
            match handler.call(input).await {
                Ok(_) => tracing::info!(parent_instance_id = %parent, workflow = %name, "child workflow finished"),
                Err(e) => tracing::warn!(parent_instance_id = %parent, workflow = %name, error = %e, "child workflow failed"),
            }
        });
        Ok(json!({ "started": true, "workflow_name": call.workflow_name }))
    }
}

impl DurableHost for LocalHost {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn execute_activity<'a>(&'a self, call: ActivityCall) -> HostFuture<'a, Value> {
        Box::pin(self.run_activity(call))
    }

    fn sleep<'a>(&'a self, duration: Duration) -> HostFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            Ok(())
        })
    }

    fn wait_signal<'a>(
        &'a self,
        instance_id: InstanceId,
        name: &'a str,
        timeout: Option<Duration>,
    ) -> HostFuture<'a, Option<Value>> {
        let mailbox = self.mailbox(instance_id, name);
        Box::pin(async move {
            let mut rx = mailbox.rx.lock().await;
            let received = match timeout {
                Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        tracing::debug!(instance_id = %instance_id, signal = name, "signal wait timed out");
                        return Ok(None);
                    }
                },
                None => rx.recv().await,
            };
            // The mailbox holds its own sender, so the channel never closes
            // while the waiter is alive.
            received
                .map(Some)
                .ok_or_else(|| HostError::Signal(format!("mailbox '{name}' closed")))
        })
    }

    fn deliver_signal(&self, instance_id: InstanceId, name: &str, payload: Value) -> Result<(), HostError> {
        tracing::debug!(instance_id = %instance_id, signal = name, "signal delivered");
        self.mailbox(instance_id, name)
            .tx
            .send(payload)
            .map_err(|_| HostError::Signal(format!("mailbox '{name}' closed")))
    }

    fn start_child_workflow<'a>(&'a self, call: ChildWorkflowCall) -> HostFuture<'a, Value> {
        Box::pin(self.run_child(call))
    }

    fn release_instance(&self, instance_id: InstanceId) {
        self.mailboxes.retain(|(id, _), _| *id != instance_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
