//! Instance runtime: the execution interface over the interpreter.
//!
//! `WorkflowRuntime` submits instances of published definitions, tracks each
//! one's cancellation token and live context snapshot, forwards signals to
//! the durable host, and hands out terminal results.
//!
//! Queries never block or touch the running instance: every instance
//! publishes an `ExecutionContext` on a `watch` channel after each node and
//! `query` clones the latest value.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use sce_types::error::RepositoryError;
use sce_types::execution::{ExecutionContext, ExecutionRequest, InstanceMetadata, ServiceExecutionResult};
use sce_types::ids::{InstanceId, ServiceId, VersionId};
use sce_types::service::ServiceStatus;

use crate::repository::service::ServiceDefinitionRepository;

use super::engine::{InstanceRun, WorkflowEngine};
use super::host::HostError;

/// Errors from the execution interface.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("service not found: {0}")]
    ServiceNotFound(ServiceId),

    #[error("service {0} has not been published")]
    NotPublished(ServiceId),

    #[error("service {service_id} is {status} and cannot start new instances")]
    NotSelectable {
        service_id: ServiceId,
        status: ServiceStatus,
    },

    #[error("version {version_id} not found for service {service_id}")]
    VersionNotFound {
        service_id: ServiceId,
        version_id: VersionId,
    },

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("instance {0} ended without producing a result")]
    Aborted(InstanceId),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

/// Handle returned from `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceHandle {
    pub instance_id: InstanceId,
    pub service_id: ServiceId,
    pub version_id: VersionId,
}

struct InstanceEntry {
    service_id: ServiceId,
    cancel: CancellationToken,
    snapshot: watch::Receiver<ExecutionContext>,
    result: watch::Receiver<Option<Arc<ServiceExecutionResult>>>,
}

impl InstanceEntry {
    fn is_active(&self) -> bool {
        self.result.borrow().is_none()
    }
}

/// Runs instances of published service definitions on a shared engine.
pub struct WorkflowRuntime<R: ServiceDefinitionRepository> {
    engine: Arc<WorkflowEngine>,
    repo: R,
    instances: DashMap<InstanceId, InstanceEntry>,
}

impl<R: ServiceDefinitionRepository> WorkflowRuntime<R> {
    pub fn new(engine: Arc<WorkflowEngine>, repo: R) -> Self {
        Self {
            engine,
            repo,
            instances: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Start a new instance.
    ///
    /// Only Published definitions accept new instances. The requested version
    /// is used when given, otherwise the active one.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<InstanceHandle, RuntimeError> {
        let service_id = request.service_id;
        let definition = self
            .repo
            .get_by_id(&service_id)
            .await?
            .filter(|d| d.tenant_id() == request.tenant_id)
            .ok_or(RuntimeError::ServiceNotFound(service_id))?;

        match definition.status() {
            ServiceStatus::Published => {}
            ServiceStatus::Draft => return Err(RuntimeError::NotPublished(service_id)),
            status => return Err(RuntimeError::NotSelectable { service_id, status }),
        }

        let version = match request.version_id {
            Some(version_id) => definition
                .version(version_id)
                .ok_or(RuntimeError::VersionNotFound {
                    service_id,
                    version_id,
                })?,
            None => definition
                .active_version()
                .ok_or(RuntimeError::NotPublished(service_id))?,
        };
        let version = Arc::new(version.clone());

        let metadata = InstanceMetadata {
            instance_id: InstanceId::new(),
            service_id,
            version_id: version.id,
            tenant_id: request.tenant_id,
            correlation_id: request.correlation_id,
            initiated_by: request.initiated_by,
        };
        let handle = InstanceHandle {
            instance_id: metadata.instance_id,
            service_id,
            version_id: version.id,
        };

        let cancel = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(ExecutionContext::new(request.input.clone()));
        let (result_tx, result_rx) = watch::channel(None);

        self.instances.insert(
            handle.instance_id,
            InstanceEntry {
                service_id,
                cancel: cancel.clone(),
                snapshot: snapshot_rx,
                result: result_rx,
            },
        );

        tracing::info!(
            instance_id = %handle.instance_id,
            service_id = %service_id,
            version_id = %version.id,
            version = version.number,
            correlation_id = ?metadata.correlation_id,
            "instance submitted"
        );

        let engine = Arc::clone(&self.engine);
        let input = request.input;
        tokio::spawn(async move {
            let instance_id = metadata.instance_id;
            let result = engine
                .execute(
                    InstanceRun {
                        metadata,
                        graph: &version.graph,
                        policy: &version.error_policy,
                        input,
                    },
                    &cancel,
                    &snapshot_tx,
                )
                .await;
            engine.host().release_instance(instance_id);
            let _ = result_tx.send(Some(Arc::new(result)));
        });

        Ok(handle)
    }

    /// Current context snapshot of an instance, running or finished.
    pub fn query(&self, instance_id: InstanceId) -> Result<ExecutionContext, RuntimeError> {
        let entry = self.entry(instance_id)?;
        let snapshot = entry.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Terminal result if the instance has finished.
    pub fn result(&self, instance_id: InstanceId) -> Result<Option<ServiceExecutionResult>, RuntimeError> {
        let entry = self.entry(instance_id)?;
        let result = entry.result.borrow().as_deref().cloned();
        Ok(result)
    }

    /// Deliver an external signal to an instance.
    pub fn signal(&self, instance_id: InstanceId, name: &str, payload: Value) -> Result<(), RuntimeError> {
        let entry = self.entry(instance_id)?;
        if !entry.is_active() {
            return Err(RuntimeError::Host(HostError::Signal(format!(
                "instance {instance_id} has already finished"
            ))));
        }
        drop(entry);

        tracing::debug!(instance_id = %instance_id, signal = name, "delivering signal");
        self.engine.host().deliver_signal(instance_id, name, payload)?;
        Ok(())
    }

    /// Request cancellation. In-flight timers, signal waits and branches are
    /// abandoned and the instance finishes failed or compensated.
    pub fn cancel(&self, instance_id: InstanceId) -> Result<(), RuntimeError> {
        let entry = self.entry(instance_id)?;
        tracing::info!(instance_id = %instance_id, "cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Wait for the terminal result.
    pub async fn wait(&self, instance_id: InstanceId) -> Result<ServiceExecutionResult, RuntimeError> {
        // Clone the receiver so no map guard is held across the await.
        let mut rx = self.entry(instance_id)?.result.clone();
        let result = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RuntimeError::Aborted(instance_id))?
            .as_deref()
            .cloned();
        result.ok_or(RuntimeError::Aborted(instance_id))
    }

    /// Number of unfinished instances started from a definition.
    pub fn active_instance_count(&self, service_id: ServiceId) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.service_id == service_id && entry.is_active())
            .count()
    }

    /// Drop bookkeeping for a finished instance. Running instances are kept.
    pub fn forget(&self, instance_id: InstanceId) -> bool {
        self.instances
            .remove_if(&instance_id, |_, entry| !entry.is_active())
            .is_some()
    }

    /// Cancel every unfinished instance.
    pub fn cancel_all(&self) {
        for entry in self.instances.iter().filter(|e| e.is_active()) {
            entry.cancel.cancel();
        }
    }

    fn entry(
        &self,
        instance_id: InstanceId,
    ) -> Result<dashmap::mapref::one::Ref<'_, InstanceId, InstanceEntry>, RuntimeError> {
        self.instances
            .get(&instance_id)
            .ok_or(RuntimeError::InstanceNotFound(instance_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::json;

    use sce_types::config::EngineConfig;
    use sce_types::execution::{ErrorCode, ExecutionStatus, Variables};
    use sce_types::ids::{TenantId, UserId};
    use sce_types::service::ServiceCategory;
    use sce_types::workflow::{NodeType, WorkflowEdge, WorkflowNode};

    use crate::event::EventBus;
    use crate::repository::service::ServiceFilter;
    use crate::service::definition::ServiceDefinition;
    use crate::workflow::test_host::ScriptedHost;

    #[derive(Default)]
    struct MapRepo {
        rows: Mutex<HashMap<ServiceId, ServiceDefinition>>,
    }

    impl ServiceDefinitionRepository for MapRepo {
        async fn create(&self, definition: &ServiceDefinition) -> Result<(), RepositoryError> {
            self.rows.lock().unwrap().insert(definition.id(), definition.clone());
            Ok(())
        }

        async fn get_by_id(&self, id: &ServiceId) -> Result<Option<ServiceDefinition>, RepositoryError> {
            Ok(self.rows.lock().unwrap().get(id).cloned())
        }

        async fn list(&self, _filter: Option<ServiceFilter>) -> Result<Vec<ServiceDefinition>, RepositoryError> {
            Ok(self.rows.lock().unwrap().values().cloned().collect())
        }

        async fn update(&self, definition: &ServiceDefinition) -> Result<(), RepositoryError> {
            self.rows.lock().unwrap().insert(definition.id(), definition.clone());
            Ok(())
        }

        async fn delete(&self, id: &ServiceId) -> Result<(), RepositoryError> {
            self.rows.lock().unwrap().remove(id);
            Ok(())
        }
    }

    fn definition(tenant: TenantId, second: WorkflowNode) -> ServiceDefinition {
        let mut def = ServiceDefinition::new(tenant, "Expense approval", ServiceCategory::Finance, UserId::new()).unwrap();
        def.add_workflow_node(WorkflowNode::new("start", NodeType::Start, "Start"))
            .unwrap();
        let second_id = second.id.clone();
        def.add_workflow_node(second).unwrap();
        def.add_workflow_edge(WorkflowEdge::new("start", second_id))
            .unwrap();
        def
    }

    fn runtime(host: ScriptedHost, defs: Vec<ServiceDefinition>) -> WorkflowRuntime<MapRepo> {
        let engine = WorkflowEngine::new(Arc::new(host), EngineConfig::default(), EventBus::new(64));
        let repo = MapRepo::default();
        for def in defs {
            repo.rows.lock().unwrap().insert(def.id(), def);
        }
        WorkflowRuntime::new(Arc::new(engine), repo)
    }

    fn input() -> Variables {
        match json!({ "amount": 250 }) {
            Value::Object(map) => map,
            _ => Variables::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let tenant = TenantId::new();
        let mut def = definition(tenant, WorkflowNode::new("end", NodeType::End, "End"));
        def.publish("v1", UserId::new()).unwrap();
        let service_id = def.id();
        let rt = runtime(ScriptedHost::new(), vec![def]);

        let handle = rt
            .submit(ExecutionRequest::new(service_id, tenant, input()))
            .await
            .unwrap();
        let result = rt.wait(handle.instance_id).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.instance_id, handle.instance_id);
        assert_eq!(rt.query(handle.instance_id).unwrap().variables["amount"], json!(250));
        assert_eq!(rt.active_instance_count(service_id), 0);
        assert!(rt.result(handle.instance_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_submit_rejects_draft_and_deprecated() {
        let tenant = TenantId::new();
        let draft = definition(tenant, WorkflowNode::new("end", NodeType::End, "End"));
        let draft_id = draft.id();
        let mut deprecated = definition(tenant, WorkflowNode::new("end", NodeType::End, "End"));
        deprecated.publish("v1", UserId::new()).unwrap();
        deprecated.deprecate("old", None).unwrap();
        let deprecated_id = deprecated.id();
        let rt = runtime(ScriptedHost::new(), vec![draft, deprecated]);

        let err = rt
            .submit(ExecutionRequest::new(draft_id, tenant, Variables::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NotPublished(_)));

        let err = rt
            .submit(ExecutionRequest::new(deprecated_id, tenant, Variables::new()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::NotSelectable {
                status: ServiceStatus::Deprecated,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_submit_checks_tenant_and_version() {
        let tenant = TenantId::new();
        let mut def = definition(tenant, WorkflowNode::new("end", NodeType::End, "End"));
        def.publish("v1", UserId::new()).unwrap();
        let service_id = def.id();
        let rt = runtime(ScriptedHost::new(), vec![def]);

        let err = rt
            .submit(ExecutionRequest::new(service_id, TenantId::new(), Variables::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ServiceNotFound(_)));

        let mut request = ExecutionRequest::new(service_id, tenant, Variables::new());
        request.version_id = Some(VersionId::new());
        let err = rt.submit(request).await.unwrap_err();
        assert!(matches!(err, RuntimeError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_signal_resumes_human_task() {
        let tenant = TenantId::new();
        let mut def = definition(tenant, WorkflowNode::new("approve", NodeType::HumanTask, "Approve"));
        def.publish("v1", UserId::new()).unwrap();
        let service_id = def.id();
        let rt = runtime(ScriptedHost::new(), vec![def]);

        let handle = rt
            .submit(ExecutionRequest::new(service_id, tenant, Variables::new()))
            .await
            .unwrap();
        rt.signal(handle.instance_id, "human_task_approve", json!({ "approved": true }))
            .unwrap();
        let result = rt.wait(handle.instance_id).await.unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.output["response"]["approved"], json!(true));
    }

    #[tokio::test]
    async fn test_cancel_finishes_instance() {
        let tenant = TenantId::new();
        let node = WorkflowNode::new("slow", NodeType::Activity, "Slow").with_config("activity_name", json!("Slow"));
        let mut def = definition(tenant, node);
        def.publish("v1", UserId::new()).unwrap();
        let service_id = def.id();
        let rt = runtime(ScriptedHost::new().with_hanging_activity("Slow"), vec![def]);

        let handle = rt
            .submit(ExecutionRequest::new(service_id, tenant, Variables::new()))
            .await
            .unwrap();
        assert_eq!(rt.active_instance_count(service_id), 1);

        rt.cancel(handle.instance_id).unwrap();
        let result = rt.wait(handle.instance_id).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().code, ErrorCode::Cancelled);
        assert_eq!(rt.active_instance_count(service_id), 0);
        assert!(rt.forget(handle.instance_id));
        assert!(matches!(
            rt.query(handle.instance_id),
            Err(RuntimeError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_stops_every_running_instance() {
        let tenant = TenantId::new();
        let node = WorkflowNode::new("slow", NodeType::Activity, "Slow").with_config("activity_name", json!("Slow"));
        let mut def = definition(tenant, node);
        def.publish("v1", UserId::new()).unwrap();
        let service_id = def.id();
        let rt = runtime(ScriptedHost::new().with_hanging_activity("Slow"), vec![def]);

        let first = rt
            .submit(ExecutionRequest::new(service_id, tenant, Variables::new()))
            .await
            .unwrap();
        let second = rt
            .submit(ExecutionRequest::new(service_id, tenant, Variables::new()))
            .await
            .unwrap();
        assert_eq!(rt.active_instance_count(service_id), 2);
        assert!(!rt.forget(first.instance_id));

        rt.cancel_all();
        for handle in [first, second] {
            let result = rt.wait(handle.instance_id).await.unwrap();
            assert_eq!(result.error.unwrap().code, ErrorCode::Cancelled);
            assert!(rt.forget(handle.instance_id));
        }
        assert_eq!(rt.active_instance_count(service_id), 0);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let rt = runtime(ScriptedHost::new(), vec![]);
        let id = InstanceId::new();
        assert!(matches!(rt.query(id), Err(RuntimeError::InstanceNotFound(_))));
        assert!(matches!(rt.cancel(id), Err(RuntimeError::InstanceNotFound(_))));
        assert!(matches!(
            rt.signal(id, "continue", json!(null)),
            Err(RuntimeError::InstanceNotFound(_))
        ));
    }
}
