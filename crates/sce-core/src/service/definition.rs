//! The service definition aggregate.
//!
//! A `ServiceDefinition` owns its workflow graph while in Draft and governs
//! promotion through Draft -> Published -> Deprecated -> Archived. Every
//! mutating call returns the domain event it emitted and also appends it to
//! an in-memory tail that `take_events` drains for an external event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sce_types::error::DefinitionError;
use sce_types::event::ServiceEvent;
use sce_types::ids::{ServiceId, TenantId, UserId, VersionId};
use sce_types::service::{
    ErrorHandlingPolicy, ServiceCategory, ServiceName, ServiceStatus, ServiceVersion,
};
use sce_types::workflow::{WorkflowEdge, WorkflowGraph, WorkflowNode};

use crate::workflow::graph::{GraphError, GraphIndex};
use crate::workflow::node::check_parallel_branches;

/// Aggregate root for a tenant-authored service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    id: ServiceId,
    tenant_id: TenantId,
    name: ServiceName,
    #[serde(default)]
    description: String,
    category: ServiceCategory,
    status: ServiceStatus,
    #[serde(default)]
    graph: WorkflowGraph,
    #[serde(default)]
    error_policy: ErrorHandlingPolicy,
    #[serde(default)]
    versions: Vec<ServiceVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_version: Option<VersionId>,
    created_by: UserId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    published_at: Option<DateTime<Utc>>,
    /// Events emitted since the last `take_events`. Never persisted with the
    /// aggregate itself.
    #[serde(skip)]
    pending_events: Vec<ServiceEvent>,
}

impl ServiceDefinition {
    /// Create a new definition in Draft and record `ServiceCreated`.
    pub fn new(
        tenant_id: TenantId,
        name: impl Into<String>,
        category: ServiceCategory,
        created_by: UserId,
    ) -> Result<Self, DefinitionError> {
        let name = ServiceName::new(name)?;
        let now = Utc::now();
        let id = ServiceId::new();

        let mut definition = Self {
            id,
            tenant_id,
            name: name.clone(),
            description: String::new(),
            category,
            status: ServiceStatus::Draft,
            graph: WorkflowGraph::new(),
            error_policy: ErrorHandlingPolicy::default(),
            versions: Vec::new(),
            active_version: None,
            created_by,
            created_at: now,
            updated_at: now,
            published_at: None,
            pending_events: Vec::new(),
        };
        definition.record(ServiceEvent::Created {
            service_id: id,
            tenant_id,
            name: name.into(),
            category,
            created_by,
            occurred_at: now,
        });
        Ok(definition)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    // -- accessors ----------------------------------------------------------

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn category(&self) -> ServiceCategory {
        self.category
    }

    pub fn status(&self) -> ServiceStatus {
        self.status
    }

    /// The draft graph, or the graph as it was at the last publish.
    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn error_policy(&self) -> &ErrorHandlingPolicy {
        &self.error_policy
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        self.published_at
    }

    /// Published versions, oldest first.
    pub fn versions(&self) -> &[ServiceVersion] {
        &self.versions
    }

    pub fn version(&self, id: VersionId) -> Option<&ServiceVersion> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn active_version(&self) -> Option<&ServiceVersion> {
        self.active_version.and_then(|id| self.version(id))
    }

    /// Whether new instances may be started from this definition.
    pub fn is_selectable(&self) -> bool {
        self.status == ServiceStatus::Published
    }

    pub fn pending_events(&self) -> &[ServiceEvent] {
        &self.pending_events
    }

    /// Drain the events emitted since the last call.
    pub fn take_events(&mut self) -> Vec<ServiceEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // -- authoring ----------------------------------------------------------

    /// Add a node to the draft graph.
    pub fn add_workflow_node(&mut self, node: WorkflowNode) -> Result<ServiceEvent, DefinitionError> {
        self.ensure_draft("modify workflow")?;
        if node.id.trim().is_empty() {
            return Err(DefinitionError::validation("node id must not be empty"));
        }
        if self.graph.contains_node(&node.id) {
            return Err(DefinitionError::validation(format!(
                "node '{}' already exists",
                node.id
            )));
        }

        let event = ServiceEvent::WorkflowNodeAdded {
            service_id: self.id,
            node_id: node.id.clone(),
            node_type: node.node_type.to_string(),
            occurred_at: Utc::now(),
        };
        self.graph.nodes.push(node);
        self.touch();
        Ok(self.record(event))
    }

    /// Add an edge between two existing nodes of the draft graph.
    pub fn add_workflow_edge(&mut self, edge: WorkflowEdge) -> Result<ServiceEvent, DefinitionError> {
        self.ensure_draft("modify workflow")?;
        for endpoint in [&edge.source, &edge.target] {
            if !self.graph.contains_node(endpoint) {
                return Err(DefinitionError::validation(format!(
                    "edge {} -> {} references unknown node '{}'",
                    edge.source, edge.target, endpoint
                )));
            }
        }
        if let Some(id) = edge.id.as_deref() {
            if self.graph.edges.iter().any(|e| e.id.as_deref() == Some(id)) {
                return Err(DefinitionError::validation(format!("edge '{id}' already exists")));
            }
        }

        let event = ServiceEvent::WorkflowEdgeAdded {
            service_id: self.id,
            source: edge.source.clone(),
            target: edge.target.clone(),
            occurred_at: Utc::now(),
        };
        self.graph.edges.push(edge);
        self.touch();
        Ok(self.record(event))
    }

    /// Replace the workflow-level error policy.
    pub fn set_error_policy(&mut self, policy: ErrorHandlingPolicy) -> Result<(), DefinitionError> {
        self.ensure_draft("change error policy")?;
        self.error_policy = policy;
        self.touch();
        Ok(())
    }

    /// Check the structural invariants a graph must satisfy to be published.
    ///
    /// Pure: calling it repeatedly on an unchanged graph gives the same answer.
    pub fn validate_workflow(&self) -> Result<(), DefinitionError> {
        if !self.graph.has_nodes() {
            return Err(DefinitionError::validation("workflow has no nodes"));
        }
        if !self.graph.has_start_node() {
            return Err(DefinitionError::validation("workflow has no start node"));
        }

        let index = GraphIndex::build(&self.graph).map_err(structural_error)?;
        index.execution_order().map_err(structural_error)?;
        check_parallel_branches(&self.graph).map_err(|e| DefinitionError::validation(e.to_string()))?;

        let unreachable = index.unreachable_from_start();
        if !unreachable.is_empty() {
            tracing::warn!(
                service_id = %self.id,
                nodes = ?unreachable,
                "workflow has nodes unreachable from any start node"
            );
        }
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Validate and freeze the graph as a new version, Draft -> Published.
    pub fn publish(
        &mut self,
        change_note: impl Into<String>,
        published_by: UserId,
    ) -> Result<ServiceEvent, DefinitionError> {
        if self.status != ServiceStatus::Draft {
            return Err(DefinitionError::state(format!(
                "cannot publish: service is {}",
                self.status
            )));
        }
        self.validate_workflow()?;

        let now = Utc::now();
        let change_note = change_note.into();
        let version = ServiceVersion {
            id: VersionId::new(),
            number: self.versions.len() as u32 + 1,
            change_note: change_note.clone(),
            graph: self.graph.clone(),
            error_policy: self.error_policy.clone(),
            published_at: now,
            published_by,
        };
        let event = ServiceEvent::Published {
            service_id: self.id,
            version_id: version.id,
            version_number: version.number,
            change_note,
            published_by,
            occurred_at: now,
        };

        tracing::info!(
            service_id = %self.id,
            version_id = %version.id,
            version = version.number,
            "service published"
        );
        self.active_version = Some(version.id);
        self.versions.push(version);
        self.status = ServiceStatus::Published;
        self.published_at = Some(now);
        self.updated_at = now;
        Ok(self.record(event))
    }

    /// Stop new instances from selecting this definition, Published -> Deprecated.
    pub fn deprecate(
        &mut self,
        reason: impl Into<String>,
        superseded_by: Option<ServiceId>,
    ) -> Result<ServiceEvent, DefinitionError> {
        if self.status != ServiceStatus::Published {
            return Err(DefinitionError::state(format!(
                "cannot deprecate: service is {}",
                self.status
            )));
        }

        let now = Utc::now();
        self.status = ServiceStatus::Deprecated;
        self.updated_at = now;
        Ok(self.record(ServiceEvent::Deprecated {
            service_id: self.id,
            reason: reason.into(),
            superseded_by,
            occurred_at: now,
        }))
    }

    /// Retire the definition. Allowed from Published or Deprecated, and only
    /// when the caller attests that no instance references it.
    pub fn archive(&mut self, active_instance_count: usize) -> Result<ServiceEvent, DefinitionError> {
        if !matches!(
            self.status,
            ServiceStatus::Published | ServiceStatus::Deprecated
        ) {
            return Err(DefinitionError::state(format!(
                "cannot archive: service is {}",
                self.status
            )));
        }
        if active_instance_count > 0 {
            return Err(DefinitionError::state(format!(
                "cannot archive: {active_instance_count} active workflow instances"
            )));
        }

        let now = Utc::now();
        self.status = ServiceStatus::Archived;
        self.updated_at = now;
        Ok(self.record(ServiceEvent::Archived {
            service_id: self.id,
            occurred_at: now,
        }))
    }

    // -- helpers ------------------------------------------------------------

    fn ensure_draft(&self, action: &str) -> Result<(), DefinitionError> {
        if self.status == ServiceStatus::Draft {
            Ok(())
        } else {
            Err(DefinitionError::state(format!(
                "cannot {action}: service is {}",
                self.status
            )))
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn record(&mut self, event: ServiceEvent) -> ServiceEvent {
        self.pending_events.push(event.clone());
        event
    }
}

fn structural_error(err: GraphError) -> DefinitionError {
    match err {
        GraphError::CycleDetected { .. } => DefinitionError::validation("workflow contains a cycle"),
        other => DefinitionError::validation(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
