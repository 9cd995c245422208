//! Domain and engine event types.
//!
//! `ServiceEvent` is the audit trail of the service definition aggregate,
//! returned from each mutating call for an external event store.
//! `EngineEvent` is broadcast on the engine event bus while instances run.
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::execution::{ExecutionError, ExecutionStatus};
use crate::ids::{InstanceId, ServiceId, TenantId, UserId, VersionId};
use crate::service::ServiceCategory;

/// Events emitted by the service definition aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum ServiceEvent {
    #[serde(rename = "service.created")]
    Created {
        service_id: ServiceId,
        tenant_id: TenantId,
        name: String,
        category: ServiceCategory,
        created_by: UserId,
        occurred_at: DateTime<Utc>,
    },

    #[serde(rename = "service.workflow_node_added")]
    WorkflowNodeAdded {
        service_id: ServiceId,
        node_id: String,
        node_type: String,
        occurred_at: DateTime<Utc>,
    },

    #[serde(rename = "service.workflow_edge_added")]
    WorkflowEdgeAdded {
        service_id: ServiceId,
        source: String,
        target: String,
        occurred_at: DateTime<Utc>,
    },

    #[serde(rename = "service.published")]
    Published {
        service_id: ServiceId,
        version_id: VersionId,
        version_number: u32,
        change_note: String,
        published_by: UserId,
        occurred_at: DateTime<Utc>,
    },

    #[serde(rename = "service.deprecated")]
    Deprecated {
        service_id: ServiceId,
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        superseded_by: Option<ServiceId>,
        occurred_at: DateTime<Utc>,
    },

    #[serde(rename = "service.archived")]
    Archived {
        service_id: ServiceId,
        occurred_at: DateTime<Utc>,
    },
}

impl ServiceEvent {
    /// Stable event type string, identical to the serialized tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            ServiceEvent::Created { .. } => "service.created",
            ServiceEvent::WorkflowNodeAdded { .. } => "service.workflow_node_added",
            ServiceEvent::WorkflowEdgeAdded { .. } => "service.workflow_edge_added",
            ServiceEvent::Published { .. } => "service.published",
            ServiceEvent::Deprecated { .. } => "service.deprecated",
            ServiceEvent::Archived { .. } => "service.archived",
        }
    }

    pub fn service_id(&self) -> ServiceId {
        match self {
            ServiceEvent::Created { service_id, .. }
            | ServiceEvent::WorkflowNodeAdded { service_id, .. }
            | ServiceEvent::WorkflowEdgeAdded { service_id, .. }
            | ServiceEvent::Published { service_id, .. }
            | ServiceEvent::Deprecated { service_id, .. }
            | ServiceEvent::Archived { service_id, .. } => *service_id,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ServiceEvent::Created { occurred_at, .. }
            | ServiceEvent::WorkflowNodeAdded { occurred_at, .. }
            | ServiceEvent::WorkflowEdgeAdded { occurred_at, .. }
            | ServiceEvent::Published { occurred_at, .. }
            | ServiceEvent::Deprecated { occurred_at, .. }
            | ServiceEvent::Archived { occurred_at, .. } => *occurred_at,
        }
    }
}

/// Events emitted while workflow instances execute.
///
/// Used by the event bus to report instance and node lifecycle to
/// subscribers (CLI progress, logging, external monitors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InstanceStarted {
        instance_id: InstanceId,
        service_id: ServiceId,
        version_id: VersionId,
    },

    NodeStarted {
        instance_id: InstanceId,
        node_id: String,
        node_type: String,
    },

    NodeCompleted {
        instance_id: InstanceId,
        node_id: String,
    },

    NodeFailed {
        instance_id: InstanceId,
        node_id: String,
        error: String,
    },

    /// No incoming edge of the node was taken.
    NodeSkipped {
        instance_id: InstanceId,
        node_id: String,
    },

    InstanceFinished {
        instance_id: InstanceId,
        status: ExecutionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ExecutionError>,
    },
}

impl EngineEvent {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            EngineEvent::InstanceStarted { instance_id, .. }
            | EngineEvent::NodeStarted { instance_id, .. }
            | EngineEvent::NodeCompleted { instance_id, .. }
            | EngineEvent::NodeFailed { instance_id, .. }
            | EngineEvent::NodeSkipped { instance_id, .. }
            | EngineEvent::InstanceFinished { instance_id, .. } => *instance_id,
        }
    }

    /// The node this event concerns, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            EngineEvent::NodeStarted { node_id, .. }
            | EngineEvent::NodeCompleted { node_id, .. }
            | EngineEvent::NodeFailed { node_id, .. }
            | EngineEvent::NodeSkipped { node_id, .. } => Some(node_id),
            EngineEvent::InstanceStarted { .. } | EngineEvent::InstanceFinished { .. } => None,
        }
    }
}
