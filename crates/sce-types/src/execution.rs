//! Execution value types: per-instance context, node results and the
//! terminal result of one workflow instance.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{InstanceId, ServiceId, TenantId, UserId, VersionId};

/// Variable bag shared by the nodes of one instance.
pub type Variables = Map<String, Value>;

// ---------------------------------------------------------------------------
// Errors carried in results
// ---------------------------------------------------------------------------

/// Stable error codes carried by `ExecutionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The graph contains a cycle or is otherwise not executable.
    InvalidWorkflow,
    /// A node's external call failed after its retry policy was exhausted.
    ExecutionError,
    /// Rollback was handed off to the compensation workflow.
    Compensated,
    /// The instance was cancelled by the caller.
    Cancelled,
    /// The compensation hand-off itself failed.
    CompensationFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidWorkflow => "INVALID_WORKFLOW",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::Compensated => "COMPENSATED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::CompensationFailed => "COMPENSATION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error attached to a failed node or a non-completed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    /// The node the error originated from, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            node_id: None,
        }
    }

    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "[{}] {} (node '{}')", self.code, self.message, node),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Node results
// ---------------------------------------------------------------------------

/// Terminal status of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Completed => write!(f, "completed"),
            NodeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of dispatching one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub output: Variables,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl NodeResult {
    pub fn is_failed(&self) -> bool {
        self.status == NodeStatus::Failed
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Transient state of one running instance.
///
/// Owned exclusively by the instance; callers only ever see cloned snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeResult>,
}

impl ExecutionContext {
    pub fn new(input: Variables) -> Self {
        Self {
            variables: input,
            node_results: BTreeMap::new(),
        }
    }

    /// Merge a node's output into the variables. Later writes win.
    pub fn merge_output(&mut self, output: &Variables) {
        for (key, value) in output {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    pub fn record(&mut self, result: NodeResult) {
        self.node_results.insert(result.node_id.clone(), result);
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.node_results.get(node_id)
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Terminal status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Compensated,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Compensated => write!(f, "compensated"),
        }
    }
}

/// Request to start a new instance of a published service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub service_id: ServiceId,
    /// Specific version to run. Defaults to the active version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub input: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<UserId>,
}

impl ExecutionRequest {
    pub fn new(service_id: ServiceId, tenant_id: TenantId, input: Variables) -> Self {
        Self {
            service_id,
            version_id: None,
            tenant_id,
            input,
            correlation_id: None,
            initiated_by: None,
        }
    }
}

/// Identity and provenance of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub instance_id: InstanceId,
    pub service_id: ServiceId,
    pub version_id: VersionId,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<UserId>,
}

/// Terminal result of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceExecutionResult {
    pub instance_id: InstanceId,
    pub status: ExecutionStatus,
    /// Final variable set.
    #[serde(default)]
    pub output: Variables,
    #[serde(default)]
    pub node_results: BTreeMap<String, NodeResult>,
    /// Nodes not executed because no incoming edge was taken, in execution order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_nodes: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}
