//! Value types owned by the service definition aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::fmt;
use std::str::FromStr;

use crate::error::DefinitionError;
use crate::ids::{TenantId, UserId, VersionId};
use crate::workflow::WorkflowGraph;

/// Minimum service name length in characters.
pub const SERVICE_NAME_MIN_LEN: usize = 3;
/// Maximum service name length in characters.
pub const SERVICE_NAME_MAX_LEN: usize = 100;

/// A validated service name (3 to 100 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    pub fn new(name: impl Into<String>) -> Result<Self, DefinitionError> {
        let name = name.into();
        let len = name.chars().count();
        if !(SERVICE_NAME_MIN_LEN..=SERVICE_NAME_MAX_LEN).contains(&len) {
            return Err(DefinitionError::validation(format!(
                "service name must be between {SERVICE_NAME_MIN_LEN} and {SERVICE_NAME_MAX_LEN} characters, got {len}"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceName {
    type Error = DefinitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Business domain a service belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceCategory {
    Order,
    Fulfillment,
    Finance,
    Payment,
    Inventory,
    Logistics,
    Analytics,
    Integration,
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceCategory::Order => "ORDER",
            ServiceCategory::Fulfillment => "FULFILLMENT",
            ServiceCategory::Finance => "FINANCE",
            ServiceCategory::Payment => "PAYMENT",
            ServiceCategory::Inventory => "INVENTORY",
            ServiceCategory::Logistics => "LOGISTICS",
            ServiceCategory::Analytics => "ANALYTICS",
            ServiceCategory::Integration => "INTEGRATION",
        };
        f.write_str(s)
    }
}

impl FromStr for ServiceCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ORDER" => Ok(ServiceCategory::Order),
            "FULFILLMENT" => Ok(ServiceCategory::Fulfillment),
            "FINANCE" => Ok(ServiceCategory::Finance),
            "PAYMENT" => Ok(ServiceCategory::Payment),
            "INVENTORY" => Ok(ServiceCategory::Inventory),
            "LOGISTICS" => Ok(ServiceCategory::Logistics),
            "ANALYTICS" => Ok(ServiceCategory::Analytics),
            "INTEGRATION" => Ok(ServiceCategory::Integration),
            other => Err(format!("invalid service category: '{other}'")),
        }
    }
}

/// Service definition lifecycle states.
///
/// Transitions are strictly forward: Draft -> Published -> Deprecated -> Archived,
/// with Archive also accepted directly from Published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Draft,
    Published,
    Deprecated,
    Archived,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Draft => write!(f, "draft"),
            ServiceStatus::Published => write!(f, "published"),
            ServiceStatus::Deprecated => write!(f, "deprecated"),
            ServiceStatus::Archived => write!(f, "archived"),
        }
    }
}

impl FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(ServiceStatus::Draft),
            "published" => Ok(ServiceStatus::Published),
            "deprecated" => Ok(ServiceStatus::Deprecated),
            "archived" => Ok(ServiceStatus::Archived),
            other => Err(format!("invalid service status: '{other}'")),
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Draft
    }
}

/// What the engine does when a node fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Terminate the instance immediately.
    #[default]
    Fail,
    /// Hand off to the compensation workflow and finish as compensated.
    Compensate,
    /// Record the failure and keep going.
    Ignore,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnError::Fail => write!(f, "fail"),
            OnError::Compensate => write!(f, "compensate"),
            OnError::Ignore => write!(f, "ignore"),
        }
    }
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(OnError::Fail),
            "compensate" => Ok(OnError::Compensate),
            "ignore" => Ok(OnError::Ignore),
            other => Err(format!("invalid error policy: '{other}'")),
        }
    }
}

/// Workflow-level error policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandlingPolicy {
    #[serde(default)]
    pub on_error: OnError,
    /// Name of the rollback workflow. Only consulted under `compensate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation_workflow: Option<String>,
}

impl ErrorHandlingPolicy {
    pub fn fail() -> Self {
        Self::default()
    }

    pub fn ignore() -> Self {
        Self {
            on_error: OnError::Ignore,
            compensation_workflow: None,
        }
    }

    pub fn compensate(workflow: impl Into<String>) -> Self {
        Self {
            on_error: OnError::Compensate,
            compensation_workflow: Some(workflow.into()),
        }
    }
}

/// An immutable snapshot taken on publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceVersion {
    pub id: VersionId,
    /// 1-based, increments with each publish.
    pub number: u32,
    pub change_note: String,
    pub graph: WorkflowGraph,
    pub error_policy: ErrorHandlingPolicy,
    pub published_at: DateTime<Utc>,
    pub published_by: UserId,
}

/// Request to author a new service definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServiceRequest {
    pub tenant_id: TenantId,
    pub name: String,
    pub category: ServiceCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_by: UserId,
}
