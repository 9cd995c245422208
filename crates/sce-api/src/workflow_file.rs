//! Workflow files and stub files read by the CLI.
//!
//! Both are YAML documents; JSON parses too since YAML is a superset.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

use sce_core::repository::service::ServiceDefinitionRepository;
use sce_core::service::{ServiceCatalog, ServiceDefinition};
use sce_types::execution::Variables;
use sce_types::ids::{TenantId, UserId};
use sce_types::service::{CreateServiceRequest, ErrorHandlingPolicy, ServiceCategory};
use sce_types::workflow::{WorkflowEdge, WorkflowNode};

/// A service and its workflow graph as authored on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowFile {
    pub name: String,
    #[serde(default = "default_category")]
    pub category: ServiceCategory,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_policy: ErrorHandlingPolicy,
    #[serde(default)]
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
}

fn default_category() -> ServiceCategory {
    ServiceCategory::Integration
}

/// Canned answer for one activity or workflow name.
#[derive(Debug, Clone, PartialEq)]
pub enum Stub {
    Output(Value),
    Failure(String),
}

pub fn parse_workflow_file(content: &str) -> Result<WorkflowFile> {
    serde_yaml_ng::from_str(content).context("failed to parse workflow file")
}

pub async fn load_workflow_file(path: &Path) -> Result<WorkflowFile> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_workflow_file(&content).with_context(|| format!("in {}", path.display()))
}

/// Parse a stub file: a mapping of name to output, where `{error: msg}`
/// scripts a failure instead.
pub fn parse_stubs(content: &str) -> Result<BTreeMap<String, Stub>> {
    let raw: BTreeMap<String, Value> =
        serde_yaml_ng::from_str(content).context("failed to parse stub file")?;

    Ok(raw
        .into_iter()
        .map(|(name, value)| {
            let stub = match value.as_object() {
                Some(obj) if obj.len() == 1 && obj.contains_key("error") => {
                    let message = match &obj["error"] {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Stub::Failure(message)
                }
                _ => Stub::Output(value),
            };
            (name, stub)
        })
        .collect())
}

pub async fn load_stubs(path: &Path) -> Result<BTreeMap<String, Stub>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_stubs(&content).with_context(|| format!("in {}", path.display()))
}

/// Parse `--input` into a variable map. Must be a JSON object.
pub fn parse_input(raw: &str) -> Result<Variables> {
    match serde_json::from_str::<Value>(raw).context("--input is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--input must be a JSON object, got {other}"),
    }
}

/// Parse a `NAME=JSON` signal argument. A payload that is not JSON is taken
/// as a plain string.
pub fn parse_signal(raw: &str) -> Result<(String, Value)> {
    let Some((name, payload)) = raw.split_once('=') else {
        bail!("signal '{raw}' must look like NAME=JSON");
    };
    let name = name.trim();
    if name.is_empty() {
        bail!("signal '{raw}' has an empty name");
    }
    let payload = serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
    Ok((name.to_string(), payload))
}

/// Replay a workflow file through the authoring operations, leaving a draft.
pub async fn author_definition<R: ServiceDefinitionRepository>(
    catalog: &ServiceCatalog<R>,
    file: WorkflowFile,
    tenant_id: TenantId,
    author: UserId,
) -> Result<ServiceDefinition> {
    let (definition, _) = catalog
        .create_service(CreateServiceRequest {
            tenant_id,
            name: file.name,
            category: file.category,
            description: file.description,
            created_by: author,
        })
        .await?;
    let id = definition.id();

    for node in file.nodes {
        let node_id = node.id.clone();
        catalog
            .add_node(id, node)
            .await
            .with_context(|| format!("node '{node_id}'"))?;
    }
    for edge in file.edges {
        let label = format!("{} -> {}", edge.source, edge.target);
        catalog
            .add_edge(id, edge)
            .await
            .with_context(|| format!("edge {label}"))?;
    }
    catalog.set_error_policy(id, file.error_policy).await?;

    Ok(catalog.get(id).await?)
}
