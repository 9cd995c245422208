//! Node dispatch for the closed set of workflow node types.
//!
//! `NodeKind::parse` turns a `WorkflowNode` (type string plus free-form config)
//! into a typed variant, failing early on missing configuration. Each variant
//! is then executed against a `DispatchContext` that carries the durable host
//! explicitly. Dispatch never touches the wall clock or sleeps directly.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{Value, json};

use sce_types::config::EngineConfig;
use sce_types::execution::{ErrorCode, ExecutionError, NodeResult, NodeStatus, Variables};
use sce_types::ids::InstanceId;
use sce_types::workflow::{NodeType, RetryPolicy, WorkflowGraph, WorkflowNode};

use super::context::{build_node_input, interpolate, output_to_variables};
use super::expression::{ExpressionError, WorkflowEvaluator};
use super::host::{ActivityCall, ChildWorkflowCall, DurableHost, HostError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const DEFAULT_AI_PROVIDER: &str = "anthropic";
pub const DEFAULT_AI_MODEL: &str = "claude-3-sonnet";
pub const DEFAULT_AI_MAX_TOKENS: u64 = 1000;
pub const DEFAULT_AI_TEMPERATURE: f64 = 0.7;

/// Activity names for AI calls.
pub const CALL_LLM_ACTIVITY: &str = "CallLLM";
pub const LOCAL_MODEL_ACTIVITY: &str = "LocalModelInference";
/// Activity name for external automation calls.
pub const EXECUTE_AUTOMATION_ACTIVITY: &str = "ExecuteAutomation";

pub const DEFAULT_SIGNAL_NAME: &str = "continue";
pub const DEFAULT_HUMAN_TASK_TYPE: &str = "approval";
pub const DEFAULT_HUMAN_TASK_TITLE: &str = "Task";
pub const HUMAN_TASK_TIMEOUT_MESSAGE: &str = "Human task timed out";

/// Signal name a human task listens on.
pub fn human_task_signal(node_id: &str) -> String {
    format!("human_task_{node_id}")
}

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Errors that can occur while dispatching a node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("unknown node type: {0}")]
    UnknownType(String),

    #[error("{node_type} node '{node}' missing {key}")]
    MissingConfig {
        node: String,
        node_type: String,
        key: &'static str,
    },

    #[error("node '{node}' has invalid {key}: {reason}")]
    InvalidConfig {
        node: String,
        key: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("wait for signal '{signal}' timed out")]
    SignalTimeout { signal: String },

    #[error("parallel branch '{branch}' failed: {message}")]
    BranchFailed { branch: String, message: String },

    #[error("parallel branch '{0}' cannot itself be a parallel node")]
    NestedParallel(String),
}

// ---------------------------------------------------------------------------
// DispatchContext
// ---------------------------------------------------------------------------

/// Everything a node needs to run, passed explicitly on every dispatch.
#[derive(Clone, Copy)]
pub struct DispatchContext<'a> {
    pub host: &'a dyn DurableHost,
    pub config: &'a EngineConfig,
    pub instance_id: InstanceId,
    pub graph: &'a WorkflowGraph,
    /// Read-only view of the instance variables at dispatch time.
    pub variables: &'a Variables,
}

// ---------------------------------------------------------------------------
// NodeKind
// ---------------------------------------------------------------------------

/// Wait node variants.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitSpec {
    Timer { seconds: u64 },
    Until { instant: DateTime<Utc> },
    Signal { name: String },
}

/// AI action configuration with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AiActionSpec {
    pub provider: String,
    pub model: String,
    pub prompt_template: String,
    pub use_local_model: bool,
    pub max_tokens: u64,
    pub temperature: f64,
}

/// Human task configuration with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct HumanTaskSpec {
    pub task_type: String,
    pub title: String,
    pub timeout_secs: u64,
}

/// Typed view of a workflow node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Start,
    End,
    Activity { activity_name: String },
    Subflow { workflow_name: String },
    AiAction(AiActionSpec),
    ExternalAutomation { automation_id: String },
    Decision { condition: Option<String> },
    Parallel { branches: Vec<String> },
    Wait(WaitSpec),
    HumanTask(HumanTaskSpec),
}

impl NodeKind {
    /// Parse a node's type and config, applying engine defaults.
    pub fn parse(node: &WorkflowNode, config: &EngineConfig) -> Result<Self, NodeError> {
        let missing = |key: &'static str| NodeError::MissingConfig {
            node: node.id.clone(),
            node_type: node.node_type.to_string(),
            key,
        };

        let kind = match &node.node_type {
            NodeType::Start => NodeKind::Start,
            NodeType::End => NodeKind::End,
            NodeType::Activity => NodeKind::Activity {
                activity_name: non_empty(node.config_str("activity_name"))
                    .ok_or_else(|| missing("activity_name"))?,
            },
            NodeType::Subflow => NodeKind::Subflow {
                workflow_name: non_empty(node.config_str("workflow_name"))
                    .ok_or_else(|| missing("workflow_name"))?,
            },
            NodeType::AiAction => NodeKind::AiAction(AiActionSpec {
                provider: node
                    .config_str("provider")
                    .unwrap_or(DEFAULT_AI_PROVIDER)
                    .to_string(),
                model: node.config_str("model").unwrap_or(DEFAULT_AI_MODEL).to_string(),
                prompt_template: node.config_str("prompt_template").unwrap_or("").to_string(),
                use_local_model: node.config_bool("use_local_model").unwrap_or(false),
                max_tokens: node.config_u64("max_tokens").unwrap_or(DEFAULT_AI_MAX_TOKENS),
                temperature: node.config_f64("temperature").unwrap_or(DEFAULT_AI_TEMPERATURE),
            }),
            NodeType::ExternalAutomation => NodeKind::ExternalAutomation {
                automation_id: non_empty(
                    node.config_str("automation_id")
                        .or_else(|| node.config_str("n8n_workflow_id")),
                )
                .ok_or_else(|| missing("automation_id"))?,
            },
            NodeType::Decision => NodeKind::Decision {
                condition: non_empty(node.config_str("condition")),
            },
            NodeType::Parallel => NodeKind::Parallel {
                branches: parse_branches(node)?,
            },
            NodeType::Wait => NodeKind::Wait(parse_wait(node, config)?),
            NodeType::HumanTask => NodeKind::HumanTask(HumanTaskSpec {
                task_type: node
                    .config_str("task_type")
                    .unwrap_or(DEFAULT_HUMAN_TASK_TYPE)
                    .to_string(),
                title: node
                    .config_str("title")
                    .unwrap_or(DEFAULT_HUMAN_TASK_TITLE)
                    .to_string(),
                timeout_secs: node
                    .config_u64("timeout_seconds")
                    .or(node.timeout_secs)
                    .unwrap_or(config.human_task_timeout_secs),
            }),
            NodeType::Other(other) => return Err(NodeError::UnknownType(other.clone())),
        };
        Ok(kind)
    }

    /// Execute the node.
    ///
    /// Parallel nodes push one `NodeResult` per dispatched branch into
    /// `branch_results`; every other kind leaves it untouched.
    pub async fn execute(
        &self,
        node: &WorkflowNode,
        cx: DispatchContext<'_>,
        branch_results: &mut Vec<NodeResult>,
    ) -> Result<Variables, NodeError> {
        match self {
            NodeKind::Parallel { branches } => execute_parallel(node, branches, cx, branch_results).await,
            other => other.execute_leaf(node, cx).await,
        }
    }

    async fn execute_leaf(&self, node: &WorkflowNode, cx: DispatchContext<'_>) -> Result<Variables, NodeError> {
        match self {
            NodeKind::Start | NodeKind::End => Ok(Variables::new()),

            NodeKind::Activity { activity_name } => {
                let call = ActivityCall {
                    instance_id: cx.instance_id,
                    node_id: node.id.clone(),
                    name: activity_name.clone(),
                    input: Value::Object(build_node_input(node, cx.variables)),
                    timeout: node_timeout(node, cx.config.default_activity_timeout_secs),
                    retry: retry_policy(node, cx.config),
                    task_queue: None,
                };
                tracing::info!(node_id = %node.id, activity = %activity_name, "executing activity node");
                let output = cx.host.execute_activity(call).await?;
                Ok(output_to_variables(output))
            }

            NodeKind::Subflow { workflow_name } => {
                tracing::info!(node_id = %node.id, workflow = %workflow_name, "starting subflow");
                let output = cx
                    .host
                    .start_child_workflow(ChildWorkflowCall {
                        parent_instance_id: cx.instance_id,
                        workflow_name: workflow_name.clone(),
                        input: Value::Object(build_node_input(node, cx.variables)),
                        wait_for_completion: true,
                    })
                    .await?;
                Ok(output_to_variables(output))
            }

            NodeKind::AiAction(spec) => {
                let prompt = interpolate(&spec.prompt_template, cx.variables);
                let name = if spec.use_local_model {
                    LOCAL_MODEL_ACTIVITY
                } else {
                    CALL_LLM_ACTIVITY
                };
                let call = ActivityCall {
                    instance_id: cx.instance_id,
                    node_id: node.id.clone(),
                    name: name.to_string(),
                    input: json!({
                        "provider": spec.provider,
                        "model": spec.model,
                        "prompt": prompt,
                        "use_local_model": spec.use_local_model,
                        "max_tokens": spec.max_tokens,
                        "temperature": spec.temperature,
                    }),
                    timeout: node_timeout(node, cx.config.ai_action_timeout_secs),
                    retry: retry_policy(node, cx.config),
                    task_queue: Some(cx.config.ai_task_queue.clone()),
                };
                tracing::info!(node_id = %node.id, provider = %spec.provider, model = %spec.model, "executing AI action node");
                let output = cx.host.execute_activity(call).await?;
                Ok(output_to_variables(output))
            }

            NodeKind::ExternalAutomation { automation_id } => {
                let call = ActivityCall {
                    instance_id: cx.instance_id,
                    node_id: node.id.clone(),
                    name: EXECUTE_AUTOMATION_ACTIVITY.to_string(),
                    input: json!({
                        "workflow_id": automation_id,
                        "input_data": build_node_input(node, cx.variables),
                        "wait_for_completion": true,
                    }),
                    timeout: node_timeout(node, cx.config.automation_timeout_secs),
                    retry: retry_policy(node, cx.config),
                    task_queue: Some(cx.config.integration_task_queue.clone()),
                };
                tracing::info!(node_id = %node.id, automation_id = %automation_id, "executing external automation node");
                let output = cx.host.execute_activity(call).await?;
                Ok(output_to_variables(output))
            }

            NodeKind::Decision { condition } => decide(node, condition.as_deref(), cx),

            NodeKind::Parallel { .. } => Err(NodeError::NestedParallel(node.id.clone())),

            NodeKind::Wait(spec) => execute_wait(node, spec, cx).await,

            NodeKind::HumanTask(spec) => {
                let signal = human_task_signal(&node.id);
                tracing::info!(node_id = %node.id, signal = %signal, timeout_secs = spec.timeout_secs, "waiting for human task");
                let response = cx
                    .host
                    .wait_signal(cx.instance_id, &signal, Some(Duration::from_secs(spec.timeout_secs)))
                    .await?
                    .unwrap_or_else(|| {
                        tracing::warn!(node_id = %node.id, "human task timed out");
                        json!({
                            "timeout": true,
                            "approved": false,
                            "message": HUMAN_TASK_TIMEOUT_MESSAGE,
                        })
                    });
                Ok(object(json!({
                    "task_type": spec.task_type,
                    "title": spec.title,
                    "response": response,
                })))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Edge selection
// ---------------------------------------------------------------------------

/// Evaluate the outgoing edges of `node_id`, in authoring order.
///
/// Returns `(edge position, taken)` pairs. An edge without a condition is
/// always taken; an edge whose condition fails to evaluate is not taken and
/// the error is reported alongside.
pub fn evaluate_outgoing(
    graph: &WorkflowGraph,
    node_id: &str,
    variables: &Variables,
) -> Vec<(usize, Result<bool, ExpressionError>)> {
    let evaluator = WorkflowEvaluator::new();
    graph
        .edges
        .iter()
        .enumerate()
        .filter(|(_, edge)| edge.source == node_id)
        .map(|(pos, edge)| {
            let taken = match edge.condition.as_deref().map(str::trim) {
                None | Some("") => Ok(true),
                Some(expr) => evaluator.evaluate_condition(expr, variables),
            };
            (pos, taken)
        })
        .collect()
}

/// Evaluate a decision's own condition.
///
/// The output holds `branch` and `condition` only when a condition is
/// configured. Successor selection happens once, in the engine, against the
/// instance variables overlaid with this output.
fn decide(node: &WorkflowNode, condition: Option<&str>, cx: DispatchContext<'_>) -> Result<Variables, NodeError> {
    let mut output = Variables::new();
    if let Some(expr) = condition {
        let branch = WorkflowEvaluator::new().evaluate_condition(expr, cx.variables)?;
        tracing::info!(node_id = %node.id, branch, "decision evaluated");
        output.insert("branch".to_string(), Value::Bool(branch));
        output.insert("condition".to_string(), Value::String(expr.to_string()));
    } else {
        tracing::info!(node_id = %node.id, "decision without condition, edges decide");
    }
    Ok(output)
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

async fn execute_wait(node: &WorkflowNode, spec: &WaitSpec, cx: DispatchContext<'_>) -> Result<Variables, NodeError> {
    match spec {
        WaitSpec::Timer { seconds } => {
            tracing::debug!(node_id = %node.id, seconds, "timer wait");
            cx.host.sleep(Duration::from_secs(*seconds)).await?;
            Ok(object(json!({ "waited": seconds })))
        }
        WaitSpec::Until { instant } => {
            let now = cx.host.now();
            if let Ok(remaining) = (*instant - now).to_std() {
                tracing::debug!(node_id = %node.id, until = %instant, "waiting until instant");
                cx.host.sleep(remaining).await?;
            }
            Ok(object(json!({ "waited_until": instant.to_rfc3339() })))
        }
        WaitSpec::Signal { name } => {
            let timeout = node.timeout_secs.map(Duration::from_secs);
            tracing::debug!(node_id = %node.id, signal = %name, "waiting for signal");
            let data = cx
                .host
                .wait_signal(cx.instance_id, name, timeout)
                .await?
                .ok_or_else(|| NodeError::SignalTimeout { signal: name.clone() })?;
            Ok(object(json!({ "signal": name, "data": data })))
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

async fn execute_parallel(
    node: &WorkflowNode,
    branches: &[String],
    cx: DispatchContext<'_>,
    branch_results: &mut Vec<NodeResult>,
) -> Result<Variables, NodeError> {
    // Validate every branch before dispatching any of them.
    let mut plans = Vec::with_capacity(branches.len());
    for branch_id in branches {
        let branch = cx.graph.node(branch_id).ok_or_else(|| NodeError::InvalidConfig {
            node: node.id.clone(),
            key: "branches",
            reason: format!("unknown branch node '{branch_id}'"),
        })?;
        let direct = cx
            .graph
            .outgoing_edges(&node.id)
            .any(|edge| edge.target == *branch_id);
        if !direct {
            return Err(NodeError::InvalidConfig {
                node: node.id.clone(),
                key: "branches",
                reason: format!("branch '{branch_id}' is not a direct successor"),
            });
        }
        sole_predecessor(cx.graph, &node.id, branch_id)?;
        let kind = NodeKind::parse(branch, cx.config)?;
        if matches!(kind, NodeKind::Parallel { .. }) {
            return Err(NodeError::NestedParallel(branch_id.clone()));
        }
        plans.push((branch, kind));
    }

    tracing::info!(node_id = %node.id, branches = plans.len(), "fanning out parallel branches");

    let mut pending: FuturesUnordered<_> = plans
        .iter()
        .enumerate()
        .map(|(slot, (branch, kind))| async move {
            let started_at = cx.host.now();
            let outcome = kind.execute_leaf(branch, cx).await;
            let completed_at = cx.host.now();
            (slot, *branch, started_at, completed_at, outcome)
        })
        .collect();

    let mut outputs: Vec<Option<Variables>> = vec![None; plans.len()];
    while let Some((slot, branch, started_at, completed_at, outcome)) = pending.next().await {
        match outcome {
            Ok(output) => {
                branch_results.push(NodeResult {
                    node_id: branch.id.clone(),
                    status: NodeStatus::Completed,
                    output: output.clone(),
                    started_at,
                    completed_at,
                    error: None,
                });
                outputs[slot] = Some(output);
            }
            Err(err) => {
                let message = err.to_string();
                tracing::warn!(node_id = %node.id, branch = %branch.id, error = %message, "parallel branch failed");
                branch_results.push(NodeResult {
                    node_id: branch.id.clone(),
                    status: NodeStatus::Failed,
                    output: Variables::new(),
                    started_at,
                    completed_at,
                    error: Some(ExecutionError::new(ErrorCode::ExecutionError, message.clone()).at_node(&branch.id)),
                });
                // Dropping `pending` cancels the outstanding branches.
                return Err(NodeError::BranchFailed {
                    branch: branch.id.clone(),
                    message,
                });
            }
        }
    }

    let mut merged = Variables::new();
    for output in outputs.into_iter().flatten() {
        merged.extend(output);
    }
    Ok(merged)
}

/// Check that every parallel branch is entered from its parallel node only.
///
/// Branches run inside the fan-out, ahead of anything else that would feed
/// them. Parallel nodes whose branch list does not parse are reported at
/// dispatch instead.
pub fn check_parallel_branches(graph: &WorkflowGraph) -> Result<(), NodeError> {
    for node in graph.nodes.iter().filter(|n| n.node_type == NodeType::Parallel) {
        let Ok(branches) = parse_branches(node) else {
            continue;
        };
        for branch_id in &branches {
            sole_predecessor(graph, &node.id, branch_id)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn sole_predecessor(graph: &WorkflowGraph, parallel_id: &str, branch_id: &str) -> Result<(), NodeError> {
    match graph
        .edges
        .iter()
        .find(|edge| edge.target == branch_id && edge.source != parallel_id)
    {
        Some(edge) => Err(NodeError::InvalidConfig {
            node: parallel_id.to_string(),
            key: "branches",
            reason: format!("branch '{branch_id}' has another predecessor '{}'", edge.source),
        }),
        None => Ok(()),
    }
}

fn parse_branches(node: &WorkflowNode) -> Result<Vec<String>, NodeError> {
    let invalid = |reason: &str| NodeError::InvalidConfig {
        node: node.id.clone(),
        key: "branches",
        reason: reason.to_string(),
    };
    let Some(Value::Array(items)) = node.config.get("branches") else {
        return Err(NodeError::MissingConfig {
            node: node.id.clone(),
            node_type: node.node_type.to_string(),
            key: "branches",
        });
    };
    if items.is_empty() {
        return Err(invalid("parallel node has no branches"));
    }
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid("branch ids must be strings"))
        })
        .collect()
}

fn parse_wait(node: &WorkflowNode, config: &EngineConfig) -> Result<WaitSpec, NodeError> {
    match node.config_str("wait_type").unwrap_or("timer") {
        "timer" => Ok(WaitSpec::Timer {
            seconds: node
                .config_u64("duration_seconds")
                .unwrap_or(config.default_wait_secs),
        }),
        "until" => {
            let raw = node.config_str("until").ok_or_else(|| NodeError::MissingConfig {
                node: node.id.clone(),
                node_type: node.node_type.to_string(),
                key: "until",
            })?;
            let instant = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| NodeError::InvalidConfig {
                    node: node.id.clone(),
                    key: "until",
                    reason: e.to_string(),
                })?
                .with_timezone(&Utc);
            Ok(WaitSpec::Until { instant })
        }
        "signal" => Ok(WaitSpec::Signal {
            name: node
                .config_str("signal_name")
                .unwrap_or(DEFAULT_SIGNAL_NAME)
                .to_string(),
        }),
        other => Err(NodeError::InvalidConfig {
            node: node.id.clone(),
            key: "wait_type",
            reason: format!("unknown wait type: {other}"),
        }),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn node_timeout(node: &WorkflowNode, default_secs: u64) -> Duration {
    Duration::from_secs(node.timeout_secs.unwrap_or(default_secs))
}

fn retry_policy(node: &WorkflowNode, config: &EngineConfig) -> RetryPolicy {
    node.retry_policy
        .clone()
        .unwrap_or_else(|| config.default_retry.clone())
}

fn object(value: Value) -> Variables {
    output_to_variables(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
