//! Workflow interpreter: deterministic graph traversal with error policies.
//!
//! The `WorkflowEngine` runs one instance of an immutable workflow graph to a
//! terminal `ServiceExecutionResult`.
//!
//! # Execution flow
//!
//! 1. Index the graph and compute the execution order (Kahn, ties broken by
//!    authored node position). A cycle fails the instance with
//!    `INVALID_WORKFLOW` before any node runs.
//! 2. Walk the order. A node runs if it has no incoming edges or at least one
//!    incoming edge was taken; otherwise it is recorded as skipped.
//! 3. Dispatch the node through `NodeKind`, racing the instance's
//!    cancellation token. Successful output merges into the variables.
//! 4. On failure apply the error policy: `fail` stops, `ignore` records and
//!    continues, `compensate` hands off to the compensation workflow.
//! 5. After each node, evaluate its outgoing edge conditions and publish a
//!    fresh `ExecutionContext` snapshot for queries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use sce_types::config::EngineConfig;
use sce_types::event::EngineEvent;
use sce_types::execution::{
    ErrorCode, ExecutionContext, ExecutionError, ExecutionStatus, InstanceMetadata, NodeResult,
    NodeStatus, ServiceExecutionResult, Variables,
};
use sce_types::ids::InstanceId;
use sce_types::service::{ErrorHandlingPolicy, OnError};
use sce_types::workflow::WorkflowGraph;

use crate::event::bus::EventBus;

use super::graph::GraphIndex;
use super::host::{ChildWorkflowCall, DurableHost};
use super::node::{DispatchContext, NodeKind, evaluate_outgoing};

/// Inputs for one instance run.
#[derive(Debug, Clone)]
pub struct InstanceRun<'a> {
    pub metadata: InstanceMetadata,
    pub graph: &'a WorkflowGraph,
    pub policy: &'a ErrorHandlingPolicy,
    pub input: Variables,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    /// Completed, or failed under `ignore`. Outgoing edges are evaluated.
    Ran,
    Skipped,
}

/// Mutable state of the instance being interpreted.
struct Instance<'a> {
    metadata: &'a InstanceMetadata,
    policy: &'a ErrorHandlingPolicy,
    ctx: ExecutionContext,
    skipped: Vec<String>,
    started_at: DateTime<Utc>,
    snapshots: &'a watch::Sender<ExecutionContext>,
}

impl Instance<'_> {
    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.ctx.clone());
    }
}

/// Interpreter for published workflow graphs.
///
/// Holds the durable host and hands it explicitly to every dispatch.
pub struct WorkflowEngine {
    host: Arc<dyn DurableHost>,
    config: EngineConfig,
    event_bus: EventBus,
}

impl WorkflowEngine {
    pub fn new(host: Arc<dyn DurableHost>, config: EngineConfig, event_bus: EventBus) -> Self {
        Self {
            host,
            config,
            event_bus,
        }
    }

    pub fn host(&self) -> &Arc<dyn DurableHost> {
        &self.host
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Run an instance to completion without external cancellation or queries.
    pub async fn run(&self, run: InstanceRun<'_>) -> ServiceExecutionResult {
        let cancel = CancellationToken::new();
        let (snapshots, _) = watch::channel(ExecutionContext::default());
        self.execute(run, &cancel, &snapshots).await
    }

    /// Run an instance, honouring `cancel` and publishing snapshots after every node.
    pub async fn execute(
        &self,
        run: InstanceRun<'_>,
        cancel: &CancellationToken,
        snapshots: &watch::Sender<ExecutionContext>,
    ) -> ServiceExecutionResult {
        let InstanceRun {
            metadata,
            graph,
            policy,
            input,
        } = run;
        let instance_id = metadata.instance_id;

        let mut inst = Instance {
            metadata: &metadata,
            policy,
            ctx: ExecutionContext::new(input),
            skipped: Vec::new(),
            started_at: self.host.now(),
            snapshots,
        };
        inst.publish_snapshot();

        self.event_bus.publish(EngineEvent::InstanceStarted {
            instance_id,
            service_id: metadata.service_id,
            version_id: metadata.version_id,
        });
        tracing::info!(
            instance_id = %instance_id,
            service_id = %metadata.service_id,
            version_id = %metadata.version_id,
            nodes = graph.nodes.len(),
            "workflow instance started"
        );

        let ordered = GraphIndex::build(graph).and_then(|index| {
            let order = index.execution_order()?;
            Ok((index, order))
        });
        let (index, order) = match ordered {
            Ok(ordered) => ordered,
            Err(e) => {
                tracing::error!(instance_id = %instance_id, error = %e, "workflow graph is not executable");
                let error = ExecutionError::new(ErrorCode::InvalidWorkflow, e.to_string());
                return self.finish(inst, ExecutionStatus::Failed, Some(error));
            }
        };

        let mut visits = vec![Visit::Pending; index.len()];
        let mut taken = vec![false; graph.edges.len()];

        for pos in order {
            if visits[pos] != Visit::Pending {
                continue;
            }
            let node = index.node(pos);

            if cancel.is_cancelled() {
                return self.on_cancel(inst).await;
            }

            let incoming = index.incoming_edges(pos);
            if !incoming.is_empty() && !incoming.iter().any(|edge| taken[*edge]) {
                visits[pos] = Visit::Skipped;
                self.skip(&mut inst, &node.id);
                continue;
            }

            self.event_bus.publish(EngineEvent::NodeStarted {
                instance_id,
                node_id: node.id.clone(),
                node_type: node.node_type.to_string(),
            });
            tracing::debug!(instance_id = %instance_id, node_id = %node.id, node_type = %node.node_type, "dispatching node");

            let node_started = self.host.now();
            let mut branch_results = Vec::new();
            let mut branch_ids = Vec::new();
            let mut is_decision = false;

            let dispatched = match NodeKind::parse(node, &self.config) {
                Ok(kind) => {
                    match &kind {
                        NodeKind::Parallel { branches } => branch_ids = branches.clone(),
                        NodeKind::Decision { .. } => is_decision = true,
                        _ => {}
                    }
                    let cx = DispatchContext {
                        host: self.host.as_ref(),
                        config: &self.config,
                        instance_id,
                        graph,
                        variables: &inst.ctx.variables,
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = kind.execute(node, cx, &mut branch_results) => Some(result),
                    }
                }
                Err(e) => Some(Err(e)),
            };
            let node_completed = self.host.now();

            let Some(result) = dispatched else {
                let error = ExecutionError::new(ErrorCode::Cancelled, "node cancelled").at_node(&node.id);
                inst.ctx.record(failed_result(&node.id, node_started, node_completed, error));
                return self.on_cancel(inst).await;
            };

            // Branch nodes were dispatched by their parallel node and are
            // never dispatched again by the main loop.
            let mut ran_branches = Vec::new();
            for branch_id in &branch_ids {
                let Some(branch_pos) = index.position(branch_id) else {
                    continue;
                };
                match branch_results.iter().find(|r| &r.node_id == branch_id) {
                    Some(branch_result) => {
                        visits[branch_pos] = Visit::Ran;
                        self.publish_node_outcome(instance_id, branch_result);
                        inst.ctx.record(branch_result.clone());
                        ran_branches.push(branch_id.as_str());
                    }
                    None => {
                        visits[branch_pos] = Visit::Skipped;
                        self.skip(&mut inst, branch_id);
                    }
                }
            }

            // A decision's output scopes its own edges and is not merged.
            let mut edge_scope = None;
            match result {
                Ok(output) => {
                    if is_decision {
                        let mut scope = inst.ctx.variables.clone();
                        scope.extend(output.clone());
                        edge_scope = Some(scope);
                    } else {
                        inst.ctx.merge_output(&output);
                    }
                    let node_result = NodeResult {
                        node_id: node.id.clone(),
                        status: NodeStatus::Completed,
                        output,
                        started_at: node_started,
                        completed_at: node_completed,
                        error: None,
                    };
                    self.publish_node_outcome(instance_id, &node_result);
                    inst.ctx.record(node_result);
                }
                Err(err) => {
                    let error = ExecutionError::new(ErrorCode::ExecutionError, err.to_string()).at_node(&node.id);
                    tracing::warn!(instance_id = %instance_id, node_id = %node.id, error = %err, policy = %policy.on_error, "node failed");
                    let node_result = failed_result(&node.id, node_started, node_completed, error.clone());
                    self.publish_node_outcome(instance_id, &node_result);
                    inst.ctx.record(node_result);

                    match policy.on_error {
                        OnError::Fail => {
                            return self.finish(inst, ExecutionStatus::Failed, Some(error));
                        }
                        OnError::Compensate => {
                            return self.compensate(inst, error).await;
                        }
                        OnError::Ignore => {}
                    }
                }
            }

            visits[pos] = Visit::Ran;
            let scope = edge_scope.as_ref().unwrap_or(&inst.ctx.variables);
            let selected = self.take_edges(instance_id, graph, &node.id, scope, &mut taken);
            if is_decision {
                if let Some(decision) = inst.ctx.node_results.get_mut(&node.id) {
                    decision.output.insert("selected".to_string(), json!(selected));
                }
            }
            for branch_id in ran_branches {
                self.take_edges(instance_id, graph, branch_id, &inst.ctx.variables, &mut taken);
            }
            inst.publish_snapshot();
        }

        self.finish(inst, ExecutionStatus::Completed, None)
    }

    /// Evaluate a node's outgoing conditions, mark the taken edges and
    /// return their targets.
    fn take_edges(
        &self,
        instance_id: InstanceId,
        graph: &WorkflowGraph,
        node_id: &str,
        variables: &Variables,
        taken: &mut [bool],
    ) -> Vec<String> {
        let mut targets = Vec::new();
        for (edge_pos, outcome) in evaluate_outgoing(graph, node_id, variables) {
            match outcome {
                Ok(result) => {
                    taken[edge_pos] = result;
                    if result {
                        targets.push(graph.edges[edge_pos].target.clone());
                    }
                }
                Err(e) => {
                    let edge = &graph.edges[edge_pos];
                    tracing::warn!(
                        instance_id = %instance_id,
                        source = %edge.source,
                        target = %edge.target,
                        error = %e,
                        "edge condition failed to evaluate, edge not taken"
                    );
                }
            }
        }
        targets
    }

    fn skip(&self, inst: &mut Instance<'_>, node_id: &str) {
        tracing::debug!(instance_id = %inst.metadata.instance_id, node_id, "node skipped, no incoming edge taken");
        inst.skipped.push(node_id.to_string());
        self.event_bus.publish(EngineEvent::NodeSkipped {
            instance_id: inst.metadata.instance_id,
            node_id: node_id.to_string(),
        });
    }

    fn publish_node_outcome(&self, instance_id: InstanceId, result: &NodeResult) {
        let event = match (&result.status, &result.error) {
            (NodeStatus::Failed, error) => EngineEvent::NodeFailed {
                instance_id,
                node_id: result.node_id.clone(),
                error: error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            },
            (NodeStatus::Completed, _) => EngineEvent::NodeCompleted {
                instance_id,
                node_id: result.node_id.clone(),
            },
        };
        self.event_bus.publish(event);
    }

    async fn on_cancel(&self, inst: Instance<'_>) -> ServiceExecutionResult {
        tracing::warn!(instance_id = %inst.metadata.instance_id, "workflow instance cancelled");
        let error = ExecutionError::new(ErrorCode::Cancelled, "instance cancelled");
        if inst.policy.on_error == OnError::Compensate {
            return self.compensate(inst, error).await;
        }
        self.finish(inst, ExecutionStatus::Failed, Some(error))
    }

    /// Hand off to the compensation workflow and finish as compensated.
    ///
    /// Compensation does not walk executed nodes in reverse; it delegates
    /// entirely to the named workflow.
    async fn compensate(&self, inst: Instance<'_>, original: ExecutionError) -> ServiceExecutionResult {
        let instance_id = inst.metadata.instance_id;
        let node_id = original.node_id.clone();

        let Some(workflow) = inst.policy.compensation_workflow.clone() else {
            tracing::warn!(instance_id = %instance_id, "compensate policy without a compensation workflow");
            let error = ExecutionError {
                code: ErrorCode::Compensated,
                message: format!(
                    "Original error: {}. No compensation workflow configured.",
                    original.message
                ),
                node_id,
            };
            return self.finish(inst, ExecutionStatus::Compensated, Some(error));
        };

        let call = ChildWorkflowCall {
            parent_instance_id: instance_id,
            workflow_name: workflow.clone(),
            input: json!({
                "instance_id": instance_id,
                "failed_node_id": node_id,
                "error": original.message,
                "variables": inst.ctx.variables,
            }),
            wait_for_completion: false,
        };
        tracing::info!(instance_id = %instance_id, workflow = %workflow, "handing off to compensation workflow");

        match self.host.start_child_workflow(call).await {
            Ok(_) => {
                let error = ExecutionError {
                    code: ErrorCode::Compensated,
                    message: format!("Original error: {}. Compensation executed.", original.message),
                    node_id,
                };
                self.finish(inst, ExecutionStatus::Compensated, Some(error))
            }
            Err(e) => {
                tracing::error!(instance_id = %instance_id, workflow = %workflow, error = %e, "compensation hand-off failed");
                let error = ExecutionError {
                    code: ErrorCode::CompensationFailed,
                    message: format!(
                        "Original error: {}. Compensation failed: {}",
                        original.message, e
                    ),
                    node_id,
                };
                self.finish(inst, ExecutionStatus::Failed, Some(error))
            }
        }
    }

    fn finish(
        &self,
        inst: Instance<'_>,
        status: ExecutionStatus,
        error: Option<ExecutionError>,
    ) -> ServiceExecutionResult {
        let instance_id = inst.metadata.instance_id;
        let completed_at = self.host.now();
        inst.publish_snapshot();

        match &error {
            Some(e) => tracing::info!(instance_id = %instance_id, status = %status, error = %e, "workflow instance finished"),
            None => tracing::info!(instance_id = %instance_id, status = %status, "workflow instance finished"),
        }
        self.event_bus.publish(EngineEvent::InstanceFinished {
            instance_id,
            status,
            error: error.clone(),
        });

        ServiceExecutionResult {
            instance_id,
            status,
            output: inst.ctx.variables,
            node_results: inst.ctx.node_results,
            skipped_nodes: inst.skipped,
            started_at: inst.started_at,
            completed_at,
            error,
        }
    }
}

fn failed_result(
    node_id: &str,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    error: ExecutionError,
) -> NodeResult {
    NodeResult {
        node_id: node_id.to_string(),
        status: NodeStatus::Failed,
        output: Variables::new(),
        started_at,
        completed_at,
        error: Some(error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_host::ScriptedHost;
    use sce_types::ids::{ServiceId, TenantId, VersionId};
    use sce_types::workflow::{NodeType, WorkflowEdge, WorkflowNode};
    use serde_json::Value;

    fn metadata() -> InstanceMetadata {
        InstanceMetadata {
            instance_id: InstanceId::new(),
            service_id: ServiceId::new(),
            version_id: VersionId::new(),
            tenant_id: TenantId::new(),
            correlation_id: None,
            initiated_by: None,
        }
    }

    fn activity(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, NodeType::Activity, id).with_config("activity_name", json!(id.to_uppercase()))
    }

    /// start -> A -> B
    fn start_a_b() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                activity("a"),
                activity("b"),
            ],
            edges: vec![WorkflowEdge::new("start", "a"), WorkflowEdge::new("a", "b")],
        }
    }

    fn engine(host: ScriptedHost) -> (WorkflowEngine, Arc<ScriptedHost>) {
        let host = Arc::new(host);
        let engine = WorkflowEngine::new(host.clone(), EngineConfig::default(), EventBus::new(64));
        (engine, host)
    }

    async fn run(engine: &WorkflowEngine, graph: &WorkflowGraph, policy: &ErrorHandlingPolicy, input: Value) -> ServiceExecutionResult {
        let input = match input {
            Value::Object(map) => map,
            _ => Variables::new(),
        };
        engine
            .run(InstanceRun {
                metadata: metadata(),
                graph,
                policy,
                input,
            })
            .await
    }

    #[tokio::test]
    async fn test_linear_workflow_completes_and_merges_outputs() {
        let (engine, host) = engine(
            ScriptedHost::new()
                .with_activity("A", Ok(json!({ "reserved": true, "step": "a" })))
                .with_activity("B", Ok(json!({ "step": "b" }))),
        );
        let result = run(&engine, &start_a_b(), &ErrorHandlingPolicy::fail(), json!({ "order": 1 })).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.error.is_none());
        assert_eq!(host.activity_names(), vec!["A", "B"]);
        assert_eq!(result.output["order"], json!(1));
        assert_eq!(result.output["reserved"], json!(true));
        assert_eq!(result.output["step"], json!("b"));
        assert_eq!(result.node_results.len(), 3);
        assert!(result.skipped_nodes.is_empty());
        assert!(result.started_at < result.completed_at);
    }

    #[tokio::test]
    async fn test_fail_policy_stops_at_failing_node() {
        let (engine, host) = engine(ScriptedHost::new().with_activity("A", Err("out of stock".to_string())));
        let result = run(&engine, &start_a_b(), &ErrorHandlingPolicy::fail(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::ExecutionError);
        assert_eq!(error.node_id.as_deref(), Some("a"));
        assert!(error.message.contains("out of stock"));
        assert!(!result.node_results.contains_key("b"));
        assert_eq!(host.activity_names(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_ignore_policy_continues_after_failure() {
        let (engine, host) = engine(ScriptedHost::new().with_activity("A", Err("flaky".to_string())));
        let result = run(&engine, &start_a_b(), &ErrorHandlingPolicy::ignore(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.error.is_none());
        assert_eq!(result.node_results["a"].status, NodeStatus::Failed);
        assert_eq!(result.node_results["b"].status, NodeStatus::Completed);
        assert_eq!(host.activity_names(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_compensate_policy_hands_off() {
        let (engine, host) = engine(ScriptedHost::new().with_activity("A", Err("payment declined".to_string())));
        let policy = ErrorHandlingPolicy::compensate("refund-order");
        let result = run(&engine, &start_a_b(), &policy, json!({ "order_id": "o-7" })).await;

        assert_eq!(result.status, ExecutionStatus::Compensated);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::Compensated);
        assert_eq!(error.node_id.as_deref(), Some("a"));
        assert!(error.message.starts_with("Original error: "));
        assert!(error.message.ends_with("Compensation executed."));
        assert!(!result.node_results.contains_key("b"));

        let calls = host.child_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].workflow_name, "refund-order");
        assert!(!calls[0].wait_for_completion);
        assert_eq!(calls[0].input["failed_node_id"], json!("a"));
        assert_eq!(calls[0].input["variables"]["order_id"], json!("o-7"));
    }

    #[tokio::test]
    async fn test_compensate_without_workflow_still_compensated() {
        let (engine, host) = engine(ScriptedHost::new().with_activity("A", Err("boom".to_string())));
        let policy = ErrorHandlingPolicy {
            on_error: OnError::Compensate,
            compensation_workflow: None,
        };
        let result = run(&engine, &start_a_b(), &policy, json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Compensated);
        assert_eq!(result.error.unwrap().code, ErrorCode::Compensated);
        assert!(host.child_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_compensation_hand_off() {
        let (engine, _host) = engine(
            ScriptedHost::new()
                .with_activity("A", Err("boom".to_string()))
                .with_child_result(Err("no such workflow".to_string())),
        );
        let policy = ErrorHandlingPolicy::compensate("refund-order");
        let result = run(&engine, &start_a_b(), &policy, json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        let error = result.error.unwrap();
        assert_eq!(error.code, ErrorCode::CompensationFailed);
        assert!(error.message.contains("no such workflow"));
    }

    #[tokio::test]
    async fn test_cycle_fails_without_executing_nodes() {
        let (engine, host) = engine(ScriptedHost::new());
        let mut graph = start_a_b();
        graph.edges.push(WorkflowEdge::new("b", "a"));
        let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().code, ErrorCode::InvalidWorkflow);
        assert!(result.node_results.is_empty());
        assert!(host.activity_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_node_type_fails_dispatch() {
        let (engine, _host) = engine(ScriptedHost::new());
        let graph = WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("x", NodeType::from("teleport"), "X"),
            ],
            edges: vec![WorkflowEdge::new("start", "x")],
        };
        let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({})).await;

        let error = result.error.unwrap();
        assert_eq!(error.node_id.as_deref(), Some("x"));
        assert_eq!(error.message, "unknown node type: teleport");
    }

    fn parallel_graph() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("fan", NodeType::Parallel, "Fan").with_config("branches", json!(["left", "right"])),
                activity("left"),
                activity("right"),
                activity("after"),
            ],
            edges: vec![
                WorkflowEdge::new("start", "fan"),
                WorkflowEdge::new("fan", "left"),
                WorkflowEdge::new("fan", "right"),
                WorkflowEdge::new("left", "after"),
                WorkflowEdge::new("right", "after"),
            ],
        }
    }

    #[tokio::test]
    async fn test_parallel_branch_failure_stops_downstream() {
        let (engine, host) = engine(
            ScriptedHost::new()
                .with_activity("LEFT", Ok(json!({ "l": 1 })))
                .with_activity("RIGHT", Err("carrier down".to_string())),
        );
        let result = run(&engine, &parallel_graph(), &ErrorHandlingPolicy::fail(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().node_id.as_deref(), Some("fan"));
        assert_eq!(result.node_results["fan"].status, NodeStatus::Failed);
        assert!(!result.node_results.contains_key("after"));
        assert!(!host.activity_names().contains(&"AFTER".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_branch_with_other_predecessor_fails_before_dispatch() {
        let (engine, host) = engine(ScriptedHost::new());
        let graph = WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("fan", NodeType::Parallel, "Fan").with_config("branches", json!(["b"])),
                activity("x"),
                activity("b"),
            ],
            edges: vec![
                WorkflowEdge::new("start", "fan"),
                WorkflowEdge::new("fan", "b"),
                WorkflowEdge::new("start", "x"),
                WorkflowEdge::new("x", "b"),
            ],
        };
        let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_ref().unwrap().node_id.as_deref(), Some("fan"));
        assert!(!host.activity_names().contains(&"B".to_string()));
        assert!(!result.node_results.contains_key("b"));
    }

    #[tokio::test]
    async fn test_parallel_branches_run_once_then_join() {
        let (engine, host) = engine(
            ScriptedHost::new()
                .with_activity("LEFT", Ok(json!({ "l": 1 })))
                .with_activity("RIGHT", Ok(json!({ "r": 2 }))),
        );
        let result = run(&engine, &parallel_graph(), &ErrorHandlingPolicy::fail(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        let mut names = host.activity_names();
        names.sort();
        assert_eq!(names, vec!["AFTER", "LEFT", "RIGHT"]);
        assert_eq!(result.node_results["left"].status, NodeStatus::Completed);
        assert_eq!(result.node_results["right"].status, NodeStatus::Completed);
        assert_eq!(result.output["l"], json!(1));
        assert_eq!(result.output["r"], json!(2));
    }

    fn decision_graph() -> WorkflowGraph {
        WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("route", NodeType::Decision, "Route").with_config("condition", json!("total > 100")),
                activity("manual_review"),
                activity("notify_reviewer"),
                activity("auto_approve"),
                activity("ship"),
            ],
            edges: vec![
                WorkflowEdge::new("start", "route"),
                WorkflowEdge::new("route", "manual_review").when("branch"),
                WorkflowEdge::new("manual_review", "notify_reviewer"),
                WorkflowEdge::new("route", "auto_approve").when("branch == false"),
                WorkflowEdge::new("notify_reviewer", "ship"),
                WorkflowEdge::new("auto_approve", "ship"),
            ],
        }
    }

    #[tokio::test]
    async fn test_decision_prunes_unselected_branch() {
        let (engine, host) = engine(ScriptedHost::new());
        let result = run(&engine, &decision_graph(), &ErrorHandlingPolicy::fail(), json!({ "total": 20 })).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(host.activity_names(), vec!["AUTO_APPROVE", "SHIP"]);
        assert_eq!(result.skipped_nodes, vec!["manual_review", "notify_reviewer"]);
        assert!(!result.node_results.contains_key("manual_review"));
        assert_eq!(result.node_results["route"].output["branch"], json!(false));
        assert_eq!(result.node_results["route"].output["selected"], json!(["auto_approve"]));
        assert!(!result.output.contains_key("branch"));
    }

    #[tokio::test]
    async fn test_decision_takes_other_branch() {
        let (engine, host) = engine(ScriptedHost::new());
        let result = run(&engine, &decision_graph(), &ErrorHandlingPolicy::fail(), json!({ "total": 500 })).await;

        assert_eq!(host.activity_names(), vec!["MANUAL_REVIEW", "NOTIFY_REVIEWER", "SHIP"]);
        assert_eq!(result.skipped_nodes, vec!["auto_approve"]);
    }

    #[tokio::test]
    async fn test_decision_without_condition_routes_on_input_variable() {
        let (engine, host) = engine(ScriptedHost::new());
        let graph = WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("route", NodeType::Decision, "Route"),
                activity("eu"),
                activity("us"),
            ],
            edges: vec![
                WorkflowEdge::new("start", "route"),
                WorkflowEdge::new("route", "eu").when("branch == 'eu'"),
                WorkflowEdge::new("route", "us").when("branch == 'us'"),
            ],
        };
        let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({ "branch": "eu" })).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(host.activity_names(), vec!["EU"]);
        assert_eq!(result.skipped_nodes, vec!["us"]);
        assert_eq!(result.output["branch"], json!("eu"));
        assert_eq!(result.node_results["route"].output["selected"], json!(["eu"]));
        assert!(!result.node_results["route"].output.contains_key("branch"));
    }

    #[tokio::test]
    async fn test_decision_malformed_edge_condition_is_not_taken() {
        let (engine, host) = engine(ScriptedHost::new());
        let graph = WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("d", NodeType::Decision, "D"),
                activity("x"),
                activity("y"),
            ],
            edges: vec![
                WorkflowEdge::new("start", "d"),
                WorkflowEdge::new("d", "x").when("total >"),
                WorkflowEdge::new("d", "y"),
            ],
        };
        let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({ "total": 5 })).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.node_results["d"].status, NodeStatus::Completed);
        assert_eq!(result.node_results["d"].output["selected"], json!(["y"]));
        assert_eq!(host.activity_names(), vec!["Y"]);
        assert_eq!(result.skipped_nodes, vec!["x"]);
    }

    #[tokio::test]
    async fn test_human_task_timeout_resolves_instance() {
        let (engine, _host) = engine(ScriptedHost::new());
        let graph = WorkflowGraph {
            nodes: vec![
                WorkflowNode::new("start", NodeType::Start, "Start"),
                WorkflowNode::new("approve", NodeType::HumanTask, "Approve").with_config("timeout_seconds", json!(2)),
                WorkflowNode::new("end", NodeType::End, "End"),
            ],
            edges: vec![WorkflowEdge::new("start", "approve"), WorkflowEdge::new("approve", "end")],
        };
        let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({})).await;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.output["response"]["timeout"], json!(true));
        assert!(result.node_results.contains_key("end"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_in_flight_node() {
        let (engine, _host) = engine(ScriptedHost::new().with_hanging_activity("A"));
        let graph = start_a_b();
        let policy = ErrorHandlingPolicy::fail();
        let cancel = CancellationToken::new();
        let (tx, _rx) = watch::channel(ExecutionContext::default());

        let run = engine.execute(
            InstanceRun {
                metadata: metadata(),
                graph: &graph,
                policy: &policy,
                input: Variables::new(),
            },
            &cancel,
            &tx,
        );
        let canceller = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let (result, _) = tokio::join!(run, canceller);

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.unwrap().code, ErrorCode::Cancelled);
        assert_eq!(result.node_results["a"].status, NodeStatus::Failed);
        assert!(!result.node_results.contains_key("b"));
    }

    #[tokio::test]
    async fn test_cancellation_under_compensate_hands_off() {
        let (engine, host) = engine(ScriptedHost::new());
        let graph = start_a_b();
        let policy = ErrorHandlingPolicy::compensate("undo");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = watch::channel(ExecutionContext::default());

        let result = engine
            .execute(
                InstanceRun {
                    metadata: metadata(),
                    graph: &graph,
                    policy: &policy,
                    input: Variables::new(),
                },
                &cancel,
                &tx,
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Compensated);
        assert!(result.node_results.is_empty());
        assert_eq!(host.child_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_final_context() {
        let (engine, _host) = engine(ScriptedHost::new().with_activity("A", Ok(json!({ "x": 1 }))));
        let graph = start_a_b();
        let policy = ErrorHandlingPolicy::fail();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(ExecutionContext::default());

        engine
            .execute(
                InstanceRun {
                    metadata: metadata(),
                    graph: &graph,
                    policy: &policy,
                    input: Variables::new(),
                },
                &cancel,
                &tx,
            )
            .await;

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.variables["x"], json!(1));
        assert_eq!(snapshot.node_results.len(), 3);
    }

    #[tokio::test]
    async fn test_events_bracket_the_instance() {
        let (engine, _host) = engine(ScriptedHost::new());
        let mut rx = engine.event_bus().subscribe();
        run(&engine, &start_a_b(), &ErrorHandlingPolicy::fail(), json!({})).await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(EngineEvent::InstanceStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::InstanceFinished {
                status: ExecutionStatus::Completed,
                ..
            })
        ));
        let completed = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::NodeCompleted { .. }))
            .count();
        assert_eq!(completed, 3);
    }

    #[tokio::test]
    async fn test_execution_is_deterministic() {
        let graph = parallel_graph();
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let (engine, _host) = engine(ScriptedHost::new());
            let result = run(&engine, &graph, &ErrorHandlingPolicy::fail(), json!({})).await;
            let ids: Vec<String> = result.node_results.keys().cloned().collect();
            outcomes.push((result.status, ids, result.skipped_nodes));
        }
        assert!(outcomes.windows(2).all(|w| w[0] == w[1]));
    }
}
