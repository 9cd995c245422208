//! CLI workflow subcommands: validate, plan and run.
//!
//! Every command replays the workflow file through the authoring operations
//! against an in-memory repository, so the same rules apply as for a
//! definition built through the catalog.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast;

use sce_core::event::EventBus;
use sce_core::service::{ServiceCatalog, ServiceDefinition};
use sce_core::workflow::graph::execution_order;
use sce_core::workflow::{DurableHost, WorkflowEngine, WorkflowRuntime};
use sce_infra::config::load_engine_config;
use sce_infra::host::{HandlerRegistry, LocalHost};
use sce_infra::repository::InMemoryServiceRepository;
use sce_types::config::EngineConfig;
use sce_types::event::EngineEvent;
use sce_types::execution::{ExecutionRequest, ExecutionStatus, NodeStatus, ServiceExecutionResult};
use sce_types::ids::{TenantId, UserId};

use super::RunArgs;
use crate::workflow_file::{self, Stub};

/// Longest rendering of a node output kept in the results table.
const MAX_OUTPUT_CHARS: usize = 60;

/// A definition published from a file, plus the repository holding it.
struct Published {
    repo: InMemoryServiceRepository,
    definition: ServiceDefinition,
    tenant_id: TenantId,
    author: UserId,
}

async fn publish_file(path: &Path) -> Result<Published> {
    let file = workflow_file::load_workflow_file(path).await?;
    let repo = InMemoryServiceRepository::new();
    let catalog = ServiceCatalog::new(repo.clone());
    let tenant_id = TenantId::new();
    let author = UserId::new();

    let draft = workflow_file::author_definition(&catalog, file, tenant_id, author).await?;
    catalog
        .publish(draft.id(), format!("published from {}", path.display()), author)
        .await?;
    let definition = catalog.get(draft.id()).await?;

    Ok(Published {
        repo,
        definition,
        tenant_id,
        author,
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn validate(path: &Path, json: bool) -> Result<()> {
    let published = match publish_file(path).await {
        Ok(published) => published,
        Err(err) if json => {
            let out = serde_json::json!({
                "file": path.display().to_string(),
                "valid": false,
                "error": format!("{err:#}"),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            bail!("workflow is invalid");
        }
        Err(err) => return Err(err),
    };
    let def = &published.definition;

    if json {
        let out = serde_json::json!({
            "file": path.display().to_string(),
            "valid": true,
            "name": def.name().as_str(),
            "category": def.category(),
            "nodes": def.graph().nodes.len(),
            "edges": def.graph().edges.len(),
            "on_error": def.error_policy().on_error,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(def.name()).cyan()
        );
        println!("  Category: {}", def.category());
        println!("  Nodes: {}", def.graph().nodes.len());
        println!("  Edges: {}", def.graph().edges.len());
        println!("  On error: {}", def.error_policy().on_error);
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub async fn plan(path: &Path, json: bool) -> Result<()> {
    let published = publish_file(path).await?;
    let graph = published.definition.graph();
    let order = execution_order(graph)?;

    if json {
        let steps: Vec<Value> = order
            .iter()
            .filter_map(|id| graph.node(id))
            .map(|node| {
                serde_json::json!({
                    "id": node.id,
                    "type": node.node_type.as_str(),
                    "label": node.label,
                    "next": graph.outgoing_edges(&node.id).map(|e| e.target.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "order": steps }))?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Node").fg(Color::Cyan),
        Cell::new("Type").fg(Color::Cyan),
        Cell::new("Label").fg(Color::Cyan),
        Cell::new("Next").fg(Color::Cyan),
    ]);

    for (i, node) in order.iter().filter_map(|id| graph.node(id)).enumerate() {
        let next: Vec<String> = graph
            .outgoing_edges(&node.id)
            .map(|edge| match &edge.condition {
                Some(condition) => format!("{} [{condition}]", edge.target),
                None => edge.target.clone(),
            })
            .collect();
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(&node.id),
            Cell::new(node.node_type.as_str()),
            Cell::new(&node.label),
            Cell::new(next.join("\n")),
        ]);
    }

    println!();
    println!(
        "  {} Execution order for '{}'",
        style("*").green().bold(),
        style(published.definition.name()).cyan()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(args: RunArgs, json: bool, quiet: bool) -> Result<()> {
    let input = workflow_file::parse_input(&args.input)?;
    let signals = args
        .signals
        .iter()
        .map(|raw| workflow_file::parse_signal(raw))
        .collect::<Result<Vec<_>>>()?;
    let stubs = match &args.stubs {
        Some(path) => workflow_file::load_stubs(path).await?,
        None => BTreeMap::new(),
    };
    let config = match &args.config {
        Some(path) => load_engine_config(path).await,
        None => EngineConfig::default(),
    };

    let published = publish_file(&args.file).await?;

    let registry = stub_registry(&stubs);
    let host: Arc<dyn DurableHost> = Arc::new(LocalHost::new(registry.clone(), registry));
    let event_bus = EventBus::new(config.event_bus_capacity);
    let mut events = event_bus.subscribe();
    let engine = Arc::new(WorkflowEngine::new(host, config, event_bus));
    let runtime = WorkflowRuntime::new(engine, published.repo.clone());

    let mut request = ExecutionRequest::new(published.definition.id(), published.tenant_id, input);
    request.correlation_id = Some(format!("cli-{}", uuid::Uuid::now_v7()));
    request.initiated_by = Some(published.author);

    let handle = runtime.submit(request).await?;
    for (name, payload) in signals {
        runtime.signal(handle.instance_id, &name, payload)?;
    }

    // Ctrl-C cancels so the instance still finishes through its error policy.
    let result = tokio::select! {
        result = runtime.wait(handle.instance_id) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(instance_id = %handle.instance_id, "interrupted, cancelling");
            runtime.cancel_all();
            runtime.wait(handle.instance_id).await?
        }
    };
    runtime.forget(handle.instance_id);
    let trail = drain_events(&mut events);

    if json {
        let out = serde_json::json!({
            "result": result,
            "events": trail,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if quiet {
        println!("{}", result.status);
    } else {
        print_result(&published.definition, &result, &trail);
    }

    if result.status != ExecutionStatus::Completed {
        bail!("instance {} finished {}", result.instance_id, result.status);
    }
    Ok(())
}

/// Build the handler registry for a run. Unknown names echo their input.
fn stub_registry(stubs: &BTreeMap<String, Stub>) -> HandlerRegistry {
    let registry = HandlerRegistry::new().with_fallback(|input: Value| async move { Ok::<_, String>(input) });
    for (name, stub) in stubs {
        match stub {
            Stub::Output(value) => registry.register_value(name.clone(), value.clone()),
            Stub::Failure(message) => registry.register_failure(name.clone(), message.clone()),
        }
    }
    registry
}

fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut trail = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => trail.push(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "event trail lagged, some events were dropped");
            }
            Err(_) => break,
        }
    }
    trail
}

fn print_result(def: &ServiceDefinition, result: &ServiceExecutionResult, trail: &[EngineEvent]) {
    let graph = def.graph();
    let order = execution_order(graph).unwrap_or_default();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Node").fg(Color::Cyan),
        Cell::new("Type").fg(Color::Cyan),
        Cell::new("Status").fg(Color::Cyan),
        Cell::new("Output").fg(Color::Cyan),
        Cell::new("Error").fg(Color::Cyan),
    ]);

    for node_id in &order {
        let node_type = graph.node(node_id).map(|n| n.node_type.as_str()).unwrap_or("?");
        let row = match result.node_results.get(node_id) {
            Some(node) => {
                let (label, color) = match node.status {
                    NodeStatus::Completed => ("completed", Color::Green),
                    NodeStatus::Failed => ("failed", Color::Red),
                };
                vec![
                    Cell::new(node_id),
                    Cell::new(node_type),
                    Cell::new(label).fg(color),
                    Cell::new(truncate(&Value::Object(node.output.clone()).to_string())),
                    Cell::new(node.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")),
                ]
            }
            None if result.skipped_nodes.contains(node_id) => vec![
                Cell::new(node_id),
                Cell::new(node_type),
                Cell::new("skipped").fg(Color::Yellow),
                Cell::new(""),
                Cell::new(""),
            ],
            None => vec![
                Cell::new(node_id),
                Cell::new(node_type),
                Cell::new("not run").fg(Color::DarkGrey),
                Cell::new(""),
                Cell::new(""),
            ],
        };
        table.add_row(row);
    }

    let status = match result.status {
        ExecutionStatus::Completed => style(result.status.to_string()).green().bold(),
        ExecutionStatus::Failed => style(result.status.to_string()).red().bold(),
        ExecutionStatus::Compensated => style(result.status.to_string()).yellow().bold(),
    };

    println!();
    println!(
        "  {} Instance {} of '{}' finished {}",
        style("*").cyan().bold(),
        style(result.instance_id).dim(),
        style(def.name()).cyan(),
        status
    );
    let elapsed = result.completed_at - result.started_at;
    println!("  Duration: {}ms", elapsed.num_milliseconds());
    println!("  Events: {}", trail.len());
    if let Some(error) = &result.error {
        let at = error.node_id.as_deref().map(|n| format!(" at '{n}'")).unwrap_or_default();
        println!("  Error: {} {}{}", style(error.code.as_str()).red(), error.message, at);
    }
    println!();
    println!("{table}");

    if !result.output.is_empty() {
        println!();
        println!("  {}", style("Output").bold());
        match serde_json::to_string_pretty(&result.output) {
            Ok(rendered) => {
                for line in rendered.lines() {
                    println!("  {line}");
                }
            }
            Err(err) => println!("  <unprintable output: {err}>"),
        }
    }
    println!();
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_OUTPUT_CHARS {
        return s.to_string();
    }
    let head: String = s.chars().take(MAX_OUTPUT_CHARS - 3).collect();
    format!("{head}...")
}
