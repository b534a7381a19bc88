//! Command handlers for CLI operations
//!
//! Each handler builds the services it needs from a [`ServiceRegistry`],
//! prints its result as text or JSON, and returns `anyhow::Result`.

use anyhow::{Context, Result};
use sdk::errors::{EngineError, ErrorExt};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::orchestrator::{MoodEntry, TaskRequest, WorkflowResult};
use crate::planner::{ActionPlanner, PlanStatus};
use crate::registry::ServiceRegistry;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Error report for stderr, with the first user-facing hint in the chain
pub fn describe_error(err: &anyhow::Error) -> String {
    let mut report = format!("Error: {:#}", err);
    let engine_error = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>());
    if let Some(engine_error) = engine_error {
        report.push_str(&format!("\nHint: {}", engine_error.user_hint()));
        if engine_error.is_retryable() {
            report.push_str(" (try again later)");
        }
    }
    report
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn print_workflow(result: &WorkflowResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Workflow: {}", result.workflow);
            println!("Plan:     {}", result.plan_id);
            println!("Status:   {:?}", result.status);
            for (key, output) in &result.outputs {
                println!("  {} -> {}", key, output);
            }
            println!("Remaining actions run in the background (`rhythm worker`).");
        }
        OutputFormat::Json => print_json(result)?,
    }
    Ok(())
}

fn print_plan(status: &PlanStatus, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Plan {} ({:?})", status.plan_id, status.overall_status);
            println!("{:<12} {:<28} {:<10} {}", "KEY", "KIND", "STATUS", "ATTEMPTS");
            for action in &status.actions {
                println!(
                    "{:<12} {:<28} {:<10} {}/{}",
                    action.key,
                    action.kind.label(),
                    action.status,
                    action.attempt_count,
                    action.max_attempts
                );
                if let Some(error) = &action.last_error {
                    println!("{:<12} error: {}", "", error);
                }
            }
        }
        OutputFormat::Json => print_json(&ActionPlanner::describe(status))?,
    }
    Ok(())
}

/// Run the scheduler until Ctrl-C or SIGTERM
pub async fn handle_worker(
    registry: &ServiceRegistry,
    poll_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    let scheduler = registry
        .scheduler()
        .await
        .context("Failed to start scheduler")?;
    registry.start_background().await?;

    let poll_interval = poll_ms
        .map(Duration::from_millis)
        .unwrap_or(scheduler.settings().poll_interval);

    if let OutputFormat::Text = format {
        println!(
            "Rhythm worker running (poll every {} ms). Press Ctrl-C to stop.",
            poll_interval.as_millis()
        );
    }

    let worker = {
        let scheduler = std::sync::Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_forever(poll_interval).await })
    };

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown();

    worker
        .await
        .context("Worker task panicked")?
        .context("Worker stopped with an error")?;

    if let OutputFormat::Json = format {
        print_json(&json!({ "stopped": true }))?;
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub async fn handle_task(
    registry: &ServiceRegistry,
    owner: &str,
    request: TaskRequest,
    format: OutputFormat,
) -> Result<()> {
    let result = registry
        .orchestrator()
        .await?
        .create_task_workflow(owner, request)
        .await
        .context("Create-task workflow failed")?;
    print_workflow(&result, format)
}

pub async fn handle_daily(registry: &ServiceRegistry, owner: &str, format: OutputFormat) -> Result<()> {
    let result = registry
        .orchestrator()
        .await?
        .daily_optimization_workflow(owner)
        .await
        .context("Daily optimization workflow failed")?;
    print_workflow(&result, format)
}

pub async fn handle_mood(
    registry: &ServiceRegistry,
    owner: &str,
    entry: MoodEntry,
    format: OutputFormat,
) -> Result<()> {
    let result = registry
        .orchestrator()
        .await?
        .mood_checkin_workflow(owner, entry)
        .await
        .context("Mood check-in workflow failed")?;
    print_workflow(&result, format)
}

pub async fn handle_plan(registry: &ServiceRegistry, plan_id: &str, format: OutputFormat) -> Result<()> {
    let status = registry.planner().await?.get_plan(plan_id).await?;
    print_plan(&status, format)
}

pub async fn handle_chain(
    registry: &ServiceRegistry,
    name: &str,
    owner: &str,
    input: &str,
    use_cache: bool,
    format: OutputFormat,
) -> Result<()> {
    let inputs: Value = serde_json::from_str(input).context("--input is not valid JSON")?;
    let output = registry
        .chains()
        .await?
        .run_named(name, &inputs, owner, use_cache)
        .await?;

    match format {
        OutputFormat::Text => {
            println!("{}", serde_json::to_string_pretty(&output.value)?);
            if output.degraded {
                println!("(fallback result: the model was unavailable)");
            } else if output.cached {
                println!("(cached)");
            }
        }
        OutputFormat::Json => print_json(&output)?,
    }
    Ok(())
}

pub async fn handle_cancel(registry: &ServiceRegistry, action_id: &str, format: OutputFormat) -> Result<()> {
    let cancelled = registry.planner().await?.cancel(action_id).await?;
    match format {
        OutputFormat::Text => {
            if cancelled.is_empty() {
                println!("Action {} was already cancelled.", action_id);
            } else {
                println!("Cancelled {} action(s):", cancelled.len());
                for id in &cancelled {
                    println!("  {}", id);
                }
            }
        }
        OutputFormat::Json => print_json(&json!({ "cancelled": cancelled }))?,
    }
    Ok(())
}

pub async fn handle_sweep(registry: &ServiceRegistry, format: OutputFormat) -> Result<()> {
    let report = registry.sweep().await.context("Sweep failed")?;
    match format {
        OutputFormat::Text => {
            println!("Expired memory records removed: {}", report.memory_records);
            println!("Expired store rows removed:     {}", report.expired_rows);
            println!("Finished actions purged:        {}", report.purged_actions);
        }
        OutputFormat::Json => print_json(&report)?,
    }
    Ok(())
}
