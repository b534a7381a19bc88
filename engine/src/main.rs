// Rhythm workflow engine
// Main entry point for the rhythm binary

use clap::Parser;
use rhythm_engine::cli::{Cli, Command};
use rhythm_engine::config::Config;
use rhythm_engine::handlers::{
    describe_error, handle_cancel, handle_chain, handle_daily, handle_mood, handle_plan,
    handle_sweep, handle_task, handle_worker, OutputFormat,
};
use rhythm_engine::orchestrator::{MoodEntry, TaskRequest};
use rhythm_engine::registry::ServiceRegistry;
use rhythm_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // CLI flag beats config; RUST_LOG beats both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));
    tracing::info!("Rhythm Engine v{}", env!("CARGO_PKG_VERSION"));

    let registry = ServiceRegistry::new(config);

    let result = match cli.command {
        Command::Worker { poll_ms } => handle_worker(&registry, poll_ms, format).await,

        Command::Task {
            title,
            owner,
            description,
            tags,
        } => {
            let request = TaskRequest {
                description,
                tags,
                ..TaskRequest::new(title)
            };
            handle_task(&registry, &owner, request, format).await
        }

        Command::Daily { owner } => handle_daily(&registry, &owner, format).await,

        Command::Mood { score, owner, note } => {
            let entry = MoodEntry {
                note,
                ..MoodEntry::new(score)
            };
            handle_mood(&registry, &owner, entry, format).await
        }

        Command::Plan { plan_id } => handle_plan(&registry, &plan_id, format).await,

        Command::Chain {
            name,
            owner,
            input,
            no_cache,
        } => handle_chain(&registry, &name, &owner, &input, !no_cache, format).await,

        Command::Cancel { action_id } => handle_cancel(&registry, &action_id, format).await,

        Command::Sweep => handle_sweep(&registry, format).await,
    };

    // Close the store even when the command failed
    if let Err(e) = registry.teardown().await {
        tracing::warn!("Teardown failed: {}", e);
    }

    if let Err(e) = result {
        eprintln!("{}", describe_error(&e));
        std::process::exit(1);
    }
    Ok(())
}
