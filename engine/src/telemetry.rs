//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging. Workers and the CLI
//! share one subscriber setup: config-driven level, `RUST_LOG` override,
//! pretty output in debug builds and JSON with spans in release builds.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build the default filter directive for a level.
///
/// Dependencies log at `warn` so sqlx and reqwest chatter stays out of
/// worker output unless `RUST_LOG` asks for it.
pub fn default_filter(log_level: &str) -> String {
    format!("warn,rhythm_engine={},rhythm={}", log_level, log_level)
}

/// Initialize the tracing subscriber with the given log level from config.
///
/// Priority: `RUST_LOG` env var > `log_level` parameter > default "info"
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok();
    }
}

/// Initialize the tracing subscriber with default settings.
pub fn init_telemetry() {
    init_telemetry_with_level("info");
}
