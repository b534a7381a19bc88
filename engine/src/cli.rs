//! CLI interface for Rhythm
//!
//! Defines the commands and global flags using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Rhythm workflow engine
///
/// Runs the background worker, triggers workflows and inspects plans.
#[derive(Parser, Debug)]
#[command(name = "rhythm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the background scheduler until interrupted
    Worker {
        /// Override the poll interval in milliseconds
        #[arg(long, value_name = "MS")]
        poll_ms: Option<u64>,
    },

    /// Start the create-task workflow
    Task {
        /// Task title
        title: String,

        /// Owner the task belongs to
        #[arg(long)]
        owner: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,

        /// Tags, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Start the daily optimization workflow
    Daily {
        #[arg(long)]
        owner: String,
    },

    /// Record a mood check-in (1-10)
    Mood {
        score: u8,

        #[arg(long)]
        owner: String,

        /// Free-form note
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Show a plan and its actions
    Plan {
        /// Plan ID returned by a workflow
        plan_id: String,
    },

    /// Run a single chain
    Chain {
        /// Chain name, e.g. task_analysis
        name: String,

        #[arg(long)]
        owner: String,

        /// Inputs as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,

        /// Skip the cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Cancel an action and, when cascading, its dependents
    Cancel {
        action_id: String,
    },

    /// Remove expired memory and store rows, and purge old finished plans
    Sweep,
}
