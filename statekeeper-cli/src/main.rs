//! statekeeper-cli - Command-line interface for statekeeper
//!
//! Operates directly on a data directory and schema document.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use statekeeper_runtime::Config;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "statekeeper-cli")]
#[command(about = "Command-line interface for the statekeeper state machine engine")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "STATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Schema document (overrides the configuration)
    #[arg(short, long)]
    schema: Option<PathBuf>,

    /// Data directory (overrides the configuration)
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Acting identity for record commands
    #[arg(short = 'u', long, env = "STATEKEEPER_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Resolve every state of every machine
    Validate,

    /// List the states of a machine
    States {
        /// Machine name
        machine: String,
    },

    /// Print a machine as a Graphviz DOT graph
    Dot {
        /// Machine name
        machine: String,

        /// Style profile (YAML or JSON)
        #[arg(short, long)]
        profile: Option<PathBuf>,
    },

    /// Create or replace a record
    PutRecord {
        /// Model type
        model: String,

        /// Primary key JSON
        pk: String,

        /// Attributes JSON object (or @file.json to read from file)
        #[arg(short, long)]
        attrs: Option<String>,

        /// Role grant as identity=role (repeatable)
        #[arg(short, long = "role")]
        roles: Vec<String>,
    },

    /// Put a record into the initial state
    Init {
        model: String,
        pk: String,

        /// Bound attribute (required when the model has several bindings)
        #[arg(short, long)]
        attribute: Option<String>,
    },

    /// Fire an event on a record
    Trigger {
        model: String,
        pk: String,

        /// Event label
        event: String,

        #[arg(short, long)]
        attribute: Option<String>,
    },

    /// Move a record to a state through the single event leading there
    Set {
        model: String,
        pk: String,

        /// Target state value
        value: String,

        #[arg(short, long)]
        attribute: Option<String>,
    },

    /// List the events available to the identity
    Events {
        model: String,
        pk: String,

        #[arg(short, long)]
        attribute: Option<String>,
    },

    /// Show the journal of a record
    Journal {
        model: String,
        pk: String,

        #[arg(short, long)]
        attribute: Option<String>,
    },

    /// List scheduled timeouts
    Timeouts {
        /// Only timeouts already due
        #[arg(long)]
        due: bool,
    },

    /// Fire every due timeout once
    Sweep,

    /// Mark a record deleted
    DeleteRecord { model: String, pk: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::from_file_with_env(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        },
        None => Config::from_env(),
    };
    if let Some(schema) = cli.schema {
        config.schema.path = Some(schema);
    }
    if let Some(data) = cli.data {
        config.storage.data_dir = data;
    }

    match commands::execute(config, cli.identity, cli.command) {
        Ok(output) => {
            println!("{}", output);
        }
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    }
}
