//! Nixsafe Control - CLI client for the Safe Execution Engine
//!
//! Submits a recognized request (kind + entities) to the engine and prints
//! the outcome. The process exit code mirrors the outcome:
//! 0 executed, 1 execution failed, 2 rejected by validation,
//! 3 rejected by policy, 4 needs confirmation.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nixsafectl")]
#[command(about = "Nixsafe - validated, sandboxed, reversible system changes", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to /etc/nixsafe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a request
    Run {
        /// Operation kind (install-package, search-package, help, ...)
        kind: Option<String>,

        /// Extracted entity as key=value (repeatable)
        #[arg(long = "entity", short = 'e')]
        entities: Vec<String>,

        /// Read the whole intent as JSON from a file ("-" for stdin)
        #[arg(long, conflicts_with = "kind")]
        intent_json: Option<PathBuf>,

        /// Preview only (show what would be done)
        #[arg(long)]
        dry_run: bool,

        /// Confirm operations that require it
        #[arg(long, short = 'y')]
        yes: bool,

        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Return the system to an earlier generation
    Rollback {
        /// Target generation (defaults to the previous one)
        #[arg(long)]
        generation: Option<u64>,

        #[arg(long)]
        dry_run: bool,

        #[arg(long, short = 'y')]
        yes: bool,

        #[arg(long)]
        json: bool,
    },

    /// List system generations and restore points
    Generations {
        #[arg(long)]
        json: bool,
    },

    /// Show recent audit records
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and exit
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("NIXSAFE_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = commands::load_config(cli.config.as_deref())?;

    let code = match cli.command {
        Commands::Run {
            kind,
            entities,
            intent_json,
            dry_run,
            yes,
            json,
        } => {
            let intent = commands::intent_from_args(kind.as_deref(), &entities, intent_json.as_deref())?;
            commands::run(config, intent, dry_run, yes, json).await?
        }
        Commands::Rollback {
            generation,
            dry_run,
            yes,
            json,
        } => commands::rollback(config, generation, dry_run, yes, json).await?,
        Commands::Generations { json } => commands::generations(config, json)?,
        Commands::Audit { limit, json } => commands::audit(config, limit, json)?,
        Commands::CheckConfig => commands::check_config(&config)?,
    };

    std::process::exit(code);
}
