//! Command handlers for nixsafectl.

use anyhow::{bail, Context, Result};
use nixsafe_common::input_validator::entity;
use nixsafe_common::{
    EngineConfig, ExecutionRequest, Intent, OperationKind, ProgressReporter, SafeExecutionEngine,
};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::output;

/// Explicit path, or the standard locations with defaults as fallback
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::load()),
    }
}

fn build_engine(config: EngineConfig) -> Result<SafeExecutionEngine> {
    SafeExecutionEngine::builder(config)
        .build()
        .context("engine refused to start")
}

/// `key=value` pairs into an Intent
pub fn intent_from_args(kind: Option<&str>, entities: &[String], json: Option<&Path>) -> Result<Intent> {
    if let Some(path) = json {
        let mut content = String::new();
        if path == Path::new("-") {
            std::io::stdin().read_to_string(&mut content)?;
        } else {
            content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        }
        return serde_json::from_str(&content).context("parsing intent JSON");
    }

    let Some(kind) = kind else {
        bail!("an operation kind or --intent-json is required");
    };

    let mut intent = Intent::new(OperationKind::parse(kind));
    for pair in entities {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("entity '{}' is not key=value", pair);
        };
        intent = intent.with_entity(key.trim(), value);
    }
    Ok(intent)
}

fn progress_printer(json: bool) -> ProgressReporter {
    if json {
        return ProgressReporter::silent();
    }
    ProgressReporter::new(Some(Arc::new(|message: &str, percent: u8| {
        output::print_progress(message, percent);
    })))
}

/// Ctrl-C cancels the in-flight request instead of killing the client
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

pub async fn run(config: EngineConfig, intent: Intent, dry_run: bool, yes: bool, json: bool) -> Result<i32> {
    let engine = build_engine(config)?;
    let request = ExecutionRequest::new(intent)
        .with_dry_run(dry_run)
        .with_confirmation(yes)
        .with_progress(progress_printer(json))
        .with_cancel(cancel_on_interrupt());
    let request = match std::env::var("USER") {
        Ok(user) => request.with_user(&user),
        Err(_) => request,
    };

    let outcome = engine.submit(request).await;

    // The command line is the whole session: a successful change is kept
    if let Some(report) = outcome.report() {
        if report.result.success {
            if let Some(handle) = &report.generation {
                if let Err(e) = engine.accept(handle) {
                    warn!("could not mark generation {} accepted: {}", handle.id, e);
                }
            }
        }
    }

    output::print_outcome(&outcome, json)?;
    Ok(outcome.exit_code())
}

pub async fn rollback(
    config: EngineConfig,
    generation: Option<u64>,
    dry_run: bool,
    yes: bool,
    json: bool,
) -> Result<i32> {
    let mut intent = Intent::new(OperationKind::Rollback);
    if let Some(generation) = generation {
        intent = intent.with_entity(entity::GENERATION, &generation.to_string());
    }
    run(config, intent, dry_run, yes, json).await
}

pub fn generations(config: EngineConfig, json: bool) -> Result<i32> {
    let engine = build_engine(config)?;
    let manager = engine.generations();

    let current = manager.current_generation().ok();
    let available = manager.list_generations().unwrap_or_default();
    let history = manager.history()?;

    output::print_generations(current, &available, &history, json)?;
    Ok(0)
}

pub fn audit(config: EngineConfig, limit: usize, json: bool) -> Result<i32> {
    let engine = build_engine(config)?;
    let records = engine.audit().recent(limit);
    output::print_audit(&records, json)?;
    Ok(0)
}

pub fn check_config(config: &EngineConfig) -> Result<i32> {
    config.validate().context("configuration is invalid")?;
    output::print_config_ok(config);
    Ok(0)
}
