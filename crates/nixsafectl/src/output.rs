//! Output formatting - ASCII-only terminal output and JSON

use anyhow::Result;
use nixsafe_common::{AuditRecord, EngineConfig, EngineOutcome, GenerationRecord, RollbackOutcome};
use owo_colors::OwoColorize;
use serde_json::{json, Value};

pub fn print_progress(message: &str, percent: u8) {
    eprintln!("{} {}", format!("[{:>3}%]", percent).dimmed(), message);
}

pub fn outcome_json(outcome: &EngineOutcome) -> Value {
    match outcome {
        EngineOutcome::ValidationRejected(result) => json!({
            "outcome": "validation_rejected",
            "reason": result.reason,
            "suggestions": result.suggestions,
        }),
        EngineOutcome::PolicyRejected {
            result,
            needs_confirmation,
        } => {
            let label = if *needs_confirmation {
                "needs_confirmation"
            } else {
                "policy_rejected"
            };
            json!({
                "outcome": label,
                "reason": result.reason,
                "suggestions": result.suggestions,
            })
        }
        EngineOutcome::Executed(report) => {
            let rollback = match &report.rollback {
                Some(RollbackOutcome::Restored(handle)) => json!({ "status": "restored", "generation": handle.id }),
                Some(RollbackOutcome::Failed(e)) => json!({ "status": "failed", "error": e.to_string() }),
                None => Value::Null,
            };
            json!({
                "outcome": "executed",
                "request_id": report.request_id,
                "kind": report.kind,
                "access_class": report.access_class,
                "action": report.action,
                "dry_run": report.dry_run,
                "result": report.result,
                "generation": report.generation,
                "rollback": rollback,
                "rollback_recommended": report.rollback_recommended,
            })
        }
    }
}

pub fn print_outcome(outcome: &EngineOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome_json(outcome))?);
        return Ok(());
    }

    match outcome {
        EngineOutcome::ValidationRejected(result) => {
            println!("{} {}", "[REJECTED]".bright_red(), result.reason);
            print_suggestions(&result.suggestions);
        }
        EngineOutcome::PolicyRejected {
            result,
            needs_confirmation: true,
        } => {
            println!("{} {}", "[CONFIRM]".yellow(), result.reason);
            println!("  re-run with --yes to proceed, or --dry-run to preview");
        }
        EngineOutcome::PolicyRejected { result, .. } => {
            println!("{} {}", "[BLOCKED]".bright_red(), result.reason);
            print_suggestions(&result.suggestions);
        }
        EngineOutcome::Executed(report) => {
            let r = &report.result;
            let label = if report.dry_run {
                "[DRY RUN]".cyan().to_string()
            } else if r.success {
                "[OK]".bright_green().to_string()
            } else {
                "[FAILED]".bright_red().to_string()
            };
            println!("{} {} ({} ms)", label, report.action, r.duration_ms);

            if !r.stdout.is_empty() {
                println!();
                print!("{}", r.stdout);
                if !r.stdout.ends_with('\n') {
                    println!();
                }
            }
            if !r.success {
                if let Some(kind) = r.error_kind {
                    println!("{} {} (exit {})", "error:".bright_red(), kind, r.exit_code);
                }
                if !r.stderr.is_empty() {
                    println!("{}", r.stderr.trim_end().dimmed());
                }
            }

            if let Some(handle) = &report.generation {
                println!("restore point: generation {}", handle.id);
            }
            match &report.rollback {
                Some(RollbackOutcome::Restored(handle)) => {
                    println!("{} restored generation {}", "[ROLLED BACK]".yellow(), handle.id)
                }
                Some(RollbackOutcome::Failed(e)) => println!("{} {}", "[ROLLBACK FAILED]".bright_red(), e),
                None => {}
            }
            if report.rollback_recommended {
                println!(
                    "{} the system may be partially changed; consider 'nixsafectl rollback'",
                    "[NOTE]".yellow()
                );
            }
        }
    }
    Ok(())
}

fn print_suggestions(suggestions: &[String]) {
    for suggestion in suggestions {
        println!("  * {}", suggestion);
    }
}

pub fn print_generations(
    current: Option<u64>,
    available: &[u64],
    history: &[GenerationRecord],
    json: bool,
) -> Result<()> {
    if json {
        let value = json!({
            "current": current,
            "available": available,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match current {
        Some(g) => println!("current generation: {}", g.bright_green()),
        None => println!("current generation: {}", "unknown".yellow()),
    }
    let list = available.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(", ");
    println!("available: {}", if list.is_empty() { "none".to_string() } else { list });

    if !history.is_empty() {
        println!();
        println!("[RESTORE POINTS]");
        for record in history {
            println!(
                "  {:>5}  {}  {}",
                record.id,
                record.created_at.format("%Y-%m-%d %H:%M:%S"),
                record.status.as_str()
            );
        }
    }
    Ok(())
}

pub fn print_audit(records: &[AuditRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("no audit records");
        return Ok(());
    }

    for record in records {
        let status = if record.result_success {
            "ok".bright_green().to_string()
        } else {
            "--".dimmed().to_string()
        };
        println!(
            "{:>6} {} {:<20} {:<20} {} {}",
            record.sequence,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.outcome.as_str(),
            record.operation_kind.as_str(),
            status,
            record.command_summary
        );
        if let Some(reason) = &record.reason {
            println!("       {}", reason.dimmed());
        }
    }
    Ok(())
}

pub fn print_config_ok(config: &EngineConfig) {
    println!("{} configuration is valid", "[OK]".bright_green());
    println!("  state dir:       {}", config.paths.state_dir.display());
    println!("  system profile:  {}", config.paths.system_profile.display());
    println!("  allowed tools:   {}", config.validation.allowed_executables.len());
    println!("  patterns:        {}", config.validation.destructive_patterns.len());
}
