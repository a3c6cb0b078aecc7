//! End-to-end engine scenarios
//!
//! A fake native API stands in for nix: it records every call, flips a
//! temporary system profile link the way a real switch would, and can be
//! told to fail or stall. The timeout scenario uses a real child process.

use async_trait::async_trait;
use nixsafe_common::config::IsolationMode;
use nixsafe_common::destructive_patterns::DestructivePatternDetector;
use nixsafe_common::sandbox::SandboxLauncher;
use nixsafe_common::{
    AuditOutcome, Command, DiskProbe, DiskSpace, EngineConfig, EngineOutcome, ErrorKind, ExecutionError,
    ExecutionRequest, GenerationStatus, Intent, NativeApi, NativeOutput, OperationKind, ProgressReporter,
    RollbackOutcome, SafeExecutionEngine,
};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const GIB: u64 = 1024 * 1024 * 1024;

struct PlentyOfDisk;

impl DiskProbe for PlentyOfDisk {
    fn disk_space(&self, _path: &Path) -> Result<DiskSpace, String> {
        Ok(DiskSpace {
            free_bytes: 80 * GIB,
            total_bytes: 100 * GIB,
        })
    }
}

#[derive(Default)]
struct FakeNixOptions {
    delay: Duration,
    fail_rebuild: bool,
}

struct FakeNix {
    profile: PathBuf,
    options: FakeNixOptions,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeNix {
    fn current(&self) -> u64 {
        let target = fs::read_link(&self.profile).unwrap();
        let name = target.file_name().unwrap().to_string_lossy().into_owned();
        name.trim_start_matches("system-").trim_end_matches("-link").parse().unwrap()
    }

    fn switch_to(&self, generation: u64) {
        let dir = self.profile.parent().unwrap();
        let link = dir.join(format!("system-{}-link", generation));
        if !link.exists() {
            fs::create_dir(&link).unwrap();
        }
        let _ = fs::remove_file(&self.profile);
        symlink(format!("system-{}-link", generation), &self.profile).unwrap();
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NativeApi for FakeNix {
    fn name(&self) -> &str {
        "fake-nix"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supports(&self, _command: &Command) -> bool {
        true
    }

    async fn invoke(&self, command: &Command, _progress: &ProgressReporter) -> Result<NativeOutput, ExecutionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(command.display());

        tokio::time::sleep(self.options.delay).await;

        let mut output = NativeOutput {
            stdout: format!("ran {}\n", command.executable),
            ..Default::default()
        };
        if let Some(pos) = command.args.iter().position(|a| a == "--switch-generation") {
            self.switch_to(command.args[pos + 1].parse().unwrap());
        } else if command.executable == "nixos-rebuild" && command.args.first().map(String::as_str) == Some("switch") {
            self.switch_to(self.current() + 1);
            if self.options.fail_rebuild {
                output.stderr = "error: activation failed\npassword=hunter2\n".to_string();
                output.exit_code = 1;
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(output)
    }
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    engine: SafeExecutionEngine,
    nix: Arc<FakeNix>,
}

fn profile_dir(root: &Path, current: u64) -> PathBuf {
    let profiles = root.join("profiles");
    fs::create_dir_all(&profiles).unwrap();
    for g in 1..=current {
        fs::create_dir(profiles.join(format!("system-{}-link", g))).unwrap();
    }
    let profile = profiles.join("system");
    symlink(format!("system-{}-link", current), &profile).unwrap();
    profile
}

fn base_config(root: &Path, profile: &Path) -> EngineConfig {
    EngineConfig::default()
        .with_state_dir(root.join("state"))
        .with_system_profile(profile)
}

fn harness(options: FakeNixOptions) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let profile = profile_dir(&root, 3);

    let nix = Arc::new(FakeNix {
        profile: profile.clone(),
        options,
        calls: Mutex::new(Vec::new()),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });

    let engine = SafeExecutionEngine::builder(base_config(&root, &profile))
        .native_api(nix.clone())
        .disk_probe(Arc::new(PlentyOfDisk))
        .launcher(SandboxLauncher::new(IsolationMode::None, None))
        .build()
        .unwrap();

    Harness {
        _dir: dir,
        root,
        engine,
        nix,
    }
}

fn install(package: &str) -> Intent {
    Intent::new(OperationKind::InstallPackage).with_entity("package", package)
}

// ============================================================================
// Concrete scenarios
// ============================================================================

#[tokio::test]
async fn scenario_dry_run_install_preview() {
    let h = harness(FakeNixOptions::default());
    let outcome = h
        .engine
        .submit(ExecutionRequest::new(install("firefox")).with_dry_run(true))
        .await;

    let report = outcome.report().expect("executed");
    assert_eq!(report.access_class.as_str(), "install-package");
    assert!(report.result.success);
    assert!(report.result.stdout.starts_with("would install"));
    assert!(report.generation.is_none());

    // Nothing reached the tool and no restore point was taken
    assert!(h.nix.calls().is_empty());
    assert!(h.engine.generations().history().unwrap().is_empty());

    let records = h.engine.audit().recent(10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, AuditOutcome::DryRun);
    assert!(records[0].dry_run);
}

#[tokio::test]
async fn scenario_injection_rejected_before_policy() {
    let h = harness(FakeNixOptions::default());
    let outcome = h
        .engine
        .submit(ExecutionRequest::new(install("pkg;rm -rf /")).with_confirmation(true))
        .await;

    match &outcome {
        EngineOutcome::ValidationRejected(result) => {
            assert!(!result.is_safe);
            assert!(result.reason.contains("unsafe"), "{}", result.reason);
        }
        other => panic!("expected validation rejection, got {:?}", other),
    }
    assert!(h.nix.calls().is_empty());
    assert_eq!(h.engine.audit().recent(10).len(), 1);
}

#[tokio::test]
async fn scenario_concurrent_updates_serialize() {
    let h = harness(FakeNixOptions {
        delay: Duration::from_millis(150),
        ..Default::default()
    });
    let update = || ExecutionRequest::new(Intent::new(OperationKind::UpdateSystem)).with_confirmation(true);

    let (a, b) = tokio::join!(h.engine.submit(update()), h.engine.submit(update()));
    assert_eq!(a.exit_code(), 0);
    assert_eq!(b.exit_code(), 0);

    // Never two tool calls at once, steps of one request never interleaved
    assert_eq!(h.nix.max_in_flight.load(Ordering::SeqCst), 1);
    let calls = h.nix.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[0].starts_with("nix-channel") && calls[1].starts_with("nixos-rebuild"));
    assert!(calls[2].starts_with("nix-channel") && calls[3].starts_with("nixos-rebuild"));

    let records = h.engine.audit().recent(100);
    let finals: Vec<_> = records.iter().filter(|r| r.outcome == AuditOutcome::Executed).collect();
    assert_eq!(finals.len(), 2);
    let (first, second) = (finals[0], finals[1]);
    assert_ne!(first.request_id, second.request_id);

    for record in records.iter().filter(|r| r.request_id == second.request_id) {
        assert!(record.timestamp > first.timestamp);
        assert!(record.sequence > first.sequence);
    }
    assert!(!h.engine.lock().is_busy());
}

#[tokio::test]
async fn scenario_timeout_kills_process_and_releases_lock() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();
    let profile = profile_dir(&root, 3);

    // A stand-in `nix` that records its pid and then hangs
    let bin = root.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let pid_file = root.join("nix.pid");
    let script = bin.join("nix");
    fs::write(
        &script,
        format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
    )
    .unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = base_config(&root, &profile);
    config.execution.timeouts.install_secs = 1;
    config.execution.kill_grace_secs = 1;
    config.execution.use_native_backend = false;
    config.execution.child_path = format!("{}:/run/current-system/sw/bin:/usr/bin:/bin", bin.display());

    let engine = SafeExecutionEngine::builder(config)
        .disk_probe(Arc::new(PlentyOfDisk))
        .launcher(SandboxLauncher::new(IsolationMode::None, None))
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let outcome = engine.submit(ExecutionRequest::new(install("hello"))).await;
    assert!(started.elapsed() < Duration::from_secs(15));

    let report = outcome.report().expect("executed");
    assert!(!report.result.success);
    assert_eq!(report.result.error_kind, Some(ErrorKind::Timeout));
    assert!(report.generation.is_some());
    assert!(!engine.lock().is_busy());

    let pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap_or_default();
    let alive = !stat.is_empty() && !stat.contains(") Z");
    assert!(!alive, "process {} still running: {}", pid, stat);
}

#[test]
fn scenario_rm_rf_root_matches_destructive_pattern() {
    let detector = DestructivePatternDetector::with_defaults().unwrap();
    let argv: Vec<String> = ["rm", "-rf", "/"].iter().map(|s| s.to_string()).collect();
    let result = detector.check(&argv);
    assert!(!result.is_safe);
    assert!(result.reason.contains("unsafe"));
}

// ============================================================================
// Ordering and rollback properties
// ============================================================================

#[tokio::test]
async fn snapshot_precedes_execution() {
    let h = harness(FakeNixOptions::default());
    let outcome = h.engine.submit(ExecutionRequest::new(install("ripgrep"))).await;
    let report = outcome.report().expect("executed");
    assert!(report.result.success);
    assert_eq!(report.generation.as_ref().map(|g| g.id), Some(3));

    let records = h.engine.audit().for_request(report.request_id);
    let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(outcomes, vec![AuditOutcome::SnapshotTaken, AuditOutcome::Executed]);
    assert!(records[0].sequence < records[1].sequence);
    assert_eq!(h.nix.calls(), vec!["nix profile install nixpkgs#ripgrep".to_string()]);

    h.engine.accept(report.generation.as_ref().unwrap()).unwrap();
    let history = h.engine.generations().history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].request_id, Some(report.request_id));
}

#[tokio::test]
async fn rollback_of_fresh_snapshot_leaves_generation_unchanged() {
    let h = harness(FakeNixOptions::default());
    let handle = h.engine.generations().snapshot(None).unwrap();
    let result = h.engine.rollback(&handle, ProgressReporter::silent()).await.unwrap();
    assert!(result.success);
    assert_eq!(h.engine.generations().current_generation().unwrap(), 3);
    assert!(h.nix.calls().is_empty());
}

#[tokio::test]
async fn failed_rebuild_restores_snapshot() {
    let h = harness(FakeNixOptions {
        fail_rebuild: true,
        ..Default::default()
    });
    let request = ExecutionRequest::new(Intent::new(OperationKind::Configure).with_entity("mode", "switch"))
        .with_confirmation(true);
    let outcome = h.engine.submit(request).await;

    assert_eq!(outcome.exit_code(), 1);
    let report = outcome.report().expect("executed");
    assert_eq!(report.result.error_kind, Some(ErrorKind::NonZeroExit));
    assert!(!report.result.stderr.contains("hunter2"));
    assert!(matches!(report.rollback, Some(RollbackOutcome::Restored(ref g)) if g.id == 3));
    assert!(!report.rollback_recommended);
    assert_eq!(h.engine.generations().current_generation().unwrap(), 3);

    let outcomes: Vec<_> = h
        .engine
        .audit()
        .for_request(report.request_id)
        .iter()
        .map(|r| r.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![AuditOutcome::SnapshotTaken, AuditOutcome::RolledBack, AuditOutcome::Executed]
    );

    let audit_text = fs::read_to_string(h.root.join("state/audit/audit.jsonl")).unwrap();
    assert!(!audit_text.contains("hunter2"));
}

#[tokio::test]
async fn cancellation_reports_cancelled_and_releases_lock() {
    let h = harness(FakeNixOptions {
        delay: Duration::from_secs(10),
        ..Default::default()
    });
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let request = ExecutionRequest::new(Intent::new(OperationKind::UpdateSystem))
        .with_confirmation(true)
        .with_cancel(cancel);
    let outcome = h.engine.submit(request).await;

    let report = outcome.report().expect("executed");
    assert_eq!(report.result.error_kind, Some(ErrorKind::Cancelled));
    assert!(matches!(report.rollback, Some(RollbackOutcome::Restored(_))));
    assert!(!h.engine.lock().is_busy());
}

#[tokio::test]
async fn rollback_without_generation_goes_to_previous() {
    let h = harness(FakeNixOptions::default());
    let request = ExecutionRequest::new(Intent::new(OperationKind::Rollback)).with_confirmation(true);
    let outcome = h.engine.submit(request).await;

    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome);
    assert_eq!(h.engine.generations().current_generation().unwrap(), 2);
    let calls = h.nix.calls();
    assert!(calls[0].contains("--switch-generation 2"));
}

fn rollback_to(generation: &str) -> ExecutionRequest {
    let intent = Intent::new(OperationKind::Rollback).with_entity("generation", generation);
    ExecutionRequest::new(intent).with_confirmation(true)
}

#[tokio::test]
async fn rollback_to_future_generation_rejected() {
    let h = harness(FakeNixOptions::default());
    let outcome = h.engine.submit(rollback_to("9")).await;

    assert_eq!(outcome.exit_code(), 2, "{:?}", outcome);
    match &outcome {
        EngineOutcome::ValidationRejected(result) => {
            assert!(result.reason.contains("invalid generation handle 9"), "{}", result.reason)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(h.nix.calls().is_empty());
    assert_eq!(h.engine.generations().current_generation().unwrap(), 3);
    assert!(h.engine.generations().history().unwrap().is_empty());
    assert!(!h.engine.lock().is_busy());
}

#[tokio::test]
async fn rollback_to_removed_generation_rejected() {
    let h = harness(FakeNixOptions::default());
    fs::remove_dir(h.root.join("profiles/system-1-link")).unwrap();

    let outcome = h.engine.submit(rollback_to("1")).await;
    assert_eq!(outcome.exit_code(), 2, "{:?}", outcome);
    assert!(outcome.rejection().unwrap().reason.contains("no longer exists"));
    assert!(h.nix.calls().is_empty());
}

#[tokio::test]
async fn explicit_rollback_is_verified_and_recorded() {
    let h = harness(FakeNixOptions::default());
    let outcome = h.engine.submit(rollback_to("1")).await;

    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome);
    assert_eq!(h.engine.generations().current_generation().unwrap(), 1);
    assert!(h.nix.calls()[0].contains("--switch-generation 1"));

    let history = h.engine.generations().history().unwrap();
    assert!(history
        .iter()
        .any(|r| r.id == 1 && r.status == GenerationStatus::RolledBack));
    assert!(history
        .iter()
        .any(|r| r.id == 3 && r.status == GenerationStatus::Pending));
}

#[tokio::test]
async fn read_only_requests_skip_snapshot() {
    let h = harness(FakeNixOptions::default());
    let outcome = h
        .engine
        .submit(ExecutionRequest::new(Intent::new(OperationKind::ListInstalled)))
        .await;
    let report = outcome.report().expect("executed");
    assert!(report.result.success);
    assert!(report.generation.is_none());
    assert!(h.engine.generations().history().unwrap().is_empty());
    assert_eq!(h.nix.calls(), vec!["nix profile list".to_string()]);
}

#[tokio::test]
async fn validate_is_idempotent() {
    let h = harness(FakeNixOptions::default());
    let intent = Intent::new(OperationKind::SearchPackage).with_entity("query", "text editor");
    assert_eq!(h.engine.validate(&intent), h.engine.validate(&intent));

    let missing = Intent::new(OperationKind::InstallPackage);
    assert!(!h.engine.validate(&missing).is_safe);
}
