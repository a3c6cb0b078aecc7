//! Safe Execution Engine
//!
//! One entry point per request:
//!
//!   Intent -> classify -> validate -> policy
//!          -> dry run: preview, stop
//!          -> real: [lock, snapshot] -> execute -> [rollback on failure] -> audit
//!
//! Read-only requests take the shared side of the execution lock so they
//! never overlap a mutation. Mutating requests hold the exclusive side from
//! before the snapshot until their final audit record is written.
//!
//! Every request produces exactly one final audit record. Snapshots and
//! rollbacks add their own records in between.

use crate::audit_log::{summarize_command, AuditLog, AuditOutcome, AuditRecord};
use crate::classifier::{classify, classify_intent};
use crate::config::EngineConfig;
use crate::error::{ConfigError, PreconditionError, RollbackError};
use crate::execution_lock::{ExecutionLock, MutatingGuard};
use crate::executor_core::{ExecutionContext, SandboxedExecutor};
use crate::generations::{GenerationManager, GenerationProbe, ProfileLinkProbe};
use crate::input_validator::{entity, InputValidator, OperationPlan};
use crate::native_backend::NativeApi;
use crate::policy::{DiskProbe, PolicyChecker, PolicyVerdict, PreconditionContext, StatvfsProbe};
use crate::progress::{checkpoint, ProgressReporter};
use crate::sandbox::{build_command, SandboxLauncher};
use crate::types::{
    AccessClass, Command, ErrorKind, ExecutionResult, GenerationHandle, Intent, OperationKind, ValidationResult,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

// =============================================================================
// Requests and outcomes
// =============================================================================

/// One request to the engine
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub intent: Intent,
    pub dry_run: bool,
    /// Explicit user confirmation for classes that require it
    pub confirmed: bool,
    pub user_id: Option<String>,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

impl ExecutionRequest {
    pub fn new(intent: Intent) -> Self {
        Self {
            intent,
            dry_run: false,
            confirmed: false,
            user_id: None,
            progress: ProgressReporter::silent(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_confirmation(mut self, confirmed: bool) -> Self {
        self.confirmed = confirmed;
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of an automatic rollback after a failed mutation
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackOutcome {
    Restored(GenerationHandle),
    Failed(RollbackError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub request_id: Uuid,
    pub kind: OperationKind,
    pub access_class: AccessClass,
    pub action: String,
    pub dry_run: bool,
    pub result: ExecutionResult,
    /// Restore point taken before a real mutating execution
    pub generation: Option<GenerationHandle>,
    pub rollback: Option<RollbackOutcome>,
    /// The failure may have left partial changes that were not restored
    pub rollback_recommended: bool,
}

/// Exactly one of three outcomes per request
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    ValidationRejected(ValidationResult),
    PolicyRejected {
        result: ValidationResult,
        needs_confirmation: bool,
    },
    Executed(ExecutionReport),
}

impl EngineOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineOutcome::Executed(report) if report.result.success => 0,
            EngineOutcome::Executed(_) => 1,
            EngineOutcome::ValidationRejected(_) => 2,
            EngineOutcome::PolicyRejected {
                needs_confirmation: false,
                ..
            } => 3,
            EngineOutcome::PolicyRejected { .. } => 4,
        }
    }

    pub fn report(&self) -> Option<&ExecutionReport> {
        match self {
            EngineOutcome::Executed(report) => Some(report),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&ValidationResult> {
        match self {
            EngineOutcome::ValidationRejected(result) | EngineOutcome::PolicyRejected { result, .. } => Some(result),
            EngineOutcome::Executed(_) => None,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct EngineBuilder {
    config: EngineConfig,
    native_api: Option<Arc<dyn NativeApi>>,
    disk_probe: Option<Arc<dyn DiskProbe>>,
    generation_probe: Option<Arc<dyn GenerationProbe>>,
    launcher: Option<SandboxLauncher>,
}

impl EngineBuilder {
    pub fn native_api(mut self, api: Arc<dyn NativeApi>) -> Self {
        self.native_api = Some(api);
        self
    }

    pub fn disk_probe(mut self, probe: Arc<dyn DiskProbe>) -> Self {
        self.disk_probe = Some(probe);
        self
    }

    pub fn generation_probe(mut self, probe: Arc<dyn GenerationProbe>) -> Self {
        self.generation_probe = Some(probe);
        self
    }

    pub fn launcher(mut self, launcher: SandboxLauncher) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Refuses to build on invalid policy data
    pub fn build(self) -> Result<SafeExecutionEngine, ConfigError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let validator = Arc::new(InputValidator::new(&config.validation, &config.paths.system_profile)?);
        let executor = Arc::new(match self.launcher {
            Some(launcher) => SandboxedExecutor::with_launcher(&config, self.native_api, launcher),
            None => SandboxedExecutor::new(&config, self.native_api),
        });

        let lock = ExecutionLock::new();
        let policy = PolicyChecker::new(
            config.policy.clone(),
            self.disk_probe.unwrap_or_else(|| Arc::new(StatvfsProbe)),
            lock.clone(),
        );
        let probe = self
            .generation_probe
            .unwrap_or_else(|| Arc::new(ProfileLinkProbe::new(config.paths.system_profile.clone())));
        let generations = GenerationManager::new(probe, validator.clone(), executor.clone(), config.clone());
        let audit = AuditLog::open(config.paths.audit_dir());

        info!(
            state_dir = %config.paths.state_dir.display(),
            native = config.execution.use_native_backend,
            "safe execution engine ready"
        );

        Ok(SafeExecutionEngine {
            config,
            validator,
            policy,
            lock,
            executor,
            generations,
            audit,
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct SafeExecutionEngine {
    config: Arc<EngineConfig>,
    validator: Arc<InputValidator>,
    policy: PolicyChecker,
    lock: ExecutionLock,
    executor: Arc<SandboxedExecutor>,
    generations: GenerationManager,
    audit: AuditLog,
}

/// Per-request bookkeeping shared by the pipeline stages
struct RequestScope<'a> {
    id: Uuid,
    request: &'a ExecutionRequest,
    class: AccessClass,
}

impl RequestScope<'_> {
    fn record(&self, outcome: AuditOutcome) -> AuditRecord {
        AuditRecord::new(self.id, self.request.intent.kind, self.class, outcome)
            .with_dry_run(self.request.dry_run)
            .with_user(self.request.user_id.as_deref())
    }
}

impl SafeExecutionEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            native_api: None,
            disk_probe: None,
            generation_probe: None,
            launcher: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn generations(&self) -> &GenerationManager {
        &self.generations
    }

    pub fn lock(&self) -> &ExecutionLock {
        &self.lock
    }

    /// Validation verdict only; nothing is executed or recorded
    pub fn validate(&self, intent: &Intent) -> ValidationResult {
        self.validator.validate(intent, classify_intent(intent))
    }

    pub async fn submit(&self, request: ExecutionRequest) -> EngineOutcome {
        let scope = RequestScope {
            id: Uuid::new_v4(),
            request: &request,
            class: classify_intent(&request.intent),
        };

        let mut plan = match self.validator.plan(&request.intent, scope.class) {
            Ok(plan) => plan,
            Err(rejection) => return self.reject_validation(&scope, rejection.to_validation_result()),
        };
        request.progress.report("validation passed", checkpoint::VALIDATION_PASSED);

        if let Some(message) = plan.message.take() {
            let result = ExecutionResult::preview(message);
            return self.finish(&scope, &plan, Vec::new(), result, None, None);
        }

        if let Err(result) = self.check_rollback_target(&plan) {
            return self.reject_validation(&scope, result);
        }

        let precondition = PreconditionContext {
            confirmed: request.confirmed,
            dry_run: request.dry_run,
            holds_execution_lock: false,
        };

        if request.dry_run {
            let verdict = self.policy.check_preconditions(scope.class, &precondition);
            if !verdict.is_allowed() {
                return self.reject_policy(&scope, &verdict);
            }
            return self.run_preview(&scope, &plan).await;
        }

        if !scope.class.is_mutating() {
            let verdict = self.policy.check_preconditions(scope.class, &precondition);
            if !verdict.is_allowed() {
                return self.reject_policy(&scope, &verdict);
            }
            let _shared = self.lock.acquire_shared().await;
            let commands = self.commands(&plan);
            let ctx = ExecutionContext::new(request.progress.clone(), request.cancel.clone());
            let result = self.run_commands(&commands, &ctx).await;
            return self.finish(&scope, &plan, commands, result, None, None);
        }

        let verdict = self.policy.check_confirmation(scope.class, &precondition);
        if !verdict.is_allowed() {
            return self.reject_policy(&scope, &verdict);
        }

        let wait = Duration::from_secs(self.config.policy.lock_wait_secs);
        let Some(mut guard) = self.lock.acquire_mutating(scope.id, wait).await else {
            return self.reject_policy(&scope, &PolicyVerdict::Rejected(PreconditionError::ConcurrentOperation));
        };

        let holding = PreconditionContext {
            holds_execution_lock: true,
            ..precondition
        };
        let verdict = self.policy.check_preconditions(scope.class, &holding);
        if !verdict.is_allowed() {
            return self.reject_policy(&scope, &verdict);
        }

        if plan.kind == OperationKind::Rollback {
            if plan.target_generation.is_none() {
                plan = match self.resolve_previous_rollback(&request.intent) {
                    Ok(resolved) => resolved,
                    Err(result) => return self.reject_validation(&scope, result),
                };
            }
            // Generations may have moved while waiting for the lock
            if let Err(result) = self.check_rollback_target(&plan) {
                return self.reject_validation(&scope, result);
            }
        }

        self.run_mutating(&scope, &plan, &mut guard).await
    }

    /// Restore a generation handle returned by an earlier request
    pub async fn rollback(
        &self,
        handle: &GenerationHandle,
        progress: ProgressReporter,
    ) -> Result<ExecutionResult, RollbackError> {
        let request_id = Uuid::new_v4();
        let wait = Duration::from_secs(self.config.policy.lock_wait_secs);
        let Some(mut guard) = self.lock.acquire_mutating(request_id, wait).await else {
            return Err(RollbackError::RestoreFailed(
                PreconditionError::ConcurrentOperation.to_string(),
            ));
        };

        let ctx = ExecutionContext::new(progress, CancellationToken::new());
        let outcome = self.generations.rollback(handle, &ctx).await;
        let record = AuditRecord::new(
            request_id,
            OperationKind::Rollback,
            classify(OperationKind::Rollback),
            AuditOutcome::RolledBack,
        )
        .with_summary(&format!("restore generation {}", handle.id))
        .with_generation(Some(handle.id));

        match &outcome {
            Ok(result) => {
                guard.set_current_generation(handle.id);
                self.audit.record(record.with_result(result));
            }
            Err(e) => {
                let mut record = record.with_reason(&e.to_string()).with_success(false);
                record.outcome = AuditOutcome::RollbackFailed;
                record.error_kind = Some(ErrorKind::RollbackFailed);
                self.audit.record(record);
            }
        }
        outcome
    }

    /// Keep the changes made since `handle` was taken
    pub fn accept(&self, handle: &GenerationHandle) -> Result<(), RollbackError> {
        self.generations.accept(handle)
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    fn commands(&self, plan: &OperationPlan) -> Vec<Command> {
        plan.steps
            .iter()
            .map(|argv| build_command(argv, plan.kind, plan.access_class, &plan.action, &self.config))
            .collect()
    }

    /// Steps run in order and stop at the first failure
    async fn run_commands(&self, commands: &[Command], ctx: &ExecutionContext) -> ExecutionResult {
        ctx.progress.report("execution started", checkpoint::EXECUTION_STARTED);

        let mut combined: Option<ExecutionResult> = None;
        for command in commands {
            let result = self.executor.execute(command, false, ctx).await;
            let ok = result.success;
            match combined.as_mut() {
                Some(c) => c.append(result),
                None => combined = Some(result),
            }
            if !ok {
                break;
            }
        }

        ctx.progress.report("execution finished", checkpoint::EXECUTION_FINISHED);
        combined.unwrap_or_else(|| ExecutionResult::preview(String::new()))
    }

    async fn run_preview(&self, scope: &RequestScope<'_>, plan: &OperationPlan) -> EngineOutcome {
        let commands = self.commands(plan);
        let ctx = ExecutionContext::new(scope.request.progress.clone(), scope.request.cancel.clone());

        let mut stdout = String::new();
        for command in &commands {
            let preview = self.executor.execute(command, true, &ctx).await;
            stdout.push_str(&preview.stdout);
        }
        scope
            .request
            .progress
            .report("dry run complete", checkpoint::EXECUTION_FINISHED);

        self.finish(scope, plan, commands, ExecutionResult::preview(stdout), None, None)
    }

    async fn run_mutating(
        &self,
        scope: &RequestScope<'_>,
        plan: &OperationPlan,
        guard: &mut MutatingGuard,
    ) -> EngineOutcome {
        let request = scope.request;
        let commands = self.commands(plan);

        let handle = match self.generations.snapshot(Some(scope.id)) {
            Ok(handle) => handle,
            Err(e) => {
                error!(request_id = %scope.id, "snapshot failed, not executing: {}", e);
                let result = ExecutionResult::failed(ErrorKind::SnapshotFailed, e.to_string());
                return self.finish(scope, plan, commands, result, None, None);
            }
        };
        guard.set_current_generation(handle.id);
        self.audit.record(
            scope
                .record(AuditOutcome::SnapshotTaken)
                .with_summary(&plan.action)
                .with_generation(Some(handle.id))
                .with_success(true),
        );
        request.progress.report("snapshot taken", checkpoint::SNAPSHOT_TAKEN);

        let ctx = ExecutionContext::new(request.progress.clone(), request.cancel.clone());
        let (result, restore_attempted) = match (plan.kind, plan.target_generation) {
            (OperationKind::Rollback, Some(target)) => (self.restore_target(target, &ctx).await, true),
            _ => (self.run_commands(&commands, &ctx).await, false),
        };

        // A failed restore may have switched the profile half way
        let may_have_mutated = restore_attempted || result.error_kind.is_some_and(|k| k.may_have_mutated());

        let mut rollback = None;
        if result.success {
            match self.generations.current_generation() {
                Ok(current) => guard.set_current_generation(current),
                Err(e) => warn!("cannot read generation after execution: {}", e),
            }
        } else if self.config.auto_rollback_on_failure && may_have_mutated {
            rollback = Some(self.auto_rollback(scope, &handle, guard).await);
        }

        self.finish(scope, plan, commands, result, Some(handle), rollback)
    }

    /// Restore with a fresh token so the cancel that caused the failure
    /// cannot abort the restore
    async fn auto_rollback(
        &self,
        scope: &RequestScope<'_>,
        handle: &GenerationHandle,
        guard: &mut MutatingGuard,
    ) -> RollbackOutcome {
        warn!(request_id = %scope.id, generation = handle.id, "execution failed, restoring snapshot");
        let ctx = ExecutionContext::new(scope.request.progress.clone(), CancellationToken::new());
        let record = scope
            .record(AuditOutcome::RolledBack)
            .with_summary(&format!("restore generation {}", handle.id))
            .with_generation(Some(handle.id));

        match self.generations.rollback(handle, &ctx).await {
            Ok(result) => {
                guard.set_current_generation(handle.id);
                self.audit.record(record.with_result(&result));
                RollbackOutcome::Restored(handle.clone())
            }
            Err(e) => {
                error!(request_id = %scope.id, "automatic rollback failed: {}", e);
                let mut record = record.with_reason(&e.to_string()).with_success(false);
                record.outcome = AuditOutcome::RollbackFailed;
                record.error_kind = Some(ErrorKind::RollbackFailed);
                self.audit.record(record);
                RollbackOutcome::Failed(e)
            }
        }
    }

    /// Explicit rollback targets go through the same checks as `rollback`
    fn check_rollback_target(&self, plan: &OperationPlan) -> Result<(), ValidationResult> {
        match (plan.kind, plan.target_generation) {
            (OperationKind::Rollback, Some(target)) => self
                .generations
                .check_target(target)
                .map(|_| ())
                .map_err(|e| ValidationResult::reject(e.to_string())),
            _ => Ok(()),
        }
    }

    /// Restore through the generation manager so the switch is verified
    /// and recorded in the generation history
    async fn restore_target(&self, target: u64, ctx: &ExecutionContext) -> ExecutionResult {
        ctx.progress.report("execution started", checkpoint::EXECUTION_STARTED);
        let handle = GenerationHandle {
            id: target,
            created_at: Utc::now(),
        };
        let result = match self.generations.rollback(&handle, ctx).await {
            Ok(result) => result,
            Err(e) => {
                error!(generation = target, "restore failed: {}", e);
                ExecutionResult::failed(ErrorKind::RollbackFailed, e.to_string())
            }
        };
        ctx.progress.report("execution finished", checkpoint::EXECUTION_FINISHED);
        result
    }

    fn resolve_previous_rollback(&self, intent: &Intent) -> Result<OperationPlan, ValidationResult> {
        let previous = self
            .generations
            .previous_generation()
            .map_err(|e| ValidationResult::reject(e.to_string()))?;
        let resolved = intent
            .clone()
            .with_entity(entity::GENERATION, &previous.id.to_string());
        self.validator
            .plan(&resolved, classify_intent(&resolved))
            .map_err(|rejection| rejection.to_validation_result())
    }

    // ------------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------------

    fn reject_validation(&self, scope: &RequestScope<'_>, result: ValidationResult) -> EngineOutcome {
        warn!(request_id = %scope.id, kind = %scope.request.intent.kind, "request rejected: {}", result.reason);
        self.audit.record(
            scope
                .record(AuditOutcome::ValidationRejected)
                .with_summary(scope.request.intent.kind.as_str())
                .with_reason(&result.reason),
        );
        EngineOutcome::ValidationRejected(result)
    }

    fn reject_policy(&self, scope: &RequestScope<'_>, verdict: &PolicyVerdict) -> EngineOutcome {
        let needs_confirmation = matches!(verdict, PolicyVerdict::NeedsConfirmation(_));
        let result = verdict.to_validation_result();
        let outcome = if needs_confirmation {
            AuditOutcome::NeedsConfirmation
        } else {
            AuditOutcome::PolicyRejected
        };

        warn!(request_id = %scope.id, class = %scope.class, "policy: {}", result.reason);
        self.audit.record(
            scope
                .record(outcome)
                .with_summary(scope.request.intent.kind.as_str())
                .with_reason(&result.reason),
        );
        EngineOutcome::PolicyRejected {
            result,
            needs_confirmation,
        }
    }

    fn finish(
        &self,
        scope: &RequestScope<'_>,
        plan: &OperationPlan,
        commands: Vec<Command>,
        result: ExecutionResult,
        generation: Option<GenerationHandle>,
        rollback: Option<RollbackOutcome>,
    ) -> EngineOutcome {
        let summary = if commands.is_empty() {
            plan.action.clone()
        } else {
            commands.iter().map(summarize_command).collect::<Vec<_>>().join(" && ")
        };

        let restored = matches!(rollback, Some(RollbackOutcome::Restored(_)));
        let rollback_recommended = !result.success
            && !restored
            && generation.is_some()
            && (plan.kind == OperationKind::Rollback || result.error_kind.is_some_and(|k| k.may_have_mutated()));

        let mut record = scope
            .record(if scope.request.dry_run {
                AuditOutcome::DryRun
            } else {
                AuditOutcome::Executed
            })
            .with_summary(&summary)
            .with_generation(generation.as_ref().map(|h| h.id))
            .with_result(&result);
        if !result.success {
            record = record.with_reason(result.stderr.trim());
        }
        self.audit.record(record);

        if result.success {
            info!(request_id = %scope.id, action = %plan.action, dry_run = scope.request.dry_run, "request complete");
        } else {
            warn!(
                request_id = %scope.id,
                action = %plan.action,
                error = result.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                rollback_recommended,
                "request failed"
            );
        }

        EngineOutcome::Executed(ExecutionReport {
            request_id: scope.id,
            kind: plan.kind,
            access_class: plan.access_class,
            action: plan.action.clone(),
            dry_run: scope.request.dry_run,
            result,
            generation,
            rollback,
            rollback_recommended,
        })
    }
}
