//! Input Validator v0.2.0
//!
//! Turns an Intent into an OperationPlan, rejecting anything that could
//! change the process boundary on the way. Stages run in order and the first
//! rejection wins:
//! 1. package / service names (strict identifier pattern, reserved tokens)
//! 2. free-text search query (length, shell metacharacters)
//! 3. assembled argv (executable allow-list, metacharacters)
//! 4. destructive-pattern detector
//! 5. complexity guard (plan step count)
//!
//! Missing input is always a rejection. The validator holds no mutable state
//! so `validate` is idempotent.

use crate::classifier::classify;
use crate::command_whitelist::{ArgvValidator, TemplateRegistry, WhitelistError, REBUILD_MODES};
use crate::config::ValidationConfig;
use crate::destructive_patterns::DestructivePatternDetector;
use crate::error::{ConfigError, ValidationError};
use crate::types::{AccessClass, Intent, OperationKind, ValidationResult};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Entity keys read from an Intent
pub mod entity {
    pub const PACKAGE: &str = "package";
    pub const PACKAGES: &str = "packages";
    pub const QUERY: &str = "query";
    pub const SERVICE: &str = "service";
    pub const MODE: &str = "mode";
    pub const GENERATION: &str = "generation";
}

const HELP_TEXT: &str = "\
Supported requests:
  install <package>        install a package into the profile
  remove <package>         remove a package from the profile
  search <query>           search nixpkgs
  update                   update channels and rebuild the system
  configure [switch|boot|test]
                           rebuild the system configuration
  start|stop|status <service>
                           manage a systemd service
  list                     list installed packages
  rollback [generation]    return to an earlier system generation
Mutating requests can be previewed with a dry run first.";

/// Validated, fully assembled work for one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationPlan {
    pub kind: OperationKind,
    pub access_class: AccessClass,
    /// Human phrase for previews ("install firefox")
    pub action: String,
    /// One argv per step; empty for help
    pub steps: Vec<Vec<String>>,
    /// Text-only response for requests that never spawn anything
    pub message: Option<String>,
    /// Explicit rollback target, when given
    pub target_generation: Option<u64>,
}

/// A validation failure together with what the user might try instead
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub error: ValidationError,
    pub suggestions: Vec<String>,
}

impl Rejection {
    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn to_validation_result(&self) -> ValidationResult {
        let mut result = ValidationResult::reject(self.error.to_string());
        result.suggestions = self.suggestions.clone();
        result
    }
}

impl From<ValidationError> for Rejection {
    fn from(error: ValidationError) -> Self {
        Self {
            error,
            suggestions: Vec::new(),
        }
    }
}

fn unsafe_field(field: &str, detail: impl Into<String>) -> Rejection {
    ValidationError::UnsafePattern {
        field: field.to_string(),
        detail: detail.into(),
    }
    .into()
}

fn invalid_field(field: &str, detail: impl Into<String>) -> Rejection {
    ValidationError::InvalidType {
        field: field.to_string(),
        detail: detail.into(),
    }
    .into()
}

// ============================================================================
// Input Validator
// ============================================================================

pub struct InputValidator {
    package_pattern: Regex,
    service_pattern: Regex,
    reserved_names: Vec<String>,
    max_name_len: usize,
    max_query_len: usize,
    max_plan_steps: usize,
    system_profile: String,
    registry: TemplateRegistry,
    argv_validator: ArgvValidator,
    detector: DestructivePatternDetector,
}

impl InputValidator {
    /// Build from config. The system activation script of the configured
    /// profile is added to the executable allow-list.
    pub fn new(config: &ValidationConfig, system_profile: &Path) -> Result<Self, ConfigError> {
        if config.allowed_executables.is_empty() {
            return Err(ConfigError::Invalid(
                "executable allow-list is empty".to_string(),
            ));
        }
        if config.max_package_name_len == 0 {
            return Err(ConfigError::Invalid(
                "max_package_name_len must be > 0".to_string(),
            ));
        }

        let tail = config.max_package_name_len - 1;
        let package_pattern = Regex::new(&format!(r"^[A-Za-z0-9][A-Za-z0-9._-]{{0,{}}}$", tail))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let service_pattern = Regex::new(&format!(r"^[A-Za-z0-9][A-Za-z0-9@._:-]{{0,{}}}$", tail))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let system_profile = system_profile.to_string_lossy().into_owned();
        let mut allowed = config.allowed_executables.clone();
        allowed.push(format!("{}/bin/switch-to-configuration", system_profile));

        Ok(Self {
            package_pattern,
            service_pattern,
            reserved_names: config.reserved_names.clone(),
            max_name_len: config.max_package_name_len,
            max_query_len: config.max_query_len,
            max_plan_steps: config.max_plan_steps,
            system_profile,
            registry: TemplateRegistry::new(),
            argv_validator: ArgvValidator::new(allowed),
            detector: DestructivePatternDetector::new(&config.destructive_patterns)?,
        })
    }

    /// Aggregate verdict for a request; first failing stage wins
    pub fn validate(&self, intent: &Intent, access_class: AccessClass) -> ValidationResult {
        match self.plan(intent, access_class) {
            Ok(_) => ValidationResult::pass(),
            Err(rejection) => rejection.to_validation_result(),
        }
    }

    /// Validate and assemble the argv steps for a request
    pub fn plan(&self, intent: &Intent, access_class: AccessClass) -> Result<OperationPlan, Rejection> {
        let expected = classify(intent.kind);
        if expected != access_class {
            return Err(ValidationError::PolicyViolation(format!(
                "{} requests are {}, not {}",
                intent.kind, expected, access_class
            ))
            .into());
        }

        let plan = match intent.kind {
            OperationKind::Unknown => {
                return Err(Rejection::from(ValidationError::PolicyViolation(
                    "unrecognized request".to_string(),
                ))
                .with_suggestion("try 'install firefox' or 'search text editor'")
                .with_suggestion("ask for help to list supported requests"));
            }
            OperationKind::Help => OperationPlan {
                kind: intent.kind,
                access_class,
                action: "show help".to_string(),
                steps: Vec::new(),
                message: Some(HELP_TEXT.to_string()),
                target_generation: None,
            },
            OperationKind::InstallPackage | OperationKind::RemovePackage => {
                self.package_plan(intent, access_class)?
            }
            OperationKind::SearchPackage => {
                let query = self.check_query(intent.entity(entity::QUERY))?;
                self.template_plan(intent, access_class, "search", &[(entity::QUERY, query)])?
            }
            OperationKind::StartService | OperationKind::StopService | OperationKind::ServiceStatus => {
                let service = self.check_service_name(intent.entity(entity::SERVICE))?;
                let id = match intent.kind {
                    OperationKind::StartService => "service_start",
                    OperationKind::StopService => "service_stop",
                    _ => "service_status",
                };
                self.template_plan(intent, access_class, id, &[(entity::SERVICE, service)])?
            }
            OperationKind::Configure => {
                let mode = self.check_mode(intent.entity(entity::MODE))?;
                self.template_plan(intent, access_class, "configure", &[(entity::MODE, mode)])?
            }
            OperationKind::UpdateSystem => self.template_plan(intent, access_class, "update", &[])?,
            OperationKind::ListInstalled => {
                self.template_plan(intent, access_class, "list_installed", &[])?
            }
            OperationKind::Rollback => match intent.entity(entity::GENERATION) {
                Some(raw) => {
                    let generation = self.check_generation(raw)?;
                    let mut plan = self.template_plan(
                        intent,
                        access_class,
                        "rollback_to",
                        &[
                            ("profile", self.system_profile.clone()),
                            (entity::GENERATION, generation.to_string()),
                        ],
                    )?;
                    plan.target_generation = Some(generation);
                    plan
                }
                None => self.template_plan(intent, access_class, "rollback_previous", &[])?,
            },
        };

        // Stages 3 and 4 on every assembled step
        for argv in &plan.steps {
            self.argv_validator.verify(argv)?;
            if let Some(name) = self.detector.find(argv) {
                return Err(unsafe_field("command", format!("matches {}", name)));
            }
        }

        // Stage 5
        if plan.steps.len() > self.max_plan_steps {
            return Err(Rejection::from(ValidationError::TooComplex {
                steps: plan.steps.len(),
                max: self.max_plan_steps,
            })
            .with_suggestion(format!(
                "split the request into batches of at most {} steps",
                self.max_plan_steps
            )));
        }

        debug!(kind = %plan.kind, steps = plan.steps.len(), "validation passed");
        Ok(plan)
    }

    // ------------------------------------------------------------------------
    // Plan assembly
    // ------------------------------------------------------------------------

    fn package_plan(&self, intent: &Intent, access_class: AccessClass) -> Result<OperationPlan, Rejection> {
        let names: Vec<&str> = match intent.entity(entity::PACKAGES) {
            Some(list) => list
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .collect(),
            None => intent.entity(entity::PACKAGE).into_iter().collect(),
        };

        if names.is_empty() {
            return Err(invalid_field("package name", "missing"));
        }

        for name in &names {
            self.check_package_name(Some(name))?;
        }

        let id = if intent.kind == OperationKind::InstallPackage {
            "install"
        } else {
            "remove"
        };

        let mut steps = Vec::with_capacity(names.len());
        for name in &names {
            let params = HashMap::from([(entity::PACKAGE.to_string(), name.to_string())]);
            steps.extend(self.registry.build_argv(id, &params).map_err(whitelist_rejection)?);
        }

        let verb = if id == "install" { "install" } else { "remove" };
        Ok(OperationPlan {
            kind: intent.kind,
            access_class,
            action: format!("{} {}", verb, names.join(", ")),
            steps,
            message: None,
            target_generation: None,
        })
    }

    fn template_plan(
        &self,
        intent: &Intent,
        access_class: AccessClass,
        id: &str,
        params: &[(&str, String)],
    ) -> Result<OperationPlan, Rejection> {
        let params: HashMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let steps = self.registry.build_argv(id, &params).map_err(whitelist_rejection)?;
        let action = self.registry.describe(id, &params).map_err(whitelist_rejection)?;

        Ok(OperationPlan {
            kind: intent.kind,
            access_class,
            action,
            steps,
            message: None,
            target_generation: None,
        })
    }

    // ------------------------------------------------------------------------
    // Stage 1: names
    // ------------------------------------------------------------------------

    pub fn check_package_name(&self, name: Option<&str>) -> Result<String, Rejection> {
        self.check_identifier("package name", name, &self.package_pattern)
    }

    pub fn check_service_name(&self, name: Option<&str>) -> Result<String, Rejection> {
        self.check_identifier("service name", name, &self.service_pattern)
    }

    fn check_identifier(&self, field: &str, value: Option<&str>, pattern: &Regex) -> Result<String, Rejection> {
        let value = match value {
            Some(v) if !v.is_empty() => v,
            _ => return Err(invalid_field(field, "missing")),
        };

        if let Some(c) = value.chars().find(|c| crate::command_whitelist::SHELL_METACHARS.contains(c)) {
            let rejection = unsafe_field(
                field,
                format!("'{}' contains shell metacharacter '{}'", value.escape_debug(), c.escape_debug()),
            );
            return Err(match closest_valid_prefix(value, pattern) {
                Some(prefix) => rejection.with_suggestion(format!("did you mean '{}'?", prefix)),
                None => rejection,
            });
        }

        if value.contains('/') || value.contains("..") {
            return Err(unsafe_field(field, format!("'{}' looks like a path", value)));
        }

        if self.reserved_names.iter().any(|r| r == value) {
            return Err(unsafe_field(field, format!("'{}' is a reserved name", value)));
        }

        if value.starts_with('-') || value.starts_with('.') {
            return Err(unsafe_field(
                field,
                format!("'{}' must start with a letter or digit", value),
            ));
        }

        if value.chars().count() > self.max_name_len {
            return Err(invalid_field(
                field,
                format!("longer than {} characters", self.max_name_len),
            ));
        }

        if !pattern.is_match(value) {
            let rejection = invalid_field(
                field,
                format!("'{}' has characters outside letters, digits, '.', '_' and '-'", value),
            );
            return Err(match closest_valid_prefix(value, pattern) {
                Some(prefix) => rejection.with_suggestion(format!("did you mean '{}'?", prefix)),
                None => rejection,
            });
        }

        Ok(value.to_string())
    }

    // ------------------------------------------------------------------------
    // Stage 2: search query
    // ------------------------------------------------------------------------

    pub fn check_query(&self, query: Option<&str>) -> Result<String, Rejection> {
        let raw = query.unwrap_or_default();

        // Metacharacters count anywhere in the raw value, surrounding whitespace included
        if let Some(c) = raw.chars().find(|c| crate::command_whitelist::SHELL_METACHARS.contains(c)) {
            return Err(unsafe_field(
                "search query",
                format!("contains shell metacharacter '{}'", c.escape_debug()),
            )
            .with_suggestion("search using plain words only"));
        }

        let query = raw.trim();
        if query.is_empty() {
            return Err(invalid_field("search query", "missing"));
        }

        if query.chars().count() > self.max_query_len {
            return Err(invalid_field(
                "search query",
                format!("longer than {} characters", self.max_query_len),
            ));
        }

        if query.starts_with('-') {
            return Err(unsafe_field("search query", "must not start with '-'"));
        }

        Ok(query.to_string())
    }

    // ------------------------------------------------------------------------
    // Other entities
    // ------------------------------------------------------------------------

    fn check_mode(&self, mode: Option<&str>) -> Result<String, Rejection> {
        let mode = mode.unwrap_or("switch");
        if REBUILD_MODES.contains(&mode) {
            return Ok(mode.to_string());
        }
        Err(invalid_field("rebuild mode", format!("'{}' is not supported", mode.escape_debug()))
            .with_suggestion(format!("use one of: {}", REBUILD_MODES.join(", "))))
    }

    fn check_generation(&self, raw: &str) -> Result<u64, Rejection> {
        if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid_field(
                "generation",
                format!("'{}' is not a generation number", raw.escape_debug()),
            ));
        }
        raw.parse::<u64>()
            .ok()
            .filter(|g| *g > 0)
            .ok_or_else(|| invalid_field("generation", format!("'{}' is out of range", raw)))
    }
}

fn whitelist_rejection(error: WhitelistError) -> Rejection {
    match error {
        WhitelistError::UnsafeParameter(value) => unsafe_field(
            "parameter",
            format!("'{}' contains shell metacharacters", value.escape_debug()),
        ),
        other => ValidationError::PolicyViolation(other.to_string()).into(),
    }
}

/// Longest prefix of `value` that is itself a valid identifier
fn closest_valid_prefix(value: &str, pattern: &Regex) -> Option<String> {
    let prefix: String = value
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let prefix = prefix.trim_end_matches(['.', '-']);
    if !prefix.is_empty() && pattern.is_match(prefix) {
        Some(prefix.to_string())
    } else {
        None
    }
}
