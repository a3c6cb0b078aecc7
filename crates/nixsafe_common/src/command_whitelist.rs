//! Command Whitelist v0.2.0
//!
//! The ONLY command shapes the engine will ever assemble. Each operation is a
//! fixed list of argv templates; user data enters only through `{param}`
//! placeholders, one placeholder per argv token, so a value can never split
//! into extra arguments.
//!
//! Two layers:
//! - `TemplateRegistry` builds argv vectors from templates
//! - `ArgvValidator` re-checks the assembled argv against the executable
//!   allow-list and shell metacharacters (defense in depth: templates are
//!   trusted, parameter values are not)

use crate::error::ValidationError;
use crate::types::{OperationKind, ValidationResult};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Characters that are never allowed inside any argv element
pub const SHELL_METACHARS: &[char] = &[';', '|', '&', '`', '$', '<', '>', '\n', '\r', '\0'];

/// True when `s` contains a shell metacharacter
pub fn contains_shell_metachar(s: &str) -> bool {
    s.chars().any(|c| SHELL_METACHARS.contains(&c))
}

// ============================================================================
// Operation Templates
// ============================================================================

/// An allow-listed operation shape
#[derive(Debug, Clone, Serialize)]
pub struct OperationTemplate {
    /// Unique identifier (e.g. "install", "rollback_to")
    pub id: &'static str,
    pub kind: OperationKind,
    /// Human phrase used in dry-run previews; may contain placeholders
    pub action: &'static str,
    /// One argv template per plan step
    pub steps: &'static [&'static str],
}

/// The complete operation whitelist
pub static OPERATION_TEMPLATES: &[OperationTemplate] = &[
    OperationTemplate {
        id: "install",
        kind: OperationKind::InstallPackage,
        action: "install {package}",
        steps: &["nix profile install nixpkgs#{package}"],
    },
    OperationTemplate {
        id: "remove",
        kind: OperationKind::RemovePackage,
        action: "remove {package}",
        steps: &["nix profile remove {package}"],
    },
    OperationTemplate {
        id: "search",
        kind: OperationKind::SearchPackage,
        action: "search for {query}",
        steps: &["nix search nixpkgs {query}"],
    },
    OperationTemplate {
        id: "update",
        kind: OperationKind::UpdateSystem,
        action: "update the system",
        steps: &["nix-channel --update", "nixos-rebuild switch"],
    },
    OperationTemplate {
        id: "configure",
        kind: OperationKind::Configure,
        action: "rebuild the configuration ({mode})",
        steps: &["nixos-rebuild {mode}"],
    },
    OperationTemplate {
        id: "service_start",
        kind: OperationKind::StartService,
        action: "start service {service}",
        steps: &["systemctl start {service}"],
    },
    OperationTemplate {
        id: "service_stop",
        kind: OperationKind::StopService,
        action: "stop service {service}",
        steps: &["systemctl stop {service}"],
    },
    OperationTemplate {
        id: "service_status",
        kind: OperationKind::ServiceStatus,
        action: "show status of {service}",
        steps: &["systemctl status {service}"],
    },
    OperationTemplate {
        id: "list_installed",
        kind: OperationKind::ListInstalled,
        action: "list installed packages",
        steps: &["nix profile list"],
    },
    OperationTemplate {
        id: "rollback_to",
        kind: OperationKind::Rollback,
        action: "roll back to generation {generation}",
        steps: &[
            "nix-env --profile {profile} --switch-generation {generation}",
            "{profile}/bin/switch-to-configuration switch",
        ],
    },
    OperationTemplate {
        id: "rollback_previous",
        kind: OperationKind::Rollback,
        action: "roll back to the previous generation",
        steps: &["nixos-rebuild switch --rollback"],
    },
];

/// Modes accepted by `nixos-rebuild` for the configure operation
pub const REBUILD_MODES: &[&str] = &["switch", "boot", "test"];

// ============================================================================
// Template Registry
// ============================================================================

/// Registry for looking up and filling operation templates
pub struct TemplateRegistry {
    by_id: HashMap<&'static str, &'static OperationTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        let by_id = OPERATION_TEMPLATES.iter().map(|t| (t.id, t)).collect();
        Self { by_id }
    }

    pub fn get(&self, id: &str) -> Option<&'static OperationTemplate> {
        self.by_id.get(id).copied()
    }

    /// Fill every step of a template. Each template token becomes exactly one
    /// argv element after substitution.
    pub fn build_argv(
        &self,
        id: &str,
        params: &HashMap<String, String>,
    ) -> Result<Vec<Vec<String>>, WhitelistError> {
        let template = self
            .get(id)
            .ok_or_else(|| WhitelistError::CommandNotFound(id.to_string()))?;

        for (key, value) in params {
            let placeholder = format!("{{{}}}", key);
            let used = template.steps.iter().any(|s| s.contains(&placeholder))
                || template.action.contains(&placeholder);
            if !used {
                return Err(WhitelistError::UnknownParameter(key.clone()));
            }
            if value.is_empty() || contains_shell_metachar(value) {
                return Err(WhitelistError::UnsafeParameter(value.clone()));
            }
        }

        template
            .steps
            .iter()
            .map(|step| {
                step.split_whitespace()
                    .map(|token| fill(token, params))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect()
    }

    /// Preview phrase with placeholders filled
    pub fn describe(&self, id: &str, params: &HashMap<String, String>) -> Result<String, WhitelistError> {
        let template = self
            .get(id)
            .ok_or_else(|| WhitelistError::CommandNotFound(id.to_string()))?;
        fill(template.action, params)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn fill(token: &str, params: &HashMap<String, String>) -> Result<String, WhitelistError> {
    let mut result = token.to_string();
    for (key, value) in params {
        result = result.replace(&format!("{{{}}}", key), value);
    }
    if result.contains('{') && result.contains('}') {
        return Err(WhitelistError::MissingParameter(token.to_string()));
    }
    Ok(result)
}

// ============================================================================
// Argv Validator
// ============================================================================

/// Final gate on an assembled argument vector
#[derive(Debug, Clone)]
pub struct ArgvValidator {
    allowed_executables: HashSet<String>,
}

impl ArgvValidator {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_executables: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_allowed(&self, executable: &str) -> bool {
        self.allowed_executables.contains(executable)
    }

    /// argv[0] must be an exact allow-list entry and no element may carry a
    /// shell metacharacter. An empty argv is rejected.
    pub fn verify(&self, argv: &[String]) -> Result<(), ValidationError> {
        let Some(executable) = argv.first() else {
            return Err(ValidationError::UnsafePattern {
                field: "command".to_string(),
                detail: "empty argument list".to_string(),
            });
        };

        if !self.is_allowed(executable) {
            return Err(ValidationError::UnsafePattern {
                field: "command".to_string(),
                detail: format!("'{}' is not an allowed executable", executable),
            });
        }

        for arg in argv {
            if let Some(c) = arg.chars().find(|c| SHELL_METACHARS.contains(c)) {
                return Err(ValidationError::UnsafePattern {
                    field: "argument".to_string(),
                    detail: format!(
                        "'{}' contains shell metacharacter '{}'",
                        arg.escape_debug(),
                        c.escape_debug()
                    ),
                });
            }
        }

        Ok(())
    }

    pub fn check(&self, argv: &[String]) -> ValidationResult {
        match self.verify(argv) {
            Ok(()) => ValidationResult::pass(),
            Err(e) => ValidationResult::reject(e.to_string()),
        }
    }
}

/// Errors from template operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WhitelistError {
    #[error("Operation not in whitelist: {0}")]
    CommandNotFound(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Missing required parameter in: {0}")]
    MissingParameter(String),

    #[error("Unsafe parameter value (contains shell metacharacters): {0}")]
    UnsafeParameter(String),
}
