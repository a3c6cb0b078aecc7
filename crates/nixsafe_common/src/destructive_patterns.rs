//! Destructive-pattern detector
//!
//! Rejects argument content known to be catastrophic regardless of which
//! allow-listed executable carries it. Patterns are policy data loaded from
//! config; an empty or uncompilable list fails closed.

use crate::error::ConfigError;
use crate::types::ValidationResult;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One named pattern as it appears in config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub name: String,
    pub pattern: String,
}

impl PatternSpec {
    fn new(name: &str, pattern: &str) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
        }
    }
}

/// Built-in catastrophic patterns
pub fn default_destructive_patterns() -> Vec<PatternSpec> {
    vec![
        PatternSpec::new(
            "recursive delete of a root path",
            r"(^|\s)rm\s+(\S+\s+)*-(-recursive|[a-zA-Z]*[rR][a-zA-Z]*)\s+(\S+\s+)*(/\*?|/(bin|boot|dev|etc|home|lib|lib64|nix|proc|root|sys|usr|var)/?|~/?)(\s|$)",
        ),
        PatternSpec::new("root preservation override", r"--no-preserve-root"),
        PatternSpec::new(
            "raw block device write",
            r"(^|\s)dd\s.*of=/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk)",
        ),
        PatternSpec::new(
            "raw block device redirect",
            r">\s*/dev/(sd|hd|vd|xvd|nvme|mmcblk|disk)",
        ),
        PatternSpec::new("filesystem creation", r"(^|\s)mkfs(\.[a-z0-9]+)?(\s|$)"),
        PatternSpec::new("device wipe", r"(^|\s)(wipefs|shred|blkdiscard)\s.*/dev/"),
        PatternSpec::new(
            "recursive permission change on a root path",
            r"(^|\s)(chmod|chown|chgrp)\s+(\S+\s+)*-(-recursive|[a-zA-Z]*R[a-zA-Z]*)\s+(\S+\s+)*/\*?(\s|$)",
        ),
        PatternSpec::new(
            "privilege escalation",
            r"(^|\s|/)(sudo|su|doas|pkexec)(\s|$)",
        ),
        PatternSpec::new("fork bomb", r":\s*\(\s*\)\s*\{[^}]*:\s*\|\s*:"),
        PatternSpec::new(
            "credential database access",
            r"/etc/(shadow|gshadow|sudoers)(\s|$|\.d|/)",
        ),
    ]
}

struct CompiledPattern {
    name: String,
    regex: Regex,
}

/// Compiled detector; construct once per engine
pub struct DestructivePatternDetector {
    patterns: Vec<CompiledPattern>,
}

impl DestructivePatternDetector {
    pub fn new(specs: &[PatternSpec]) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::Invalid(
                "destructive pattern list is empty".to_string(),
            ));
        }

        let patterns = specs
            .iter()
            .map(|spec| {
                Regex::new(&spec.pattern)
                    .map(|regex| CompiledPattern {
                        name: spec.name.clone(),
                        regex,
                    })
                    .map_err(|e| {
                        ConfigError::Invalid(format!("destructive pattern '{}': {}", spec.name, e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { patterns })
    }

    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(&default_destructive_patterns())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Name of the first pattern matching the argv, if any
    pub fn find(&self, argv: &[String]) -> Option<&str> {
        let joined = argv.join(" ");
        self.patterns
            .iter()
            .find(|p| {
                p.regex.is_match(&joined) || argv.iter().any(|arg| p.regex.is_match(arg))
            })
            .map(|p| p.name.as_str())
    }

    pub fn check(&self, argv: &[String]) -> ValidationResult {
        match self.find(argv) {
            Some(name) => ValidationResult::reject(format!("unsafe command: matches {}", name)),
            None => ValidationResult::pass(),
        }
    }
}
