//! Engine configuration
//!
//! Loads policy data from /etc/nixsafe/config.toml or uses defaults.
//! Every threshold the engine enforces lives here so it can be tuned
//! without a rebuild. Missing or broken policy data fails closed:
//! `EngineConfig::validate` rejects it and the engine refuses to build.

use crate::destructive_patterns::{default_destructive_patterns, PatternSpec};
use crate::error::ConfigError;
use crate::types::{AccessClass, OperationKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/nixsafe/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/nixsafe/config.toml";

const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Validation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Executables that may appear as argv[0]; exact match
    #[serde(default = "default_allowed_executables")]
    pub allowed_executables: Vec<String>,

    /// Names rejected even though they match the package-name pattern
    #[serde(default = "default_reserved_names")]
    pub reserved_names: Vec<String>,

    #[serde(default = "default_max_package_name_len")]
    pub max_package_name_len: usize,

    #[serde(default = "default_max_query_len")]
    pub max_query_len: usize,

    /// Complexity guard for multi-step plans
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,

    #[serde(default = "default_destructive_patterns")]
    pub destructive_patterns: Vec<PatternSpec>,
}

fn default_allowed_executables() -> Vec<String> {
    [
        "nix",
        "nix-env",
        "nix-channel",
        "nixos-rebuild",
        "systemctl",
        "/nix/var/nix/profiles/system/bin/switch-to-configuration",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_reserved_names() -> Vec<String> {
    vec!["sudo".to_string(), ".".to_string(), "..".to_string()]
}

fn default_max_package_name_len() -> usize {
    100
}

fn default_max_query_len() -> usize {
    200
}

fn default_max_plan_steps() -> usize {
    20
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_executables: default_allowed_executables(),
            reserved_names: default_reserved_names(),
            max_package_name_len: default_max_package_name_len(),
            max_query_len: default_max_query_len(),
            max_plan_steps: default_max_plan_steps(),
            destructive_patterns: default_destructive_patterns(),
        }
    }
}

// =============================================================================
// Safety Policy
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Minimum free/total ratio on the store volume for mutating operations
    #[serde(default = "default_min_free_ratio")]
    pub min_free_ratio: f64,

    /// Minimum absolute free bytes for mutating operations
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Volume checked for free space
    #[serde(default = "default_disk_check_path")]
    pub disk_check_path: PathBuf,

    /// Classes that need an explicit confirmation before real execution
    #[serde(default = "default_confirm_classes")]
    pub confirm_classes: Vec<AccessClass>,

    /// How long a mutating request waits for the global lock
    #[serde(default = "default_lock_wait_secs")]
    pub lock_wait_secs: u64,
}

fn default_min_free_ratio() -> f64 {
    0.10
}

fn default_min_free_bytes() -> u64 {
    2 * GIB
}

fn default_disk_check_path() -> PathBuf {
    PathBuf::from("/nix")
}

fn default_confirm_classes() -> Vec<AccessClass> {
    vec![AccessClass::RemovePackage, AccessClass::ModifyConfiguration]
}

fn default_lock_wait_secs() -> u64 {
    300
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_free_ratio: default_min_free_ratio(),
            min_free_bytes: default_min_free_bytes(),
            disk_check_path: default_disk_check_path(),
            confirm_classes: default_confirm_classes(),
            lock_wait_secs: default_lock_wait_secs(),
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Wall-clock timeouts per access class, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_read_only_timeout")]
    pub read_only_secs: u32,
    #[serde(default = "default_install_timeout")]
    pub install_secs: u32,
    #[serde(default = "default_remove_timeout")]
    pub remove_secs: u32,
    #[serde(default = "default_modify_timeout")]
    pub modify_configuration_secs: u32,
}

fn default_read_only_timeout() -> u32 {
    60
}

fn default_install_timeout() -> u32 {
    1_800 // large closures can take a while to fetch
}

fn default_remove_timeout() -> u32 {
    600
}

fn default_modify_timeout() -> u32 {
    3_600 // nixos-rebuild switch
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_only_secs: default_read_only_timeout(),
            install_secs: default_install_timeout(),
            remove_secs: default_remove_timeout(),
            modify_configuration_secs: default_modify_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn for_class(&self, class: AccessClass) -> u32 {
        match class {
            AccessClass::ReadOnly => self.read_only_secs,
            AccessClass::InstallPackage => self.install_secs,
            AccessClass::RemovePackage => self.remove_secs,
            AccessClass::ModifyConfiguration => self.modify_configuration_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,

    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: u8,

    /// 0 means unlimited
    #[serde(default)]
    pub io_bandwidth: u64,

    /// Grace period between SIGTERM and SIGKILL for the process group
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Prefer the in-process native API when one is registered
    #[serde(default = "default_true")]
    pub use_native_backend: bool,

    /// PATH handed to the child; the only other variable is HOME
    #[serde(default = "default_child_path")]
    pub child_path: String,

    /// HOME handed to the child
    #[serde(default = "default_child_home")]
    pub child_home: String,

    /// Cap per captured stream
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_memory_bytes() -> u64 {
    4 * GIB
}

fn default_cpu_percent() -> u8 {
    100
}

fn default_kill_grace_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_child_path() -> String {
    [
        "/run/wrappers/bin",
        "/run/current-system/sw/bin",
        "/nix/var/nix/profiles/default/bin",
        "/usr/bin",
        "/bin",
    ]
    .join(":")
}

fn default_child_home() -> String {
    "/var/empty".to_string()
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            memory_bytes: default_memory_bytes(),
            cpu_percent: default_cpu_percent(),
            io_bandwidth: 0,
            kill_grace_secs: default_kill_grace_secs(),
            use_native_backend: default_true(),
            child_path: default_child_path(),
            child_home: default_child_home(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

// =============================================================================
// Sandbox
// =============================================================================

/// How the child filesystem/network view is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// bubblewrap when installed, otherwise rlimits only (logged)
    Auto,
    /// bubblewrap required; execution fails when it is missing
    Bubblewrap,
    /// rlimits and minimal env only
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_isolation")]
    pub isolation: IsolationMode,

    #[serde(default = "default_blocked_paths")]
    pub blocked_paths: Vec<PathBuf>,

    /// Re-exposed read-only inside blocked parents
    #[serde(default = "default_read_only_paths")]
    pub read_only_paths: Vec<PathBuf>,

    #[serde(default = "default_writable_paths")]
    pub writable_paths: Vec<PathBuf>,

    /// Explicitly allowed path under a blocked home directory
    #[serde(default)]
    pub allow_path: Option<PathBuf>,

    /// Operations whose tool needs the network
    #[serde(default = "default_network_operations")]
    pub network_operations: Vec<OperationKind>,
}

fn default_isolation() -> IsolationMode {
    IsolationMode::Auto
}

fn default_blocked_paths() -> Vec<PathBuf> {
    ["/etc", "/root", "/home"].iter().map(PathBuf::from).collect()
}

fn default_read_only_paths() -> Vec<PathBuf> {
    [
        "/etc/nix",
        "/etc/nixos",
        "/etc/static",
        "/etc/ssl",
        "/etc/resolv.conf",
        "/etc/passwd",
        "/etc/group",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn default_writable_paths() -> Vec<PathBuf> {
    ["/nix", "/tmp"].iter().map(PathBuf::from).collect()
}

fn default_network_operations() -> Vec<OperationKind> {
    vec![
        OperationKind::InstallPackage,
        OperationKind::SearchPackage,
        OperationKind::UpdateSystem,
        OperationKind::Configure,
    ]
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: default_isolation(),
            blocked_paths: default_blocked_paths(),
            read_only_paths: default_read_only_paths(),
            writable_paths: default_writable_paths(),
            allow_path: None,
            network_operations: default_network_operations(),
        }
    }
}

// =============================================================================
// Paths
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Audit log and generation history; hidden from the sandbox
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// NixOS system profile symlink
    #[serde(default = "default_system_profile")]
    pub system_profile: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/nixsafe")
}

fn default_system_profile() -> PathBuf {
    PathBuf::from("/nix/var/nix/profiles/system")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            system_profile: default_system_profile(),
        }
    }
}

impl PathsConfig {
    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("audit")
    }

    pub fn generations_file(&self) -> PathBuf {
        self.state_dir.join("generations.jsonl")
    }
}

// =============================================================================
// Engine Config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    /// Restore the snapshot when a mutating execution fails
    #[serde(default = "default_true")]
    pub auto_rollback_on_failure: bool,
}

impl EngineConfig {
    /// Load config from the standard locations, falling back to defaults.
    /// An invalid file is reported and replaced by defaults only when it
    /// cannot be parsed at all; semantic checks happen in `validate`.
    pub fn load() -> Self {
        for path in [CONFIG_PATH, DEFAULT_CONFIG_PATH] {
            if Path::new(path).exists() {
                match Self::load_from_path(Path::new(path)) {
                    Ok(config) => {
                        info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => warn!("Ignoring config {}: {}", path, e),
                }
            }
        }

        info!("Using default config");
        Self::default()
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    /// Reject policy data that would make the engine permissive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validation.allowed_executables.is_empty() {
            return Err(ConfigError::Invalid(
                "executable allow-list is empty".to_string(),
            ));
        }

        if self.validation.destructive_patterns.is_empty() {
            return Err(ConfigError::Invalid(
                "destructive pattern list is empty".to_string(),
            ));
        }

        for spec in &self.validation.destructive_patterns {
            Regex::new(&spec.pattern).map_err(|e| {
                ConfigError::Invalid(format!("destructive pattern '{}': {}", spec.name, e))
            })?;
        }

        if self.validation.max_plan_steps == 0 {
            return Err(ConfigError::Invalid("max_plan_steps must be > 0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.policy.min_free_ratio) {
            return Err(ConfigError::Invalid(format!(
                "min_free_ratio {} is outside 0..=1",
                self.policy.min_free_ratio
            )));
        }

        let timeouts = &self.execution.timeouts;
        if [
            timeouts.read_only_secs,
            timeouts.install_secs,
            timeouts.remove_secs,
            timeouts.modify_configuration_secs,
        ]
        .contains(&0)
        {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }

        if self.execution.cpu_percent == 0 || self.execution.cpu_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "cpu_percent {} is outside 1..=100",
                self.execution.cpu_percent
            )));
        }

        Ok(())
    }

    /// Config rooted in a scratch directory, used by tests and dry tooling
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.paths.state_dir = dir.into();
        self
    }

    pub fn with_system_profile(mut self, profile: impl Into<PathBuf>) -> Self {
        self.paths.system_profile = profile.into();
        self
    }
}
