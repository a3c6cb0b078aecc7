//! Sandbox
//!
//! Turns validated argv into a fully resolved Command and then into a child
//! process description:
//! - minimal environment (PATH and HOME only)
//! - own process group so timeouts can kill the whole tree
//! - RLIMIT_AS / RLIMIT_CPU ceilings
//! - optional bubblewrap view: root read-only, blocked paths masked with
//!   tmpfs, selected paths re-exposed, network unshared unless needed

use crate::config::{EngineConfig, IsolationMode};
use crate::error::ExecutionError;
use crate::types::{AccessClass, Command, OperationKind, ResourceLimits, SandboxSpec};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, warn};

pub const BWRAP: &str = "bwrap";

/// Assemble the Command for one plan step
pub fn build_command(
    argv: &[String],
    kind: OperationKind,
    class: AccessClass,
    action: &str,
    config: &EngineConfig,
) -> Command {
    let (executable, args) = match argv.split_first() {
        Some((exe, rest)) => (exe.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    };

    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), config.execution.child_path.clone());
    env.insert("HOME".to_string(), config.execution.child_home.clone());

    Command {
        executable,
        args,
        env,
        timeout_seconds: config.execution.timeouts.for_class(class),
        resource_limits: ResourceLimits {
            memory_bytes: config.execution.memory_bytes,
            cpu_percent: config.execution.cpu_percent,
            io_bandwidth: config.execution.io_bandwidth,
        },
        sandbox: sandbox_spec(kind, config),
        action: action.to_string(),
    }
}

/// Filesystem and network view for an operation kind. The engine state
/// directory is always hidden so a child cannot touch its own audit trail.
pub fn sandbox_spec(kind: OperationKind, config: &EngineConfig) -> SandboxSpec {
    let sandbox = &config.sandbox;

    let mut blocked: BTreeSet<PathBuf> = sandbox.blocked_paths.iter().cloned().collect();
    blocked.insert(config.paths.state_dir.clone());

    let mut read_only: BTreeSet<PathBuf> = sandbox.read_only_paths.iter().cloned().collect();
    if let Some(allow) = &sandbox.allow_path {
        read_only.insert(allow.clone());
    }

    SandboxSpec {
        network_enabled: sandbox.network_operations.contains(&kind),
        read_only_paths: read_only,
        blocked_paths: blocked,
        writable_paths: sandbox.writable_paths.iter().cloned().collect(),
    }
}

/// bubblewrap arguments reproducing a SandboxSpec
pub fn bwrap_args(spec: &SandboxSpec) -> Vec<String> {
    let mut args: Vec<String> = ["--die-with-parent", "--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    for path in &spec.blocked_paths {
        args.push("--tmpfs".to_string());
        args.push(path.to_string_lossy().into_owned());
    }
    for path in &spec.read_only_paths {
        let p = path.to_string_lossy().into_owned();
        args.extend(["--ro-bind-try".to_string(), p.clone(), p]);
    }
    for path in &spec.writable_paths {
        let p = path.to_string_lossy().into_owned();
        args.extend(["--bind-try".to_string(), p.clone(), p]);
    }
    if !spec.network_enabled {
        args.push("--unshare-net".to_string());
    }
    args.extend(["--unshare-ipc".to_string(), "--chdir".to_string(), "/".to_string()]);
    args
}

/// Locate an executable on a colon-separated search path
pub fn find_in_path(name: &str, search_path: &str) -> Option<PathBuf> {
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| candidate.is_file())
}

/// CPU seconds allowed for a command: its share of the wall-clock budget
pub fn cpu_seconds(limits: &ResourceLimits, timeout_seconds: u32) -> u64 {
    let budget = timeout_seconds as u64 * limits.cpu_percent.min(100) as u64 / 100;
    budget.max(1)
}

// =============================================================================
// Launcher
// =============================================================================

#[derive(Debug, Clone)]
pub struct SandboxLauncher {
    mode: IsolationMode,
    bwrap: Option<PathBuf>,
}

impl SandboxLauncher {
    pub fn new(mode: IsolationMode, bwrap: Option<PathBuf>) -> Self {
        Self { mode, bwrap }
    }

    /// Look for bubblewrap on the child search path
    pub fn detect(mode: IsolationMode, search_path: &str) -> Self {
        let bwrap = match mode {
            IsolationMode::None => None,
            _ => find_in_path(BWRAP, search_path),
        };
        if mode == IsolationMode::Auto && bwrap.is_none() {
            warn!("bubblewrap not found; commands run with resource limits only");
        }
        Self::new(mode, bwrap)
    }

    pub fn is_isolated(&self) -> bool {
        self.mode != IsolationMode::None && self.bwrap.is_some()
    }

    /// Child process description for a Command; stdout/stderr are piped
    pub fn prepare(&self, command: &Command) -> Result<tokio::process::Command, ExecutionError> {
        if command.executable.is_empty() {
            return Err(ExecutionError::SpawnFailure("empty executable".to_string()));
        }

        let mut child = match (self.mode, &self.bwrap) {
            (IsolationMode::None, _) | (IsolationMode::Auto, None) => {
                let mut c = tokio::process::Command::new(&command.executable);
                c.args(&command.args);
                c
            }
            (_, Some(bwrap)) => {
                let mut c = tokio::process::Command::new(bwrap);
                c.args(bwrap_args(&command.sandbox));
                c.arg("--");
                c.arg(&command.executable);
                c.args(&command.args);
                c
            }
            (IsolationMode::Bubblewrap, None) => {
                return Err(ExecutionError::SandboxUnavailable(
                    "bubblewrap is required but was not found".to_string(),
                ));
            }
        };

        child
            .env_clear()
            .envs(&command.env)
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let memory = command.resource_limits.memory_bytes;
        let cpu = cpu_seconds(&command.resource_limits, command.timeout_seconds);
        // SAFETY: the closure only issues setpgid(2) and setrlimit(2), both
        // async-signal-safe
        unsafe {
            child.pre_exec(move || {
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::from)?;
                apply_rlimits(memory, cpu)
            });
        }

        debug!(
            executable = %command.executable,
            isolated = self.is_isolated(),
            network = command.sandbox.network_enabled,
            "prepared child process"
        );

        Ok(child)
    }
}

fn apply_rlimits(memory_bytes: u64, cpu_seconds: u64) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    if memory_bytes > 0 {
        setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes).map_err(std::io::Error::from)?;
    }
    // soft limit sends SIGXCPU, hard limit one second later SIGKILL
    setrlimit(Resource::RLIMIT_CPU, cpu_seconds, cpu_seconds + 1).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_command_minimal_env() {
        let config = EngineConfig::default();
        let command = build_command(
            &argv(&["nix", "profile", "install", "nixpkgs#firefox"]),
            OperationKind::InstallPackage,
            AccessClass::InstallPackage,
            "install firefox",
            &config,
        );

        assert_eq!(command.executable, "nix");
        assert_eq!(command.args.len(), 3);
        assert_eq!(command.env.keys().collect::<Vec<_>>(), vec!["HOME", "PATH"]);
        assert_eq!(command.timeout_seconds, 1_800);
        assert!(command.sandbox.network_enabled);
        assert!(command.sandbox.blocked_paths.contains(Path::new("/var/lib/nixsafe")));
    }

    #[test]
    fn test_network_off_for_local_operations() {
        let config = EngineConfig::default();
        let spec = sandbox_spec(OperationKind::RemovePackage, &config);
        assert!(!spec.network_enabled);
        assert!(bwrap_args(&spec).contains(&"--unshare-net".to_string()));

        let spec = sandbox_spec(OperationKind::SearchPackage, &config);
        assert!(!bwrap_args(&spec).contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn test_bwrap_masks_then_reexposes() {
        let config = EngineConfig::default();
        let args = bwrap_args(&sandbox_spec(OperationKind::InstallPackage, &config));
        let joined = args.join(" ");

        assert!(joined.starts_with("--die-with-parent --ro-bind / /"));
        let etc_mask = joined.find("--tmpfs /etc").unwrap();
        let etc_nix = joined.find("--ro-bind-try /etc/nix /etc/nix").unwrap();
        assert!(etc_mask < etc_nix);
        assert!(joined.contains("--tmpfs /home"));
        assert!(joined.contains("--tmpfs /root"));
        assert!(joined.contains("--bind-try /nix /nix"));
    }

    #[test]
    fn test_cpu_seconds() {
        let limits = ResourceLimits {
            memory_bytes: 0,
            cpu_percent: 50,
            io_bandwidth: 0,
        };
        assert_eq!(cpu_seconds(&limits, 60), 30);
        assert_eq!(cpu_seconds(&limits, 1), 1);
    }

    #[test]
    fn test_find_in_path() {
        assert!(find_in_path("sh", "/nonexistent:/bin:/usr/bin").is_some());
        assert!(find_in_path("definitely-not-here", "/bin").is_none());
    }

    #[test]
    fn test_required_bubblewrap_missing() {
        let launcher = SandboxLauncher::new(IsolationMode::Bubblewrap, None);
        let command = build_command(
            &argv(&["nix", "profile", "list"]),
            OperationKind::ListInstalled,
            AccessClass::ReadOnly,
            "list installed packages",
            &EngineConfig::default(),
        );
        assert!(matches!(
            launcher.prepare(&command),
            Err(ExecutionError::SandboxUnavailable(_))
        ));
    }

    #[test]
    fn test_unsandboxed_program_is_executable() {
        let launcher = SandboxLauncher::new(IsolationMode::None, None);
        let command = build_command(
            &argv(&["nix", "profile", "list"]),
            OperationKind::ListInstalled,
            AccessClass::ReadOnly,
            "list installed packages",
            &EngineConfig::default(),
        );
        let prepared = launcher.prepare(&command).unwrap();
        assert_eq!(prepared.as_std().get_program(), "nix");
        assert!(!launcher.is_isolated());
    }
}
