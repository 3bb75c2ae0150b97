//! Session identity and liveness.
//!
//! Every shared artifact (checkpoint, team marker) carries a [`SessionState`]
//! recording which orchestrator instance wrote it. Cleanup and stale-detection
//! routines consult [`SessionContext::is_owned_by_live_session`] before acting,
//! so two instances sharing a project never tear down each other's resources.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Ownership record embedded in shared state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Canonical path of the `.convoy` directory the owner was using.
    pub config_root: PathBuf,
    pub owner_pid: u32,
    pub session_id: String,
    /// Executable name of the owner, used to detect pid reuse.
    #[serde(default)]
    pub process_name: Option<String>,
}

impl SessionState {
    /// Whether two records describe the same orchestrator instance.
    pub fn same_session(&self, other: &SessionState) -> bool {
        self.session_id == other.session_id
            && self.owner_pid == other.owner_pid
            && self.config_root == other.config_root
    }
}

/// Probe for process existence, abstracted so ownership filtering can be
/// tested without real processes.
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this pid exists.
    fn is_alive(&self, pid: u32) -> bool;

    /// Short name of the process at `pid`, if the platform exposes it.
    fn process_name(&self, pid: u32) -> Option<String>;
}

/// Probe backed by `kill(pid, 0)` and `/proc/<pid>/comm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        // SAFETY: signal 0 performs error checking only; no signal is delivered.
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/comm", pid))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Probe with a fixed table of live pids, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    live: HashMap<u32, Option<String>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `pid` as alive with an optional process name.
    pub fn with_live(mut self, pid: u32, name: Option<&str>) -> Self {
        self.live.insert(pid, name.map(str::to_string));
        self
    }
}

impl ProcessProbe for StaticProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.live.contains_key(&pid)
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        self.live.get(&pid).cloned().flatten()
    }
}

/// This instance's identity plus the probe used to judge everyone else's.
pub struct SessionContext {
    identity: SessionState,
    probe: Box<dyn ProcessProbe>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    /// Identity of the running process for the given `.convoy` directory.
    pub fn current(convoy_dir: &Path) -> Self {
        let config_root = convoy_dir
            .canonicalize()
            .unwrap_or_else(|_| convoy_dir.to_path_buf());
        let process_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .map(|n| truncate_comm(&n));
        Self {
            identity: SessionState {
                config_root,
                owner_pid: std::process::id(),
                session_id: Uuid::new_v4().to_string(),
                process_name,
            },
            probe: Box::new(SystemProbe),
        }
    }

    /// Build a context from an explicit identity and probe.
    pub fn with_probe(identity: SessionState, probe: Box<dyn ProcessProbe>) -> Self {
        Self { identity, probe }
    }

    /// The (config-root, owner-pid) record stamped on everything we create.
    pub fn current_identity(&self) -> &SessionState {
        &self.identity
    }

    /// Whether `record` was written by this very instance.
    pub fn is_self(&self, record: &SessionState) -> bool {
        self.identity.same_session(record)
    }

    /// Whether the owner recorded in `record` is still running.
    ///
    /// A pid that exists but now belongs to a differently named process is
    /// treated as dead (pid reuse).
    pub fn is_owned_by_live_session(&self, record: &SessionState) -> bool {
        if self.is_self(record) {
            return true;
        }
        if !self.probe.is_alive(record.owner_pid) {
            return false;
        }
        match (&record.process_name, self.probe.process_name(record.owner_pid)) {
            (Some(expected), Some(actual)) => truncate_comm(expected) == actual,
            _ => true,
        }
    }

    /// Whether `record` belongs to another instance that is still alive,
    /// i.e. state we must not touch.
    pub fn is_foreign_live(&self, record: &SessionState) -> bool {
        !self.is_self(record) && self.is_owned_by_live_session(record)
    }
}

/// Linux truncates `comm` to 15 bytes.
fn truncate_comm(name: &str) -> String {
    name.chars().take(15).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32, name: Option<&str>) -> SessionState {
        SessionState {
            config_root: PathBuf::from("/p/.convoy"),
            owner_pid: pid,
            session_id: format!("session-{}", pid),
            process_name: name.map(str::to_string),
        }
    }

    fn ctx(probe: StaticProbe) -> SessionContext {
        SessionContext::with_probe(record(100, Some("convoy")), Box::new(probe))
    }

    #[test]
    fn test_self_is_always_live() {
        let ctx = ctx(StaticProbe::new());
        assert!(ctx.is_owned_by_live_session(&record(100, Some("convoy"))));
        assert!(!ctx.is_foreign_live(&record(100, Some("convoy"))));
    }

    #[test]
    fn test_dead_pid_is_not_live() {
        let ctx = ctx(StaticProbe::new());
        assert!(!ctx.is_owned_by_live_session(&record(200, Some("convoy"))));
    }

    #[test]
    fn test_live_pid_with_matching_name_is_live() {
        let ctx = ctx(StaticProbe::new().with_live(200, Some("convoy")));
        assert!(ctx.is_owned_by_live_session(&record(200, Some("convoy"))));
        assert!(ctx.is_foreign_live(&record(200, Some("convoy"))));
    }

    #[test]
    fn test_reused_pid_is_treated_as_dead() {
        let ctx = ctx(StaticProbe::new().with_live(200, Some("bash")));
        assert!(!ctx.is_owned_by_live_session(&record(200, Some("convoy"))));
    }

    #[test]
    fn test_unnamed_record_falls_back_to_existence() {
        let ctx = ctx(StaticProbe::new().with_live(200, Some("bash")));
        assert!(ctx.is_owned_by_live_session(&record(200, None)));
    }

    #[test]
    fn test_long_process_names_compare_truncated() {
        let ctx = ctx(StaticProbe::new().with_live(200, Some("convoy-orchestr")));
        assert!(ctx.is_owned_by_live_session(&record(200, Some("convoy-orchestrator"))));
    }

    #[test]
    fn test_system_probe_sees_current_process() {
        let probe = SystemProbe;
        assert!(probe.is_alive(std::process::id()));
        assert!(!probe.is_alive(0));
    }

    #[test]
    fn test_current_identity_uses_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SessionContext::current(dir.path());
        assert_eq!(ctx.current_identity().owner_pid, std::process::id());
        assert!(ctx.is_owned_by_live_session(&ctx.current_identity().clone()));
    }
}
