//! Built-in pipelines.
//!
//! Pipelines are fixed, short, ordered phase lists. A phase's kind decides
//! which handler runs it.

use std::fmt;

/// How a phase is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Runs inside the orchestrator through [`crate::driver::PhaseDriver::run_local`].
    OrchestratorOnly,
    /// Plans tasks into a pool and hands them to a team of workers.
    Delegated,
    /// Repeats review/fix cycles until the findings converge.
    ConvergenceLoop,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrchestratorOnly => "local",
            Self::Delegated => "delegated",
            Self::ConvergenceLoop => "convergence",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub name: String,
    pub kind: PhaseKind,
    /// Halt instead of proceeding flagged when the phase runs out of budget
    /// or cycles. Config overrides may change it.
    pub fail_closed: bool,
}

impl PhaseSpec {
    pub fn new(name: &str, kind: PhaseKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            fail_closed: false,
        }
    }

    pub fn fail_closed(mut self) -> Self {
        self.fail_closed = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub name: String,
    pub phases: Vec<PhaseSpec>,
}

/// Names accepted by [`PipelineSpec::builtin`].
pub const BUILTIN_PIPELINES: &[&str] = &["build", "review", "fix"];

impl PipelineSpec {
    pub fn new(name: &str, phases: Vec<PhaseSpec>) -> Self {
        Self {
            name: name.to_string(),
            phases,
        }
    }

    /// Look up a built-in pipeline by name.
    pub fn builtin(name: &str) -> Option<Self> {
        use PhaseKind::*;
        let phases = match name {
            "build" => vec![
                PhaseSpec::new("plan", OrchestratorOnly),
                PhaseSpec::new("implement", Delegated),
                PhaseSpec::new("review", ConvergenceLoop),
                PhaseSpec::new("gate", OrchestratorOnly).fail_closed(),
            ],
            "review" => vec![
                PhaseSpec::new("review", ConvergenceLoop),
                PhaseSpec::new("gate", OrchestratorOnly).fail_closed(),
            ],
            "fix" => vec![
                PhaseSpec::new("triage", OrchestratorOnly),
                PhaseSpec::new("fix", Delegated),
                PhaseSpec::new("verify", OrchestratorOnly).fail_closed(),
            ],
            _ => return None,
        };
        Some(Self::new(name, phases))
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_resolves() {
        for name in BUILTIN_PIPELINES {
            let spec = PipelineSpec::builtin(name).unwrap();
            assert_eq!(spec.name, *name);
            assert!(!spec.phases.is_empty());
        }
        assert!(PipelineSpec::builtin("deploy").is_none());
    }

    #[test]
    fn test_build_pipeline_shape() {
        let spec = PipelineSpec::builtin("build").unwrap();
        assert_eq!(spec.phase_names(), vec!["plan", "implement", "review", "gate"]);
        assert_eq!(spec.phases[2].kind, PhaseKind::ConvergenceLoop);
        assert!(spec.phases[3].fail_closed);
        assert!(!spec.phases[1].fail_closed);
    }
}
