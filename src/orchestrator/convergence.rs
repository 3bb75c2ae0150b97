//! Convergence loop policy: tier selection, cycle scoring and the exit rule.

use chrono::Utc;

use crate::checkpoint::{ConvergenceState, ConvergenceTier, CycleRecord, Verdict};
use crate::config::ScoreWeights;
use crate::driver::CycleReport;
use crate::tracker::ChangeProfile;

/// Pick a tier from the size and risk of the change.
///
/// | Tier      | When                                                           |
/// |-----------|----------------------------------------------------------------|
/// | thorough  | > 20 files, > 1000 lines, 2+ risk categories, or risky > 200 lines |
/// | light     | <= 3 files, <= 100 lines, no risk                              |
/// | standard  | everything else                                                |
pub fn select_tier(profile: &ChangeProfile) -> ConvergenceTier {
    let files = profile.files_changed;
    let lines = profile.lines_changed();
    let risks = profile.risk_signals.len();

    if files > 20 || lines > 1000 || risks >= 2 || (risks == 1 && lines > 200) {
        ConvergenceTier::Thorough
    } else if files <= 3 && lines <= 100 && risks == 0 {
        ConvergenceTier::Light
    } else {
        ConvergenceTier::Standard
    }
}

/// Relative drop from `baseline` to `current`, in 0.0..=1.0.
fn reduction(baseline: f64, current: f64) -> f64 {
    if baseline <= 0.0 {
        return if current <= 0.0 { 1.0 } else { 0.0 };
    }
    ((baseline - current) / baseline).clamp(0.0, 1.0)
}

/// Weighted score of `report` against the loop's first cycle. The first
/// cycle is its own baseline, so its reduction terms are zero.
pub fn score(history: &[CycleRecord], report: &CycleReport, weights: &ScoreWeights) -> f64 {
    let (issue_reduction, severity_improvement) = match history.first() {
        None => (0.0, 0.0),
        Some(base) => (
            reduction(base.issues_total as f64, report.issues_total as f64),
            reduction(base.severity_index, report.severity_index),
        ),
    };
    let coverage = report.scope_coverage.clamp(0.0, 1.0);
    let fix_success = if report.fixes_attempted == 0 {
        if report.issues_total == 0 { 1.0 } else { 0.0 }
    } else {
        (report.fixes_succeeded as f64 / report.fixes_attempted as f64).clamp(0.0, 1.0)
    };

    let total = weights.issue_reduction + weights.severity + weights.coverage + weights.fix_success;
    if total <= 0.0 {
        return 0.0;
    }
    (weights.issue_reduction * issue_reduction
        + weights.severity * severity_improvement
        + weights.coverage * coverage
        + weights.fix_success * fix_success)
        / total
}

/// Build the record for cycle `cycle`.
pub fn record_cycle(
    state: &ConvergenceState,
    cycle: u32,
    report: &CycleReport,
    weights: &ScoreWeights,
) -> CycleRecord {
    CycleRecord {
        cycle,
        score: score(&state.cycle_history, report, weights),
        issues_total: report.issues_total,
        critical: report.critical,
        severity_index: report.severity_index,
        scope_coverage: report.scope_coverage,
        fixes_attempted: report.fixes_attempted,
        fixes_succeeded: report.fixes_succeeded,
        verdict: report.verdict,
        recorded_at: Utc::now(),
    }
}

/// What to do after a recorded cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleDecision {
    Continue,
    Converged,
    /// Out of cycles; the phase completes with this flag.
    ProceedFlagged(String),
    /// Content failure; the pipeline stops.
    Halt(String),
}

/// Exit rule, applied to the most recent record:
///
/// 1. a `Block` verdict halts;
/// 2. below `min_cycles` the loop always continues;
/// 3. score at or above `threshold`, or no issues at all, converges;
/// 4. at `max_cycles` the phase proceeds flagged, or halts if fail-closed.
pub fn decide(
    state: &ConvergenceState,
    last: &CycleRecord,
    threshold: f64,
    fail_closed: bool,
) -> CycleDecision {
    if last.verdict == Verdict::Block {
        return CycleDecision::Halt(format!("cycle {} returned a blocking verdict", last.cycle));
    }
    if last.cycle < state.min_cycles {
        return CycleDecision::Continue;
    }
    if last.score >= threshold || (last.critical == 0 && last.issues_total == 0) {
        return CycleDecision::Converged;
    }
    if last.cycle >= state.max_cycles {
        let reason = format!(
            "not converged after {} cycles (score {:.2} < {:.2}, {} issues, {} critical)",
            last.cycle, last.score, threshold, last.issues_total, last.critical
        );
        return if fail_closed {
            CycleDecision::Halt(reason)
        } else {
            CycleDecision::ProceedFlagged(reason)
        };
    }
    CycleDecision::Continue
}
