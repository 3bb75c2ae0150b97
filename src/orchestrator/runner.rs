//! Phase sequencing, budgets and resume.

use chrono::Utc;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::artifacts;
use super::budget::{Budget, PhaseAllowance};
use super::cancel::CancelFlag;
use super::convergence::{CycleDecision, decide, record_cycle, select_tier};
use super::pipeline::{PhaseKind, PipelineSpec};
use super::result::{FlaggedPhase, HaltReason, RunOutcome, RunResult};
use super::retry::{PhaseDecision, with_backoff};
use crate::checkpoint::{
    Checkpoint, CheckpointStore, ConvergenceState, HaltRecord, LoadOutcome, PhaseStatus,
};
use crate::config::{ConvoyPaths, PhaseSettings, ResolvedConfig};
use crate::driver::{PhaseContext, PhaseDriver};
use crate::errors::OrchestratorError;
use crate::pool::TaskPool;
use crate::session::SessionContext;
use crate::signals::{SignalBus, WaitSettings};
use crate::team::{Team, TeamGuard, team_name_for, validate_team_name};
use crate::tracker::ChangeProfile;

/// How often a running driver call checks the cancel flag.
const CANCEL_POLL: Duration = Duration::from_secs(1);

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pipeline: PipelineSpec,
    pub resume: bool,
    /// Resume this run, or give a fresh run this id.
    pub run_id: Option<String>,
}

impl RunRequest {
    pub fn fresh(pipeline: PipelineSpec) -> Self {
        Self {
            pipeline,
            resume: false,
            run_id: None,
        }
    }

    pub fn resume(pipeline: PipelineSpec, run_id: Option<String>) -> Self {
        Self {
            pipeline,
            resume: true,
            run_id,
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// A live orchestrator owns the run and will stop at its next check.
    Requested { run_id: String },
    /// Nobody was running it; the run was archived as cancelled.
    Archived { run_id: String, path: PathBuf },
}

/// Per-run state threaded through the phase handlers.
struct RunContext<'a> {
    pipeline: &'a PipelineSpec,
    checkpoint: Checkpoint,
    budget: Budget,
    cancel: CancelFlag,
    executed: Vec<String>,
    skipped: Vec<String>,
    flagged: Vec<FlaggedPhase>,
}

enum PhaseOutcome {
    Completed { partial: Option<String> },
    Halted(HaltReason),
    Cancelled,
}

pub struct Orchestrator {
    paths: ConvoyPaths,
    config: ResolvedConfig,
    session: SessionContext,
    driver: Arc<dyn PhaseDriver>,
    store: CheckpointStore,
}

impl Orchestrator {
    pub fn new(
        paths: ConvoyPaths,
        config: ResolvedConfig,
        session: SessionContext,
        driver: Arc<dyn PhaseDriver>,
    ) -> Self {
        let store = CheckpointStore::new(paths.clone());
        Self {
            paths,
            config,
            session,
            driver,
            store,
        }
    }

    pub fn paths(&self) -> &ConvoyPaths {
        &self.paths
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    fn save(&self, checkpoint: &mut Checkpoint) -> Result<PathBuf, OrchestratorError> {
        Ok(self.store.save(checkpoint)?)
    }

    /// Run a pipeline from scratch or resume an earlier run of it.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult, OrchestratorError> {
        let pipeline = &request.pipeline;
        let checkpoint = if request.resume {
            self.load_for_resume(pipeline, request.run_id.as_deref())?
        } else {
            self.create_fresh(pipeline, request.run_id)?
        };

        let reaped = TeamGuard::new(self.paths.clone(), &self.session, Vec::new())
            .reap_stale(self.config.tuning.team_stale_after);
        if !reaped.is_empty() {
            info!(teams = ?reaped, "Reclaimed stale teams before starting");
        }

        let cancel = CancelFlag::new(&self.paths.cancel_file(&pipeline.name, &checkpoint.run_id));
        let mut run = RunContext {
            pipeline,
            checkpoint,
            budget: Budget::start(self.config.tuning.total_timeout),
            cancel,
            executed: Vec::new(),
            skipped: Vec::new(),
            flagged: Vec::new(),
        };
        info!(
            run_id = %run.checkpoint.run_id,
            pipeline = %pipeline.name,
            resume = request.resume,
            "Starting run"
        );

        for idx in 0..pipeline.phases.len() {
            let spec = &pipeline.phases[idx];
            run.checkpoint.current_phase = idx;
            let interrupted = run.checkpoint.phases[idx].status == PhaseStatus::Running;

            match run.checkpoint.phases[idx].status {
                PhaseStatus::Completed => {
                    let recorded = &run.checkpoint.phases[idx].artifact_hashes;
                    match artifacts::first_mismatch(&self.paths.project_dir, recorded) {
                        None => {
                            debug!(phase = %spec.name, "Already completed");
                            run.skipped.push(spec.name.clone());
                            continue;
                        }
                        Some(reason) => {
                            warn!(phase = %spec.name, %reason, "Completed phase failed verification; rerunning");
                            run.checkpoint.phases[idx].downgrade(&reason);
                            self.save(&mut run.checkpoint)?;
                        }
                    }
                }
                PhaseStatus::Skipped => {
                    run.skipped.push(spec.name.clone());
                    continue;
                }
                PhaseStatus::Running => {
                    info!(phase = %spec.name, "Phase was interrupted; running it again");
                }
                PhaseStatus::Pending | PhaseStatus::Failed => {}
            }

            if run.cancel.is_set() {
                return self.finish_cancelled(run, Some(spec.name.clone()));
            }
            if run.budget.expired() {
                return self.finish_halted(run, idx, HaltReason::TotalTimeout);
            }

            run.checkpoint.phases[idx].mark_running();
            self.save(&mut run.checkpoint)?;

            let settings = self.config.phase_settings(&spec.name, spec.fail_closed);
            let allowance = run.budget.allowance(settings.timeout);
            let ctx = PhaseContext {
                run_id: run.checkpoint.run_id.clone(),
                pipeline: pipeline.name.clone(),
                phase: spec.name.clone(),
                project_dir: self.paths.project_dir.clone(),
                convoy_dir: self.paths.convoy_dir.clone(),
                settings,
            };
            info!(
                phase = %spec.name,
                kind = %spec.kind,
                timeout_secs = ctx.settings.timeout.as_secs(),
                "Starting phase"
            );

            let outcome = match spec.kind {
                PhaseKind::OrchestratorOnly => self.run_local_phase(&run, &ctx, &allowance).await,
                PhaseKind::Delegated => {
                    self.run_delegated_phase(&mut run, idx, &ctx, &allowance)
                        .await?
                }
                PhaseKind::ConvergenceLoop => {
                    self.run_convergence_phase(&mut run, &ctx, &allowance, interrupted)
                        .await?
                }
            };
            run.executed.push(spec.name.clone());

            match outcome {
                PhaseOutcome::Completed { partial } => {
                    let hashes =
                        artifacts::hash_artifacts(&self.paths.project_dir, &ctx.settings.commands.artifacts);
                    let entry = &mut run.checkpoint.phases[idx];
                    entry.mark_completed(hashes);
                    entry.partial_reason = partial.clone();
                    match partial {
                        Some(reason) => {
                            warn!(phase = %spec.name, %reason, "Phase completed with partial results");
                            run.flagged.push(FlaggedPhase {
                                phase: spec.name.clone(),
                                reason,
                            });
                        }
                        None => info!(phase = %spec.name, "Phase completed"),
                    }
                    self.save(&mut run.checkpoint)?;
                }
                PhaseOutcome::Halted(reason) => return self.finish_halted(run, idx, reason),
                PhaseOutcome::Cancelled => {
                    return self.finish_cancelled(run, Some(spec.name.clone()));
                }
            }
        }

        run.checkpoint.current_phase = pipeline.phases.len();
        self.save(&mut run.checkpoint)?;
        let archived = self.store.archive(&run.checkpoint)?;
        info!(run_id = %run.checkpoint.run_id, "Run completed");
        Ok(RunResult {
            run_id: run.checkpoint.run_id.clone(),
            pipeline: pipeline.name.clone(),
            outcome: RunOutcome::Completed,
            phases_executed: run.executed,
            phases_skipped: run.skipped,
            flagged: run.flagged,
            checkpoint_path: archived.join("checkpoint.json"),
        })
    }

    /// Run each pipeline in turn as a fresh run. Stops after a run that does
    /// not complete, or before the next run once `batch.cancel` appears.
    pub async fn run_batch(
        &self,
        pipelines: &[PipelineSpec],
    ) -> Result<Vec<RunResult>, OrchestratorError> {
        let flag = CancelFlag::new(&self.paths.batch_cancel_file());
        if flag.is_set() {
            info!("Clearing batch cancellation left by an earlier batch");
            flag.clear()?;
        }

        let mut results = Vec::new();
        for pipeline in pipelines {
            if flag.is_set() {
                info!(next = %pipeline.name, "Batch cancelled");
                flag.clear()?;
                break;
            }
            let result = self.run(RunRequest::fresh(pipeline.clone())).await?;
            let success = result.is_success();
            results.push(result);
            if !success {
                break;
            }
        }
        Ok(results)
    }

    fn create_fresh(
        &self,
        pipeline: &PipelineSpec,
        run_id: Option<String>,
    ) -> Result<Checkpoint, OrchestratorError> {
        let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_team_name(&run_id).map_err(|e| anyhow::anyhow!("Invalid run id: {}", e))?;
        if !matches!(self.store.load_run(&pipeline.name, &run_id), LoadOutcome::Missing) {
            return Err(OrchestratorError::RunExists { run_id });
        }
        let mut checkpoint = Checkpoint::new(
            &run_id,
            &pipeline.name,
            &pipeline.phase_names(),
            self.session.current_identity().clone(),
            self.config.tuning.total_timeout.as_secs(),
        );
        self.save(&mut checkpoint)?;
        Ok(checkpoint)
    }

    fn load_for_resume(
        &self,
        pipeline: &PipelineSpec,
        run_id: Option<&str>,
    ) -> Result<Checkpoint, OrchestratorError> {
        let mut checkpoint = match run_id {
            Some(id) => {
                validate_team_name(id).map_err(|e| anyhow::anyhow!("Invalid run id: {}", e))?;
                match self.store.load_run(&pipeline.name, id) {
                    LoadOutcome::Loaded(cp) => *cp,
                    LoadOutcome::Missing => {
                        return Err(OrchestratorError::NothingToResume {
                            pipeline: pipeline.name.clone(),
                        });
                    }
                    LoadOutcome::Unreadable { reason } => {
                        return Err(OrchestratorError::UnreadableCheckpoint {
                            path: self.store.path_for(&pipeline.name, id),
                            reason,
                        });
                    }
                }
            }
            None => self
                .store
                .discover_latest(&pipeline.name, |cp| !self.session.is_foreign_live(&cp.session))
                .ok_or_else(|| OrchestratorError::NothingToResume {
                    pipeline: pipeline.name.clone(),
                })?,
        };

        if self.session.is_foreign_live(&checkpoint.session) {
            return Err(OrchestratorError::OwnedByLiveSession {
                run_id: checkpoint.run_id.clone(),
                session_id: checkpoint.session.session_id.clone(),
                owner_pid: checkpoint.session.owner_pid,
            });
        }

        let inserted = checkpoint.reconcile_phase_order(&pipeline.phase_names())?;
        if !inserted.is_empty() {
            info!(phases = ?inserted, "Added phases introduced since the checkpoint was written");
        }
        checkpoint.session = self.session.current_identity().clone();
        checkpoint.halt = None;

        let cancel = CancelFlag::new(&self.paths.cancel_file(&pipeline.name, &checkpoint.run_id));
        if cancel.is_set() {
            info!("Clearing a cancellation request left without an owner");
            cancel.clear()?;
        }
        self.save(&mut checkpoint)?;
        Ok(checkpoint)
    }

    /// Budget ran out: halt or proceed flagged, depending on which budget and
    /// on the phase's fail-closed setting.
    fn budget_exhausted(
        allowance: &PhaseAllowance,
        settings: &PhaseSettings,
        detail: &str,
    ) -> PhaseOutcome {
        if allowance.limited_by_total {
            PhaseOutcome::Halted(HaltReason::TotalTimeout)
        } else if settings.fail_closed {
            PhaseOutcome::Halted(HaltReason::PhaseTimeout {
                allowed_secs: settings.timeout.as_secs(),
            })
        } else {
            PhaseOutcome::Completed {
                partial: Some(format!(
                    "phase budget of {}s exceeded: {}",
                    settings.timeout.as_secs(),
                    detail
                )),
            }
        }
    }

    async fn run_local_phase(
        &self,
        run: &RunContext<'_>,
        ctx: &PhaseContext,
        allowance: &PhaseAllowance,
    ) -> PhaseOutcome {
        let call = tokio::time::timeout(allowance.remaining(), self.driver.run_local(ctx));
        let result = tokio::select! {
            r = call => r,
            _ = watch_cancel(&run.cancel) => return PhaseOutcome::Cancelled,
        };
        match result {
            Err(_) => Self::budget_exhausted(allowance, &ctx.settings, "local command did not finish"),
            Ok(Err(e)) => PhaseOutcome::Halted(HaltReason::DriverError(format!("{:#}", e))),
            Ok(Ok(outcome)) if outcome.success => PhaseOutcome::Completed { partial: None },
            Ok(Ok(outcome)) => PhaseOutcome::Halted(HaltReason::ContentFailure(outcome.summary)),
        }
    }

    async fn run_delegated_phase(
        &self,
        run: &mut RunContext<'_>,
        idx: usize,
        ctx: &PhaseContext,
        allowance: &PhaseAllowance,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let team_name = team_name_for(&ctx.pipeline, &ctx.phase, &ctx.run_id);
        run.checkpoint.phases[idx].team_name = Some(team_name.clone());
        self.save(&mut run.checkpoint)?;

        let guard = TeamGuard::new(
            self.paths.clone(),
            &self.session,
            self.config.tuning.retry_backoff.clone(),
        );
        let mut team = match guard.create_team(&team_name).await {
            Ok(team) => team,
            Err(e) => {
                return Ok(PhaseOutcome::Halted(match PhaseDecision::from(&e) {
                    PhaseDecision::Retry => HaltReason::ResourceConflict(e.to_string()),
                    _ => HaltReason::DriverError(e.to_string()),
                }));
            }
        };

        let outcome = self.drive_team(run, ctx, allowance, &guard, &mut team).await;

        if let Err(e) = self.driver.request_shutdown(&team.name).await {
            warn!(team = %team.name, error = %e, "Shutdown request failed");
        }
        self.driver
            .drain_workers(&team.name, self.config.tuning.shutdown_grace)
            .await;
        if let Err(e) = guard.cleanup_team(&team.name).await {
            // Stale teams are reaped later; the phase result stands.
            warn!(team = %team.name, error = %e, decision = ?PhaseDecision::from(&e), "Team teardown incomplete");
        }
        Ok(outcome)
    }

    async fn drive_team(
        &self,
        run: &RunContext<'_>,
        ctx: &PhaseContext,
        allowance: &PhaseAllowance,
        guard: &TeamGuard<'_>,
        team: &mut Team,
    ) -> PhaseOutcome {
        let tuning = &self.config.tuning;
        let pool = TaskPool::new(&team.pool_dir).with_max_releases(tuning.max_task_releases);
        let bus = SignalBus::new(&team.signal_dir);

        let specs = match tokio::time::timeout(allowance.remaining(), self.driver.plan_tasks(ctx)).await {
            Err(_) => {
                return Self::budget_exhausted(allowance, &ctx.settings, "task planning did not finish");
            }
            Ok(Err(e)) => return PhaseOutcome::Halted(HaltReason::DriverError(format!("{:#}", e))),
            Ok(Ok(specs)) => specs,
        };

        let mut expected = BTreeSet::new();
        for spec in specs {
            let created = with_backoff(&tuning.retry_backoff, |_| {
                let spec = spec.clone();
                let pool = &pool;
                async move { pool.create_task(spec) }
            })
            .await;
            match created {
                Ok(id) => {
                    expected.insert(id);
                }
                Err(e) => {
                    return PhaseOutcome::Halted(match PhaseDecision::from(&e) {
                        PhaseDecision::Retry => HaltReason::ResourceConflict(e.to_string()),
                        _ => HaltReason::ContentFailure(format!("invalid task plan: {}", e)),
                    });
                }
            }
        }
        if expected.is_empty() {
            info!(phase = %ctx.phase, "No tasks planned");
            return PhaseOutcome::Completed { partial: None };
        }
        info!(phase = %ctx.phase, team = %team.name, tasks = expected.len(), "Tasks planned");

        if let Err(e) = bus.prepare(expected.len()) {
            warn!(error = %e, "Signal directory unavailable; completion will be polled from the pool");
        }

        match self.driver.launch_workers(ctx, team).await {
            Ok(members) => {
                for member in members {
                    if let Err(e) = guard.add_member(team, &member) {
                        warn!(team = %team.name, error = %e, "Failed to record team member");
                    }
                }
            }
            Err(e) => return PhaseOutcome::Halted(HaltReason::DriverError(format!("{:#}", e))),
        }

        let settings = WaitSettings {
            signal_poll: tuning.signal_poll,
            pool_poll: tuning.pool_poll,
            stale_after: tuning.task_stale_after,
            warn_after: tuning.task_warn_after,
        };
        let cancel = run.cancel.clone();
        let done = bus
            .wait_for_signals(&expected, allowance.remaining(), &pool, &settings, || cancel.is_set())
            .await;

        if done.fallback_engaged {
            info!(team = %team.name, "Completion was tracked through the task pool");
        }
        if !done.releases.is_empty() {
            info!(team = %team.name, released = done.releases.len(), "Stale claims were released during the phase");
        }
        if done.cancelled {
            return PhaseOutcome::Cancelled;
        }
        if !done.repeatedly_failing.is_empty() {
            return PhaseOutcome::Halted(HaltReason::RepeatedTaskFailure(done.repeatedly_failing));
        }
        if done.complete {
            return PhaseOutcome::Completed { partial: None };
        }
        let missing = done.missing();
        if done.timed_out {
            return Self::budget_exhausted(
                allowance,
                &ctx.settings,
                &format!("{} of {} tasks incomplete", missing.len(), expected.len()),
            );
        }
        PhaseOutcome::Halted(HaltReason::ContentFailure(format!(
            "workers reported completion but tasks {} are not completed",
            missing.join(", ")
        )))
    }

    async fn run_convergence_phase(
        &self,
        run: &mut RunContext<'_>,
        ctx: &PhaseContext,
        allowance: &PhaseAllowance,
        interrupted: bool,
    ) -> Result<PhaseOutcome, OrchestratorError> {
        let threshold = self.config.convergence_threshold;
        let weights = self.config.score_weights;
        let fail_closed = ctx.settings.fail_closed;

        // Saved cycles only carry over into the attempt they were recorded
        // in. A halted or re-verified phase starts a new loop.
        let mut state = match run.checkpoint.convergence.take() {
            Some(state) if interrupted && state.phase == ctx.phase => {
                info!(phase = %ctx.phase, cycles_done = state.cycle_history.len(), "Resuming convergence loop");
                state
            }
            _ => {
                let profile = match tokio::time::timeout(
                    allowance.remaining(),
                    self.driver.assess_change(ctx),
                )
                .await
                {
                    Err(_) => {
                        return Ok(Self::budget_exhausted(
                            allowance,
                            &ctx.settings,
                            "change assessment did not finish",
                        ));
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "Change assessment failed; assuming a small change");
                        ChangeProfile::default()
                    }
                    Ok(Ok(profile)) => profile,
                };
                let tier = select_tier(&profile);
                info!(
                    phase = %ctx.phase,
                    %tier,
                    files = profile.files_changed,
                    lines = profile.lines_changed(),
                    risks = ?profile.risk_signals,
                    "Selected convergence tier"
                );
                ConvergenceState::new(&ctx.phase, tier)
            }
        };
        run.checkpoint.convergence = Some(state.clone());
        self.save(&mut run.checkpoint)?;

        // A crash right after recording a deciding cycle must not run another.
        if let Some(last) = state.cycle_history.last()
            && let Some(outcome) = cycle_outcome(decide(&state, last, threshold, fail_closed))
        {
            return Ok(outcome);
        }

        loop {
            if run.cancel.is_set() {
                return Ok(PhaseOutcome::Cancelled);
            }
            if allowance.expired() {
                let detail = format!("{} cycles completed", state.cycle_history.len());
                return Ok(Self::budget_exhausted(allowance, &ctx.settings, &detail));
            }

            let cycle = state.next_cycle();
            let call = tokio::time::timeout(allowance.remaining(), self.driver.run_cycle(ctx, cycle));
            let result = tokio::select! {
                r = call => r,
                _ = watch_cancel(&run.cancel) => return Ok(PhaseOutcome::Cancelled),
            };
            let report = match result {
                Err(_) => {
                    let detail = format!("cycle {} did not finish", cycle);
                    return Ok(Self::budget_exhausted(allowance, &ctx.settings, &detail));
                }
                Ok(Err(e)) => {
                    return Ok(PhaseOutcome::Halted(HaltReason::DriverError(format!("{:#}", e))));
                }
                Ok(Ok(report)) => report,
            };

            let record = record_cycle(&state, cycle, &report, &weights);
            info!(
                phase = %ctx.phase,
                cycle,
                score = %format!("{:.2}", record.score),
                issues = record.issues_total,
                critical = record.critical,
                verdict = %record.verdict,
                "Cycle recorded"
            );
            state.cycle_history.push(record.clone());
            run.checkpoint.convergence = Some(state.clone());
            self.save(&mut run.checkpoint)?;

            if let Some(outcome) = cycle_outcome(decide(&state, &record, threshold, fail_closed)) {
                return Ok(outcome);
            }
        }
    }

    fn finish_halted(
        &self,
        mut run: RunContext<'_>,
        idx: usize,
        reason: HaltReason,
    ) -> Result<RunResult, OrchestratorError> {
        let phase = run.pipeline.phases[idx].name.clone();
        run.checkpoint.phases[idx].mark_failed(&reason.to_string());
        run.checkpoint.halt = Some(HaltRecord {
            phase: phase.clone(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        let path = self.save(&mut run.checkpoint)?;
        error!(phase = %phase, %reason, checkpoint = %path.display(), "Run halted");
        Ok(RunResult {
            run_id: run.checkpoint.run_id.clone(),
            pipeline: run.pipeline.name.clone(),
            outcome: RunOutcome::Halted {
                phase,
                reason,
                artifacts: vec![path.clone(), self.paths.log_dir()],
            },
            phases_executed: run.executed,
            phases_skipped: run.skipped,
            flagged: run.flagged,
            checkpoint_path: path,
        })
    }

    fn finish_cancelled(
        &self,
        mut run: RunContext<'_>,
        phase: Option<String>,
    ) -> Result<RunResult, OrchestratorError> {
        run.checkpoint.halt = Some(HaltRecord {
            phase: phase.clone().unwrap_or_default(),
            reason: "cancelled".to_string(),
            at: Utc::now(),
        });
        self.save(&mut run.checkpoint)?;
        run.cancel.clear()?;
        let archived = self.store.archive(&run.checkpoint)?;
        warn!(run_id = %run.checkpoint.run_id, phase = ?phase, "Run cancelled");
        Ok(RunResult {
            run_id: run.checkpoint.run_id.clone(),
            pipeline: run.pipeline.name.clone(),
            outcome: RunOutcome::Cancelled { phase },
            phases_executed: run.executed,
            phases_skipped: run.skipped,
            flagged: run.flagged,
            checkpoint_path: archived.join("checkpoint.json"),
        })
    }

    /// Cancel a run: signal its live owner, or archive it directly when no
    /// orchestrator is running it.
    pub fn request_cancel(
        &self,
        pipeline: &str,
        run_id: Option<&str>,
    ) -> Result<CancelOutcome, OrchestratorError> {
        let mut checkpoint = match run_id {
            Some(id) => {
                validate_team_name(id).map_err(|e| anyhow::anyhow!("Invalid run id: {}", e))?;
                match self.store.load_run(pipeline, id) {
                    LoadOutcome::Loaded(cp) => *cp,
                    LoadOutcome::Missing => {
                        return Err(OrchestratorError::NothingToResume {
                            pipeline: pipeline.to_string(),
                        });
                    }
                    LoadOutcome::Unreadable { reason } => {
                        return Err(OrchestratorError::UnreadableCheckpoint {
                            path: self.store.path_for(pipeline, id),
                            reason,
                        });
                    }
                }
            }
            None => self
                .store
                .discover_latest(pipeline, |_| true)
                .ok_or_else(|| OrchestratorError::NothingToResume {
                    pipeline: pipeline.to_string(),
                })?,
        };

        if self.session.is_foreign_live(&checkpoint.session) {
            CancelFlag::new(&self.paths.cancel_file(pipeline, &checkpoint.run_id)).request()?;
            info!(run_id = %checkpoint.run_id, "Cancellation requested");
            return Ok(CancelOutcome::Requested {
                run_id: checkpoint.run_id,
            });
        }

        checkpoint.halt = Some(HaltRecord {
            phase: checkpoint
                .phases
                .get(checkpoint.first_unfinished())
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            reason: "cancelled".to_string(),
            at: Utc::now(),
        });
        self.save(&mut checkpoint)?;
        let path = self.store.archive(&checkpoint)?;
        Ok(CancelOutcome::Archived {
            run_id: checkpoint.run_id,
            path,
        })
    }
}

fn cycle_outcome(decision: CycleDecision) -> Option<PhaseOutcome> {
    match decision {
        CycleDecision::Continue => None,
        CycleDecision::Converged => Some(PhaseOutcome::Completed { partial: None }),
        CycleDecision::ProceedFlagged(reason) => Some(PhaseOutcome::Completed {
            partial: Some(reason),
        }),
        CycleDecision::Halt(reason) => Some(PhaseOutcome::Halted(HaltReason::Blocked(reason))),
    }
}

/// Resolves once the cancel flag appears.
async fn watch_cancel(flag: &CancelFlag) {
    while !flag.is_set() {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}
