//! One reconciliation cycle: BUDGET_CHECK → PLAN → FETCH → NORMALIZE → GATE → PERSIST →
//! ADVANCE_CURSOR, each stage under its own deadline.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use recon_store::{DeadlineExceeded, NormalizedEvent, Record, Reservation, Store};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::action::ActionType;
use crate::analyze::{compute_signals, normalize, SignalSet};
use crate::brief::{
    build_artifact, compose_summary, GateDecision, GatePolicy, SkipReason, Summarizer,
    TemplateSummarizer,
};
use crate::config::ReconConfig;
use crate::error::{CycleError, ProviderErrorKind, Stage};
use crate::memory::Memory;
use crate::notify::{spawn_notify, SharedNotifier};
use crate::planner::{plan, Plan, PlannerView, Selection};
use crate::provider::ProviderChains;
use crate::staleness::CursorTracker;
use crate::worker::{FetchResult, Worker};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCause {
    NoTargets,
    BudgetExceeded,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    /// The provider chain was exhausted; the cursor stays put so the target is retried.
    Degraded {
        attempted_providers: Vec<String>,
        last_error_kind: Option<ProviderErrorKind>,
    },
    Skipped {
        reason: SkipCause,
    },
    Failed {
        stage: Stage,
        error: String,
    },
    TimedOut {
        stage: Stage,
    },
    Interrupted,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Degraded { .. } => "degraded",
            OutcomeKind::Skipped { .. } => "skipped",
            OutcomeKind::Failed { .. } => "failed",
            OutcomeKind::TimedOut { .. } => "timed_out",
            OutcomeKind::Interrupted => "interrupted",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CycleOutcome {
    pub at: DateTime<Utc>,
    pub action_type: Option<ActionType>,
    pub target: Option<String>,
    pub outcome: OutcomeKind,
    pub emitted: bool,
    pub artifact_id: Option<String>,
    /// Events inside the signal window.
    pub event_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<SkipReason>,
    pub rejected_records: usize,
}

impl CycleOutcome {
    fn idle(at: DateTime<Utc>) -> Self {
        Self {
            at,
            action_type: None,
            target: None,
            outcome: OutcomeKind::Skipped {
                reason: SkipCause::NoTargets,
            },
            emitted: false,
            artifact_id: None,
            event_count: 0,
            gate: None,
            rejected_records: 0,
        }
    }
}

impl CycleError {
    fn into_outcome(self, stage: Stage) -> OutcomeKind {
        match self {
            CycleError::Timeout { stage } => OutcomeKind::TimedOut { stage },
            CycleError::Storage(err) => OutcomeKind::Failed {
                stage,
                error: format!("{err:#}"),
            },
            CycleError::Config(msg) => OutcomeKind::Failed { stage, error: msg },
        }
    }
}

impl CycleError {
    /// A write rolled back at its deadline is a stage timeout, not a storage failure.
    fn from_write(err: anyhow::Error, stage: Stage) -> Self {
        if err.downcast_ref::<DeadlineExceeded>().is_some() {
            CycleError::Timeout { stage }
        } else {
            CycleError::Storage(err)
        }
    }
}

/// Removes its target from the in-flight set when dropped.
struct TargetClaim {
    in_flight: Arc<Mutex<HashSet<String>>>,
    target: String,
}

impl Drop for TargetClaim {
    fn drop(&mut self) {
        lock(&self.in_flight).remove(&self.target);
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum Planned {
    Ready(Selection, TargetClaim),
    Skip(SkipCause),
}

struct Analyzed {
    signals: SignalSet,
    window_events: Vec<NormalizedEvent>,
    rejected: usize,
}

/// Store handle, pipeline stages and the shared in-flight target set. Cheap to clone; clones
/// share claims so concurrent cycles never work the same target.
#[derive(Clone)]
pub struct Reconciler {
    store: Store,
    cfg: Arc<ReconConfig>,
    cursors: CursorTracker,
    worker: Worker,
    memory: Memory,
    gate: GatePolicy,
    summarizer: Arc<dyn Summarizer>,
    notifier: Option<SharedNotifier>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    notifications: Arc<Mutex<JoinSet<()>>>,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(store: Store, cfg: ReconConfig, chains: ProviderChains) -> Result<Self, CycleError> {
        cfg.validate()
            .map_err(|e| CycleError::Config(e.to_string()))?;
        let (_tx, shutdown) = watch::channel(false);
        Ok(Self {
            cursors: CursorTracker::new(store.clone()),
            worker: Worker::new(store.clone(), chains, &cfg.worker),
            memory: Memory::new(store.clone()),
            gate: GatePolicy::from(&cfg.gate),
            summarizer: Arc::new(TemplateSummarizer),
            notifier: None,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            notifications: Arc::new(Mutex::new(JoinSet::new())),
            shutdown,
            cfg: Arc::new(cfg),
            store,
        })
    }

    /// Open the store under `state_dir` and build provider chains from the config.
    pub fn from_config(cfg: ReconConfig) -> Result<Self, CycleError> {
        let store = Store::open(&cfg.state_dir())?;
        let chains = ProviderChains::from_config(&cfg);
        Self::new(store, cfg, chains)
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_notifier(mut self, notifier: SharedNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Cycles observe `true` on this channel before FETCH and before PERSIST.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &ReconConfig {
        &self.cfg
    }

    /// Release budget holds orphaned by an unclean shutdown. Call before the first cycle.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.release_stale_reservations())
            .await
            .map_err(|e| anyhow::anyhow!("join error: {}", e))?
    }

    /// Wait up to `grace` for notifications still in flight; whatever is left is aborted.
    /// Returns how many were abandoned. Call before the runtime shuts down.
    pub async fn drain_notifications(&self, grace: Duration) -> usize {
        let mut pending = std::mem::take(
            &mut *self
                .notifications
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let waited = tokio::time::timeout(grace, async {
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    tracing::warn!(target: "recon::notify", error = %err, "notification task aborted");
                }
            }
        })
        .await;
        let abandoned = pending.len();
        if waited.is_err() && abandoned > 0 {
            tracing::warn!(
                target: "recon::notify",
                abandoned,
                grace_ms = grace.as_millis() as u64,
                "notifications still pending at shutdown were dropped"
            );
            pending.abort_all();
        }
        abandoned
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn staged<T, F>(&self, stage: Stage, fut: F) -> Result<T, CycleError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.cfg.timeouts.for_stage(stage), fut).await {
            Ok(res) => res.map_err(CycleError::Storage),
            Err(_) => Err(CycleError::Timeout { stage }),
        }
    }

    /// Run at most one action. Never panics or errors: every failure is an [`OutcomeKind`],
    /// and the cursor only moves when every write of the cycle is durable.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleOutcome {
        let mut out = CycleOutcome::idle(now);
        if self.shutting_down() {
            out.outcome = OutcomeKind::Interrupted;
            return finish(out);
        }

        let (selection, claim) = match self
            .staged(Stage::Planner, self.plan_and_claim(now))
            .await
        {
            Ok(Planned::Ready(selection, claim)) => (selection, claim),
            Ok(Planned::Skip(reason)) => {
                out.outcome = OutcomeKind::Skipped { reason };
                return finish(out);
            }
            Err(err) => {
                out.outcome = err.into_outcome(Stage::Planner);
                return finish(out);
            }
        };
        out.action_type = Some(selection.action);
        out.target = Some(selection.target.clone());

        let cap = self.cfg.budget.daily_cap_micros();
        // Never raced against a deadline: the hold is either settled below or never written.
        let reservation = match self
            .store
            .reserve_async(now.date_naive(), selection.cost_micros, cap)
            .await
            .map_err(CycleError::Storage)
        {
            Ok(Some(reservation)) => reservation,
            Ok(None) => {
                out.outcome = OutcomeKind::Skipped {
                    reason: SkipCause::BudgetExceeded,
                };
                return finish(out);
            }
            Err(err) => {
                out.outcome = err.into_outcome(Stage::Budget);
                return finish(out);
            }
        };

        let mut provider_answered = false;
        let outcome = self
            .execute(&selection, now, &mut out, &mut provider_answered)
            .await;
        out.outcome = outcome;
        self.settle(reservation, provider_answered).await;
        drop(claim);
        finish(out)
    }

    /// Run up to `parallelism` cycles concurrently; each claims a distinct target.
    pub async fn run_batch(&self, now: DateTime<Utc>, parallelism: usize) -> Vec<CycleOutcome> {
        let mut set = JoinSet::new();
        for _ in 0..parallelism.max(1) {
            let r = self.clone();
            set.spawn(async move { r.run_cycle(now).await });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(
                    target: "recon::cycle",
                    error = %err,
                    "cycle task aborted"
                ),
            }
        }
        outcomes
    }

    async fn plan_and_claim(&self, now: DateTime<Utc>) -> anyhow::Result<Planned> {
        let cursors = self.cursors.snapshot().await?;
        let ledger = self
            .store
            .ledger_async(now.date_naive(), self.cfg.budget.daily_cap_micros())
            .await?;
        let planned = {
            let mut busy = lock(&self.in_flight);
            let plan = plan(
                &PlannerView {
                    targets: &self.cfg.targets,
                    cursors: &cursors,
                    budget: &self.cfg.budget,
                    headroom_micros: ledger.headroom(),
                    busy: &busy,
                },
                now,
            );
            tracing::debug!(
                target: "recon::planner",
                plan = plan.as_str(),
                headroom_micros = ledger.headroom(),
                "planned cycle"
            );
            match plan {
                Plan::Selected(selection) => {
                    busy.insert(selection.target.clone());
                    let claim = TargetClaim {
                        in_flight: self.in_flight.clone(),
                        target: selection.target.clone(),
                    };
                    Planned::Ready(selection, claim)
                }
                Plan::NoTargets => Planned::Skip(SkipCause::NoTargets),
                Plan::BudgetExceeded { .. } => Planned::Skip(SkipCause::BudgetExceeded),
            }
        };
        // Another cycle may have finished this target after our snapshot was taken.
        if let Planned::Ready(selection, _) = &planned {
            let current = self
                .store
                .cursor_async(selection.action.as_str(), &selection.target)
                .await?;
            if current > selection.last_success_at {
                return Ok(Planned::Skip(SkipCause::NoTargets));
            }
        }
        Ok(planned)
    }

    async fn execute(
        &self,
        selection: &Selection,
        now: DateTime<Utc>,
        out: &mut CycleOutcome,
        provider_answered: &mut bool,
    ) -> OutcomeKind {
        let action = selection.action;
        let target = selection.target.as_str();
        if self.shutting_down() {
            return OutcomeKind::Interrupted;
        }

        // The worker splits this deadline across the chain itself.
        let since = selection.last_success_at.unwrap_or_default();
        let worker_deadline = Instant::now() + self.cfg.timeouts.for_stage(Stage::Worker);
        let fetched = match self
            .worker
            .fetch(action, target, since, now, worker_deadline)
            .await
        {
            Ok(fetched) => fetched,
            Err(err) => return CycleError::Storage(err).into_outcome(Stage::Worker),
        };
        *provider_answered = fetched.is_success();

        let analyzed = match self
            .staged(Stage::Analyze, self.analyze(&fetched, target, now))
            .await
        {
            Ok(analyzed) => analyzed,
            Err(err) => return err.into_outcome(Stage::Analyze),
        };
        out.event_count = analyzed.signals.event_count;
        out.rejected_records = analyzed.rejected;

        let last_emitted_at = match self
            .staged(Stage::Brief, self.store.latest_artifact_async(target))
            .await
        {
            Ok(latest) => latest.map(|a| a.created_at),
            Err(err) => return err.into_outcome(Stage::Brief),
        };
        let artifact = match self.gate.decide(&analyzed.signals, last_emitted_at, now) {
            GateDecision::Emit => {
                let summary = compose_summary(
                    self.summarizer.as_ref(),
                    target,
                    &analyzed.window_events,
                    &analyzed.signals,
                    &self.cfg.summary,
                    self.cfg.timeouts.for_stage(Stage::Brief),
                )
                .await;
                Some(build_artifact(
                    &self.gate,
                    target,
                    &analyzed.signals,
                    summary,
                    now,
                ))
            }
            GateDecision::Skip(reason) => {
                tracing::debug!(
                    target: "recon::brief",
                    target_id = %target,
                    reason = reason.as_str(),
                    "brief skipped"
                );
                out.gate = Some(reason);
                None
            }
        };

        if self.shutting_down() {
            return OutcomeKind::Interrupted;
        }

        // Memory enforces its deadline by rolling back; the commit is never dropped mid-write.
        let advance_to = fetched.is_success().then_some(now);
        let memory_deadline = Instant::now() + self.cfg.timeouts.for_stage(Stage::Memory);
        if let Err(err) = self
            .memory
            .commit(
                action,
                target,
                artifact.as_ref(),
                advance_to,
                now,
                memory_deadline,
            )
            .await
        {
            return CycleError::from_write(err, Stage::Memory).into_outcome(Stage::Memory);
        }

        if let Some(artifact) = artifact {
            out.emitted = true;
            out.artifact_id = Some(artifact.artifact_id.clone());
            if let Some(notifier) = &self.notifier {
                let mut tasks = self
                    .notifications
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                spawn_notify(&mut tasks, notifier.clone(), artifact);
            }
        }

        match fetched {
            FetchResult::Success { .. } => OutcomeKind::Success,
            FetchResult::Exhausted {
                attempted_providers,
                last_error_kind,
            } => OutcomeKind::Degraded {
                attempted_providers,
                last_error_kind,
            },
        }
    }

    async fn analyze(
        &self,
        fetched: &FetchResult,
        target: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Analyzed> {
        let mut rejected = 0;
        if let Some(record) = fetched.record() {
            let normalized = normalize(record);
            rejected = normalized.rejected.len();
            if !normalized.events.is_empty() {
                let records: Vec<Record> = normalized.events.into_iter().map(Record::from).collect();
                self.store.upsert_many_async(records).await?;
            }
        }
        let window = self.cfg.analyze.window();
        let window_events = self
            .store
            .events_for_target_async(target, now - window, now)
            .await?;
        let signals = compute_signals(&window_events, now, window, &self.cfg.analyze);
        Ok(Analyzed {
            signals,
            window_events,
            rejected,
        })
    }

    /// A provider that answered was paid for; anything else hands the hold back.
    async fn settle(&self, reservation: Reservation, provider_answered: bool) {
        let id = reservation.id.clone();
        let result = if provider_answered {
            self.store.commit_reservation_async(reservation).await
        } else {
            self.store.release_reservation_async(reservation).await
        };
        if let Err(err) = result {
            tracing::error!(
                target: "recon::cycle",
                reservation = %id,
                committed = provider_answered,
                error = %err,
                "failed to settle budget reservation"
            );
        }
    }
}

fn finish(out: CycleOutcome) -> CycleOutcome {
    let action = out.action_type.map(|a| a.as_str()).unwrap_or("-");
    let target = out.target.as_deref().unwrap_or("-");
    match &out.outcome {
        OutcomeKind::Success | OutcomeKind::Skipped { .. } => tracing::info!(
            target: "recon::cycle",
            action,
            target_id = target,
            outcome = out.outcome.as_str(),
            emitted = out.emitted,
            events = out.event_count,
            "cycle finished"
        ),
        OutcomeKind::Degraded { .. } | OutcomeKind::Interrupted => tracing::warn!(
            target: "recon::cycle",
            action,
            target_id = target,
            outcome = out.outcome.as_str(),
            "cycle finished without advancing cursor"
        ),
        OutcomeKind::Failed { stage, error } => tracing::error!(
            target: "recon::cycle",
            action,
            target_id = target,
            stage = stage.as_str(),
            error = %error,
            "cycle failed"
        ),
        OutcomeKind::TimedOut { stage } => tracing::warn!(
            target: "recon::cycle",
            action,
            target_id = target,
            stage = stage.as_str(),
            "cycle stage timed out"
        ),
    }
    out
}
