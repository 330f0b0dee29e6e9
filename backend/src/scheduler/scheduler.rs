//! Single-flight, rate-limited worker that drains the priority queue.
//!
//! Responsibilities:
//! - Pick the highest-priority, oldest pending unit.
//! - Drive it PENDING -> IN_FLIGHT -> DONE | FAILED, recomputing the parent
//!   request's overall status after every transition.
//! - Hold the processing lock across the work *and* the cooldown, so at most
//!   one unit enters IN_FLIGHT per cooldown interval.
//!
//! Non-responsibilities:
//! - Splitting submissions (intake + batcher).
//! - Deriving overall status (aggregator).
//!
//! Safety/liveness properties:
//! - Lock check-and-set is one atomic step; concurrent cycles cannot overlap.
//! - The lock is released on every exit path of a cycle, errors included.
//! - Claiming a unit (queue entry removed, IN_FLIGHT saved) is one storage
//!   write; a failed claim puts the entry back, so no unit is dropped.
//! - After a processed unit the loop re-arms unconditionally; when idle it
//!   sleeps on the queue's wake signal; when busy it polls once per cooldown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, field, info, instrument, warn};
use uuid::Uuid;

use crate::aggregator::StatusAggregator;
use crate::execution::processor::UnitProcessor;
use crate::execution::{RetryPolicy, classify_error, execute_with_retry};
use crate::ingestion::model::{OverallStatus, Unit};
use crate::ingestion::store::IngestionStore;
use crate::logger::annotate_span;
use crate::metrics::counters::Counters;
use crate::scheduler::lock::ProcessingLock;
use crate::scheduler::queue::WorkQueue;
use crate::time::now;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Wait between the end of one unit and the next pick.
    pub cooldown: Duration,
    /// Upper bound on one processing attempt.
    pub processing_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// What a single cycle did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle holds the processing lock.
    Busy,
    /// Queue was empty; the lock has been released.
    Idle,
    /// Unit reached DONE; the cooldown has elapsed.
    Completed(Uuid),
    /// Unit reached FAILED; the cooldown has elapsed.
    Failed(Uuid),
}

pub struct Scheduler<P: UnitProcessor> {
    store: Arc<IngestionStore>,
    queue: Arc<WorkQueue>,
    lock: Arc<ProcessingLock>,
    aggregator: StatusAggregator,
    processor: Arc<P>,
    cfg: SchedulerConfig,

    /// Observability counters (does not affect behavior).
    counters: Counters,
}

impl<P: UnitProcessor> Scheduler<P> {
    pub fn new(
        store: Arc<IngestionStore>,
        queue: Arc<WorkQueue>,
        processor: Arc<P>,
        cfg: SchedulerConfig,
        counters: Counters,
    ) -> Self {
        Self {
            aggregator: StatusAggregator::new(store.clone()),
            store,
            queue,
            lock: Arc::new(ProcessingLock::new()),
            processor,
            cfg,
            counters,
        }
    }

    pub fn lock(&self) -> &ProcessingLock {
        &self.lock
    }

    /// Spawns the worker loop on the current runtime.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));

        SchedulerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    /// Main worker loop.
    ///
    /// Shutdown is honored between cycles and while idle; a cycle that has
    /// started always runs to completion.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            component = "scheduler",
            event = "startup",
            cooldown_ms = self.cfg.cooldown.as_millis() as u64,
            "Scheduler loop started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(CycleOutcome::Completed(_)) | Ok(CycleOutcome::Failed(_)) => continue,
                Ok(CycleOutcome::Idle) => {
                    tokio::select! {
                        _ = self.queue.wait_for_work() => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Ok(CycleOutcome::Busy) => {
                    // The wake permit is spent and the holder will not signal
                    // on release; poll again after one cooldown.
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.cooldown) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    error!(error = ?e, "scheduler cycle failed; backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.cooldown) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        warn!(
            component = "scheduler",
            event = "shutdown",
            completed = Counters::get(&self.counters.units_completed),
            failed = Counters::get(&self.counters.units_failed),
            retries = Counters::get(&self.counters.retries),
            "Scheduler loop stopped"
        );
    }

    /// Runs one guarded cycle: acquire, select, process, cool down, release.
    #[instrument(
        skip(self),
        target = "scheduler",
        fields(request_id = field::Empty, unit_id = field::Empty)
    )]
    pub async fn run_cycle(&self) -> anyhow::Result<CycleOutcome> {
        if !self.lock.try_acquire() {
            debug!("processing lock held; skipping cycle");
            return Ok(CycleOutcome::Busy);
        }

        let outcome = self.cycle_locked().await;

        self.lock.release();
        if let Err(e) = self.store.set_processing_flag(false).await {
            warn!(error = ?e, "failed to persist processing flag release");
        }

        outcome
    }

    async fn cycle_locked(&self) -> anyhow::Result<CycleOutcome> {
        self.store.set_processing_flag(true).await?;

        let Some(mut unit) = self.select_next().await? else {
            Counters::bump(&self.counters.idle_cycles);
            debug!("queue empty; going idle");
            return Ok(CycleOutcome::Idle);
        };

        annotate_span(&unit.request_id, &unit.unit_id);
        Counters::bump(&self.counters.units_started);
        self.recompute_quietly(&unit.request_id).await;

        info!(
            ids = ?unit.ids,
            priority_rank = unit.priority_rank,
            queue_depth = ?self.queue.depth(),
            "unit in flight"
        );

        let outcome = self.execute(&mut unit).await?;

        // Rate limit: the next pick cannot happen before the cooldown elapses.
        tokio::time::sleep(self.cfg.cooldown).await;

        Ok(outcome)
    }

    /// Pops entries until one is claimed, i.e. its unit moved PENDING ->
    /// IN_FLIGHT and left the persisted queue in the same write.
    ///
    /// A failed claim changes nothing in storage, so the entry goes back on
    /// the in-memory queue before the error propagates.
    async fn select_next(&self) -> anyhow::Result<Option<Unit>> {
        while let Some(entry) = self.queue.dequeue_next() {
            match self.store.claim_unit(&entry.unit_id).await {
                Ok(Some(unit)) => return Ok(Some(unit)),
                Ok(None) => {
                    Counters::bump(&self.counters.skipped_entries);
                    warn!(unit_id = %entry.unit_id, "dequeued unit is missing or not pending; skipping");
                }
                Err(e) => {
                    self.queue.enqueue_all([entry]);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Aggregation is idempotent and re-run on the next transition, so a
    /// failed recompute must not abandon a claimed unit.
    async fn recompute_quietly(&self, request_id: &Uuid) -> Option<OverallStatus> {
        match self.aggregator.recompute(request_id).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(error = ?e, %request_id, "overall status recompute failed");
                None
            }
        }
    }

    /// Processes an IN_FLIGHT unit and persists its terminal state.
    async fn execute(&self, unit: &mut Unit) -> anyhow::Result<CycleOutcome> {
        let res = execute_with_retry(
            self.processor.as_ref(),
            unit,
            &self.cfg.retry,
            self.cfg.processing_timeout,
            &self.counters,
        )
        .await;

        let outcome = match res {
            Ok(results) => {
                unit.complete(results, now())?;
                Counters::bump(&self.counters.units_completed);
                CycleOutcome::Completed(unit.unit_id)
            }
            Err(e) => {
                let reason = classify_error(&e);
                error!(error = ?e, attempts = unit.attempts, "unit failed; not retrying further");
                unit.fail(reason, now())?;
                Counters::bump(&self.counters.units_failed);
                CycleOutcome::Failed(unit.unit_id)
            }
        };

        self.store.save_unit(unit).await?;
        let overall = self.recompute_quietly(&unit.request_id).await;

        info!(
            status = %unit.status,
            attempts = unit.attempts,
            overall = ?overall,
            "unit finished"
        );

        Ok(outcome)
    }
}

/// Owner-side handle to a spawned scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signals the loop to stop and waits for the in-progress cycle to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.join.await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
