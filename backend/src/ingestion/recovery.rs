use std::collections::HashSet;

use tracing::{info, instrument, warn};

use crate::aggregator::StatusAggregator;
use crate::ingestion::model::UnitStatus;
use crate::ingestion::store::IngestionStore;
use crate::scheduler::queue::WorkQueue;
use crate::time::now;

/// Reason recorded on units that were in flight when the previous process died.
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub stale_flag_cleared: bool,
    pub interrupted_units: usize,
    /// PENDING units that had lost their queue entry.
    pub orphaned_units: usize,
    pub requeued_units: usize,
}

/// Brings persisted state back to a schedulable shape on startup.
///
/// - clears a processing flag left set by a crash
/// - fails units stranded IN_FLIGHT (status never regresses to PENDING)
/// - gives PENDING units without a queue entry a new one
/// - reloads persisted queue entries and resumes the sequence counter
///
/// Must run before the scheduler is started.
#[instrument(skip_all, target = "store")]
pub async fn recover_after_restart(
    store: &IngestionStore,
    queue: &WorkQueue,
    aggregator: &StatusAggregator,
) -> anyhow::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    if store.processing_flag().await? {
        warn!("processing flag was left set; clearing");
        store.set_processing_flag(false).await?;
        report.stale_flag_cleared = true;
    }

    for mut unit in store.units_in_status(UnitStatus::InFlight).await? {
        warn!(
            unit_id = %unit.unit_id,
            request_id = %unit.request_id,
            "unit stranded in flight; marking failed"
        );
        unit.fail(INTERRUPTED_REASON, now())?;
        store.save_unit(&unit).await?;
        aggregator.recompute(&unit.request_id).await?;
        report.interrupted_units += 1;
    }

    let mut entries = store.queue_entries().await?;
    let queued: HashSet<_> = entries.iter().map(|e| e.unit_id).collect();

    for unit in store.units_in_status(UnitStatus::Pending).await? {
        if queued.contains(&unit.unit_id) {
            continue;
        }
        warn!(
            unit_id = %unit.unit_id,
            request_id = %unit.request_id,
            "pending unit has no queue entry; requeueing"
        );
        let entry = unit.queue_entry();
        store.requeue_entry(&entry).await?;
        entries.push(entry);
        report.orphaned_units += 1;
    }

    report.requeued_units = entries.len();
    queue.restore(entries);

    info!(
        stale_flag_cleared = report.stale_flag_cleared,
        interrupted = report.interrupted_units,
        orphaned = report.orphaned_units,
        requeued = report.requeued_units,
        "restart recovery complete"
    );

    Ok(report)
}
