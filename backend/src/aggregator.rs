//! Derives a request's overall status from its units.
//!
//! Precedence (first match wins):
//! 1. every unit DONE                               -> COMPLETED
//! 2. every unit terminal and at least one FAILED   -> FAILED
//! 3. any unit IN_FLIGHT, DONE or FAILED            -> TRIGGERED
//! 4. otherwise (all PENDING)                       -> NOT_STARTED
//!
//! This is the only place `overall_status` is computed.

use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::ingestion::model::{OverallStatus, UnitStatus};
use crate::ingestion::store::IngestionStore;

pub fn derive_overall_status<I>(statuses: I) -> OverallStatus
where
    I: IntoIterator<Item = UnitStatus>,
{
    let mut total = 0usize;
    let mut done = 0usize;
    let mut failed = 0usize;
    let mut pending = 0usize;

    for s in statuses {
        total += 1;
        match s {
            UnitStatus::Done => done += 1,
            UnitStatus::Failed => failed += 1,
            UnitStatus::Pending => pending += 1,
            UnitStatus::InFlight => {}
        }
    }

    if total == 0 {
        return OverallStatus::NotStarted;
    }
    if done == total {
        return OverallStatus::Completed;
    }
    if done + failed == total {
        return OverallStatus::Failed;
    }
    if pending < total {
        return OverallStatus::Triggered;
    }
    OverallStatus::NotStarted
}

/// Recomputes and persists `overall_status` after unit transitions.
#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<IngestionStore>,
}

impl StatusAggregator {
    pub fn new(store: Arc<IngestionStore>) -> Self {
        Self { store }
    }

    /// Idempotent: writes only when the derived value differs from the
    /// stored one, so repeated calls leave status and `updated_at` alone.
    #[instrument(skip(self), target = "aggregator", fields(request_id = %request_id))]
    pub async fn recompute(&self, request_id: &Uuid) -> anyhow::Result<OverallStatus> {
        let request = self
            .store
            .load_request(request_id)
            .await?
            .ok_or_else(|| anyhow!("request {request_id} vanished during recompute"))?;

        let derived = derive_overall_status(request.units.iter().map(|u| u.status));

        if derived != request.overall_status {
            debug!(from = %request.overall_status, to = %derived, "overall status changed");
            self.store.persist_overall_status(request_id, derived).await?;
        }

        Ok(derived)
    }
}
