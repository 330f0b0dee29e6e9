//! Intake: turns a validated submission into a request plus queued units.
//!
//! A request is persisted together with all of its units and queue entries
//! in one repository call, then the entries are pushed onto the shared
//! queue, which wakes the scheduler. Status lookups read persisted state
//! only and never touch the queue or the processing lock.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::batcher::split_ids;
use crate::error::IngestError;
use crate::ingestion::model::{OverallStatus, Priority, Request, RequestStatus, Unit};
use crate::ingestion::store::IngestionStore;
use crate::metrics::counters::Counters;
use crate::scheduler::queue::WorkQueue;
use crate::time::now;

/// Smallest accepted record identifier.
pub const MIN_RECORD_ID: i64 = 1;
/// Largest accepted record identifier (10^9 + 7).
pub const MAX_RECORD_ID: i64 = 1_000_000_007;

pub struct IngestService {
    store: Arc<IngestionStore>,
    queue: Arc<WorkQueue>,
    batch_size: usize,
    counters: Counters,
}

impl IngestService {
    pub fn new(
        store: Arc<IngestionStore>,
        queue: Arc<WorkQueue>,
        batch_size: usize,
        counters: Counters,
    ) -> Self {
        Self {
            store,
            queue,
            batch_size: batch_size.max(1),
            counters,
        }
    }

    /// Accepts `ids` at `priority` and returns the new request's id.
    ///
    /// Nothing is persisted when validation fails.
    #[instrument(skip(self, ids), target = "intake", fields(n_ids = ids.len(), %priority))]
    pub async fn submit(&self, ids: &[i64], priority: Priority) -> Result<Uuid, IngestError> {
        validate_ids(ids)?;

        let request_id = Uuid::new_v4();
        let created_at = now();

        let units: Vec<Unit> = split_ids(ids, self.batch_size)
            .into_iter()
            .map(|chunk| Unit::new(request_id, chunk, priority, created_at, self.queue.next_seq()))
            .collect();

        let request = Request {
            request_id,
            priority,
            overall_status: OverallStatus::NotStarted,
            units,
            created_at,
            updated_at: created_at,
        };

        self.store.create_request(&request).await?;

        self.queue
            .enqueue_all(request.units.iter().map(Unit::queue_entry));

        Counters::bump(&self.counters.requests_submitted);
        Counters::add(&self.counters.units_enqueued, request.units.len() as u64);

        info!(
            request_id = %request_id,
            units = request.units.len(),
            queue_depth = self.queue.len(),
            "request accepted"
        );

        Ok(request_id)
    }

    /// Current snapshot of a request; may trail the scheduler by one write.
    #[instrument(skip(self), target = "intake", fields(request_id = %request_id))]
    pub async fn get_status(&self, request_id: &Uuid) -> Result<RequestStatus, IngestError> {
        match self.store.load_request(request_id).await? {
            Some(request) => Ok(RequestStatus::from(&request)),
            None => Err(IngestError::NotFound(*request_id)),
        }
    }
}

/// Non-empty, and every identifier within `MIN_RECORD_ID..=MAX_RECORD_ID`.
pub fn validate_ids(ids: &[i64]) -> Result<(), IngestError> {
    if ids.is_empty() {
        return Err(IngestError::InvalidInput(
            "ids must be a non-empty array".into(),
        ));
    }

    if let Some(bad) = ids
        .iter()
        .find(|id| !(MIN_RECORD_ID..=MAX_RECORD_ID).contains(*id))
    {
        return Err(IngestError::InvalidInput(format!(
            "id {bad} outside {MIN_RECORD_ID}..={MAX_RECORD_ID}"
        )));
    }

    Ok(())
}
