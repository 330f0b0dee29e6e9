use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ingestion::model::{OverallStatus, QueueEntry, Request, Unit, UnitStatus};

#[async_trait]
pub trait IngestionRepository: Send + Sync {
    /// Persists the request, all of its units and their queue entries atomically.
    async fn insert_request(&self, request: &Request) -> Result<()>;

    /// Request with its units in creation order.
    async fn fetch_request(&self, request_id: &Uuid) -> Result<Option<Request>>;

    async fn fetch_unit(&self, unit_id: &Uuid) -> Result<Option<Unit>>;

    async fn fetch_units_in_status(&self, status: UnitStatus) -> Result<Vec<Unit>>;

    /// Writes the unit's mutable fields and bumps the parent's `updated_at`.
    async fn update_unit(&self, unit: &Unit, now: DateTime<Utc>) -> Result<()>;

    async fn persist_overall_status(
        &self,
        request_id: &Uuid,
        status: OverallStatus,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn remove_queue_entry(&self, unit_id: &Uuid) -> Result<()>;

    /// Removes the unit's queue entry and moves it PENDING -> IN_FLIGHT in one
    /// transaction. `None` (entry still removed) when the unit is missing or
    /// no longer PENDING. On error nothing changes.
    async fn claim_unit(&self, unit_id: &Uuid, now: DateTime<Utc>) -> Result<Option<Unit>>;

    /// Inserts a queue entry unless one already exists for the unit.
    async fn requeue_entry(&self, entry: &QueueEntry) -> Result<()>;

    /// Every persisted queue entry, in dequeue order.
    async fn fetch_queue_entries(&self) -> Result<Vec<QueueEntry>>;

    async fn set_processing_flag(&self, value: bool, now: DateTime<Utc>) -> Result<()>;

    async fn fetch_processing_flag(&self) -> Result<bool>;
}
