use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::ingestion::model::{OverallStatus, QueueEntry, Request, Unit, UnitStatus};
use crate::ingestion::repository::IngestionRepository;
use crate::logger::warn_if_slow;
use crate::time::now;

/// Scheduler- and intake-facing access to persisted ingestion state.
///
/// Adds timing guards, tracing and error context around the repository.
/// Every write of `status` / `overall_status` flows through here.
pub struct IngestionStore {
    repo: Arc<dyn IngestionRepository>,
}

impl IngestionStore {
    pub fn new(repo: Arc<dyn IngestionRepository>) -> Self {
        Self { repo }
    }

    #[instrument(
        skip(self, request),
        target = "store",
        fields(request_id = %request.request_id, units = request.units.len())
    )]
    pub async fn create_request(&self, request: &Request) -> Result<()> {
        debug!("persisting request with its units and queue entries");

        warn_if_slow("db_insert_request", Duration::from_millis(200), async {
            self.repo.insert_request(request).await
        })
        .await
        .context("failed to persist ingestion request")
    }

    #[instrument(skip(self), target = "store", fields(request_id = %request_id))]
    pub async fn load_request(&self, request_id: &Uuid) -> Result<Option<Request>> {
        warn_if_slow("db_fetch_request", Duration::from_millis(100), async {
            self.repo.fetch_request(request_id).await
        })
        .await
        .context("repository fetch failed")
    }

    #[instrument(skip(self), target = "store", fields(unit_id = %unit_id))]
    pub async fn load_unit(&self, unit_id: &Uuid) -> Result<Option<Unit>> {
        warn_if_slow("db_fetch_unit", Duration::from_millis(100), async {
            self.repo.fetch_unit(unit_id).await
        })
        .await
        .context("repository fetch failed")
    }

    pub async fn units_in_status(&self, status: UnitStatus) -> Result<Vec<Unit>> {
        self.repo
            .fetch_units_in_status(status)
            .await
            .with_context(|| format!("failed to scan units in status {status}"))
    }

    #[instrument(
        skip(self, unit),
        target = "store",
        fields(unit_id = %unit.unit_id, status = %unit.status)
    )]
    pub async fn save_unit(&self, unit: &Unit) -> Result<()> {
        debug!("persisting unit transition");

        warn_if_slow("db_update_unit", Duration::from_millis(50), async {
            self.repo.update_unit(unit, now()).await
        })
        .await
        .context("failed to persist unit state")
    }

    #[instrument(skip(self), target = "store", fields(request_id = %request_id, %status))]
    pub async fn persist_overall_status(
        &self,
        request_id: &Uuid,
        status: OverallStatus,
    ) -> Result<()> {
        warn_if_slow("db_persist_overall", Duration::from_millis(50), async {
            self.repo
                .persist_overall_status(request_id, status, now())
                .await
        })
        .await
        .context("failed to persist overall status")
    }

    pub async fn remove_queue_entry(&self, unit_id: &Uuid) -> Result<()> {
        self.repo
            .remove_queue_entry(unit_id)
            .await
            .with_context(|| format!("failed to remove queue entry {unit_id}"))
    }

    /// Takes the unit off the persisted queue and marks it IN_FLIGHT, atomically.
    #[instrument(skip(self), target = "store", fields(unit_id = %unit_id))]
    pub async fn claim_unit(&self, unit_id: &Uuid) -> Result<Option<Unit>> {
        warn_if_slow("db_claim_unit", Duration::from_millis(50), async {
            self.repo.claim_unit(unit_id, now()).await
        })
        .await
        .context("failed to claim unit")
    }

    pub async fn requeue_entry(&self, entry: &QueueEntry) -> Result<()> {
        self.repo
            .requeue_entry(entry)
            .await
            .with_context(|| format!("failed to requeue unit {}", entry.unit_id))
    }

    pub async fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
        self.repo
            .fetch_queue_entries()
            .await
            .context("failed to load persisted queue")
    }

    pub async fn set_processing_flag(&self, value: bool) -> Result<()> {
        self.repo
            .set_processing_flag(value, now())
            .await
            .context("failed to persist processing flag")
    }

    pub async fn processing_flag(&self) -> Result<bool> {
        self.repo
            .fetch_processing_flag()
            .await
            .context("failed to read processing flag")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    pub struct FailingRepo;

    #[async_trait]
    impl IngestionRepository for FailingRepo {
        async fn insert_request(&self, _: &Request) -> Result<()> {
            Err(anyhow::anyhow!("Database Offline"))
        }
        async fn fetch_request(&self, _: &Uuid) -> Result<Option<Request>> {
            Ok(None)
        }
        async fn fetch_unit(&self, _: &Uuid) -> Result<Option<Unit>> {
            Ok(None)
        }
        async fn fetch_units_in_status(&self, _: UnitStatus) -> Result<Vec<Unit>> {
            Ok(vec![])
        }
        async fn update_unit(&self, _: &Unit, _: DateTime<Utc>) -> Result<()> {
            Err(anyhow::anyhow!("Disk Full"))
        }
        async fn persist_overall_status(
            &self,
            _: &Uuid,
            _: OverallStatus,
            _: DateTime<Utc>,
        ) -> Result<()> {
            Ok(())
        }
        async fn remove_queue_entry(&self, _: &Uuid) -> Result<()> {
            Ok(())
        }
        async fn claim_unit(&self, _: &Uuid, _: DateTime<Utc>) -> Result<Option<Unit>> {
            Err(anyhow::anyhow!("Lock Timeout"))
        }
        async fn requeue_entry(&self, _: &QueueEntry) -> Result<()> {
            Ok(())
        }
        async fn fetch_queue_entries(&self) -> Result<Vec<QueueEntry>> {
            Ok(vec![])
        }
        async fn set_processing_flag(&self, _: bool, _: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
        async fn fetch_processing_flag(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn mk_request() -> Request {
        let id = Uuid::new_v4();
        Request {
            request_id: id,
            priority: crate::ingestion::model::Priority::Low,
            overall_status: OverallStatus::NotStarted,
            units: vec![Unit::new(
                id,
                vec![1],
                crate::ingestion::model::Priority::Low,
                now(),
                0,
            )],
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn create_request_error_keeps_root_cause() {
        let store = IngestionStore::new(Arc::new(FailingRepo));
        let result = store.create_request(&mk_request()).await;

        // Use format!("{:?}") to see the full error chain provided by anyhow context
        let err_msg = format!("{:?}", result.unwrap_err());
        assert!(err_msg.contains("failed to persist ingestion request"));
        assert!(
            err_msg.contains("Database Offline"),
            "Error chain did not contain root cause 'Database Offline'. Found: {}",
            err_msg
        );
    }

    #[tokio::test]
    async fn save_unit_error_is_contextualized() {
        let store = IngestionStore::new(Arc::new(FailingRepo));
        let unit = mk_request().units.remove(0);

        let err_msg = format!("{:?}", store.save_unit(&unit).await.unwrap_err());
        assert!(err_msg.contains("failed to persist unit state"));
        assert!(err_msg.contains("Disk Full"));
    }

    #[tokio::test]
    async fn claim_error_is_contextualized() {
        let store = IngestionStore::new(Arc::new(FailingRepo));

        let err_msg = format!("{:?}", store.claim_unit(&Uuid::new_v4()).await.unwrap_err());
        assert!(err_msg.contains("failed to claim unit"));
        assert!(err_msg.contains("Lock Timeout"));
    }

    #[tokio::test]
    async fn missing_request_is_none_not_error() {
        let store = IngestionStore::new(Arc::new(FailingRepo));
        let loaded = store.load_request(&Uuid::new_v4()).await.unwrap();
        assert!(loaded.is_none());
    }
}
