#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use ingest_backend::{
    execution::RetryPolicy,
    execution::processor::{SimulatedProcessor, UnitProcessor},
    ingestion::model::{ItemResult, OverallStatus, Priority, QueueEntry, Request, Unit, UnitStatus},
    ingestion::repository::IngestionRepository,
    ingestion::store::IngestionStore,
    intake::IngestService,
    metrics::counters::Counters,
    scheduler::queue::WorkQueue,
    scheduler::scheduler::{Scheduler, SchedulerConfig},
};

pub const COOLDOWN: Duration = Duration::from_secs(5);
pub const PROCESSING: Duration = Duration::from_secs(1);

/// A persisted unit write, stamped with the (virtual) tokio clock.
#[derive(Clone, Debug)]
pub struct Transition {
    pub unit_id: Uuid,
    pub request_id: Uuid,
    pub status: UnitStatus,
    pub at: Instant,
}

struct RequestRow {
    priority: Priority,
    overall_status: OverallStatus,
    unit_ids: Vec<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    requests: HashMap<Uuid, RequestRow>,
    units: HashMap<Uuid, Unit>,
    queue: HashMap<Uuid, QueueEntry>,
    processing: bool,
    transitions: Vec<Transition>,
    overall_history: Vec<(Uuid, OverallStatus)>,
}

/// In-memory repository for scheduler tests.
///
/// Runs entirely on the tokio clock, so tests can use paused time without
/// a database thread racing the auto-advance.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
    fail_next_claim: AtomicBool,
}

impl InMemoryRepository {
    /// Makes the next `claim_unit` fail without touching any state.
    pub fn fail_next_claim(&self) {
        self.fail_next_claim.store(true, Ordering::SeqCst);
    }

    /// Drops a queue entry behind the store's back.
    pub fn forget_queue_entry(&self, unit_id: &Uuid) {
        self.state.lock().queue.remove(unit_id);
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.state.lock().transitions.clone()
    }

    /// Every overall status the request has held, initial value included.
    pub fn overall_history(&self, request_id: &Uuid) -> Vec<OverallStatus> {
        self.state
            .lock()
            .overall_history
            .iter()
            .filter(|(id, _)| id == request_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn processing(&self) -> bool {
        self.state.lock().processing
    }
}

#[async_trait]
impl IngestionRepository for InMemoryRepository {
    async fn insert_request(&self, request: &Request) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        if st.requests.contains_key(&request.request_id) {
            return Err(anyhow!("duplicate request {}", request.request_id));
        }

        for u in &request.units {
            st.units.insert(u.unit_id, u.clone());
            st.queue.insert(u.unit_id, u.queue_entry());
        }
        st.requests.insert(
            request.request_id,
            RequestRow {
                priority: request.priority,
                overall_status: request.overall_status,
                unit_ids: request.units.iter().map(|u| u.unit_id).collect(),
                created_at: request.created_at,
                updated_at: request.updated_at,
            },
        );
        st.overall_history
            .push((request.request_id, request.overall_status));
        Ok(())
    }

    async fn fetch_request(&self, request_id: &Uuid) -> anyhow::Result<Option<Request>> {
        let st = self.state.lock();
        let Some(row) = st.requests.get(request_id) else {
            return Ok(None);
        };

        let units = row
            .unit_ids
            .iter()
            .filter_map(|id| st.units.get(id).cloned())
            .collect();

        Ok(Some(Request {
            request_id: *request_id,
            priority: row.priority,
            overall_status: row.overall_status,
            units,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    async fn fetch_unit(&self, unit_id: &Uuid) -> anyhow::Result<Option<Unit>> {
        Ok(self.state.lock().units.get(unit_id).cloned())
    }

    async fn fetch_units_in_status(&self, status: UnitStatus) -> anyhow::Result<Vec<Unit>> {
        let mut units: Vec<Unit> = self
            .state
            .lock()
            .units
            .values()
            .filter(|u| u.status == status)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.seq);
        Ok(units)
    }

    async fn update_unit(&self, unit: &Unit, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        if !st.units.contains_key(&unit.unit_id) {
            return Err(anyhow!("unknown unit {}", unit.unit_id));
        }

        st.units.insert(unit.unit_id, unit.clone());
        if let Some(row) = st.requests.get_mut(&unit.request_id) {
            row.updated_at = now;
        }
        st.transitions.push(Transition {
            unit_id: unit.unit_id,
            request_id: unit.request_id,
            status: unit.status,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn persist_overall_status(
        &self,
        request_id: &Uuid,
        status: OverallStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut st = self.state.lock();
        let row = st
            .requests
            .get_mut(request_id)
            .ok_or_else(|| anyhow!("unknown request {request_id}"))?;
        row.overall_status = status;
        row.updated_at = now;
        st.overall_history.push((*request_id, status));
        Ok(())
    }

    async fn remove_queue_entry(&self, unit_id: &Uuid) -> anyhow::Result<()> {
        self.state.lock().queue.remove(unit_id);
        Ok(())
    }

    async fn claim_unit(&self, unit_id: &Uuid, now: DateTime<Utc>) -> anyhow::Result<Option<Unit>> {
        if self.fail_next_claim.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("connection reset"));
        }

        let mut st = self.state.lock();
        st.queue.remove(unit_id);

        let Some(unit) = st.units.get_mut(unit_id) else {
            return Ok(None);
        };
        if unit.status != UnitStatus::Pending {
            return Ok(None);
        }
        unit.start(now)?;
        let unit = unit.clone();

        if let Some(row) = st.requests.get_mut(&unit.request_id) {
            row.updated_at = now;
        }
        st.transitions.push(Transition {
            unit_id: unit.unit_id,
            request_id: unit.request_id,
            status: unit.status,
            at: Instant::now(),
        });
        Ok(Some(unit))
    }

    async fn requeue_entry(&self, entry: &QueueEntry) -> anyhow::Result<()> {
        self.state
            .lock()
            .queue
            .entry(entry.unit_id)
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    async fn fetch_queue_entries(&self) -> anyhow::Result<Vec<QueueEntry>> {
        let mut entries: Vec<QueueEntry> = self.state.lock().queue.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.priority_rank
                .cmp(&a.priority_rank)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(entries)
    }

    async fn set_processing_flag(&self, value: bool, _now: DateTime<Utc>) -> anyhow::Result<()> {
        self.state.lock().processing = value;
        Ok(())
    }

    async fn fetch_processing_flag(&self) -> anyhow::Result<bool> {
        Ok(self.state.lock().processing)
    }
}

/// Processor whose every attempt fails.
pub struct FailingProcessor;

#[async_trait]
impl UnitProcessor for FailingProcessor {
    async fn process(&self, _unit: &Unit) -> anyhow::Result<Vec<ItemResult>> {
        tokio::time::sleep(PROCESSING).await;
        Err(anyhow!("UpstreamUnavailable"))
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        cooldown: COOLDOWN,
        processing_timeout: Duration::from_secs(30),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        },
    }
}

pub struct Harness<P: UnitProcessor> {
    pub repo: Arc<InMemoryRepository>,
    pub store: Arc<IngestionStore>,
    pub queue: Arc<WorkQueue>,
    pub service: IngestService,
    pub scheduler: Arc<Scheduler<P>>,
    pub counters: Counters,
}

pub fn harness_with<P: UnitProcessor>(processor: P) -> Harness<P> {
    let repo = Arc::new(InMemoryRepository::default());
    let store = Arc::new(IngestionStore::new(repo.clone()));
    let queue = Arc::new(WorkQueue::new());
    let counters = Counters::default();

    let service = IngestService::new(store.clone(), queue.clone(), 3, counters.clone());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        queue.clone(),
        Arc::new(processor),
        scheduler_config(),
        counters.clone(),
    ));

    Harness {
        repo,
        store,
        queue,
        service,
        scheduler,
        counters,
    }
}

pub fn harness() -> Harness<SimulatedProcessor> {
    harness_with(SimulatedProcessor::new(PROCESSING))
}
