use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IngestError;

/// Client-facing priority of a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Queue rank; larger is served first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }
}

impl FromStr for Priority {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HIGH" => Ok(Priority::High),
            "MEDIUM" => Ok(Priority::Medium),
            "LOW" => Ok(Priority::Low),
            other => Err(IngestError::InvalidPriority(other.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single unit. Only moves forward:
/// PENDING -> IN_FLIGHT -> DONE | FAILED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Pending => "PENDING",
            UnitStatus::InFlight => "IN_FLIGHT",
            UnitStatus::Done => "DONE",
            UnitStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "PENDING" => UnitStatus::Pending,
            "IN_FLIGHT" => UnitStatus::InFlight,
            "DONE" => UnitStatus::Done,
            "FAILED" => UnitStatus::Failed,
            other => bail!("unknown unit status: {other}"),
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Failed)
    }

    pub fn can_advance_to(self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (UnitStatus::Pending, UnitStatus::InFlight)
                | (UnitStatus::InFlight, UnitStatus::Done)
                | (UnitStatus::InFlight, UnitStatus::Failed)
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request-level status derived from unit statuses by the aggregator.
/// Only moves forward: NOT_STARTED -> TRIGGERED -> COMPLETED | FAILED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    NotStarted,
    Triggered,
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::NotStarted => "NOT_STARTED",
            OverallStatus::Triggered => "TRIGGERED",
            OverallStatus::Completed => "COMPLETED",
            OverallStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "NOT_STARTED" => OverallStatus::NotStarted,
            "TRIGGERED" => OverallStatus::Triggered,
            "COMPLETED" => OverallStatus::Completed,
            "FAILED" => OverallStatus::Failed,
            other => bail!("unknown overall status: {other}"),
        })
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque per-identifier output of the processing collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub id: i64,
    pub data: String,
}

/// One bounded chunk of a request's identifiers; the scheduling granule.
#[derive(Clone, Debug)]
pub struct Unit {
    pub unit_id: Uuid,
    /// Non-owning back-reference to the parent request.
    pub request_id: Uuid,
    pub ids: Vec<i64>,
    pub status: UnitStatus,
    /// Copied from the parent's priority at creation; immutable.
    pub priority_rank: u8,
    pub enqueued_at: DateTime<Utc>,
    /// Monotonic enqueue sequence; final queue tie-break.
    pub seq: u64,

    /// Processing attempts made so far (retries included).
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// One entry per identifier once DONE.
    pub result: Vec<ItemResult>,
    /// Normalized reason once FAILED.
    pub last_error: Option<String>,
}

impl Unit {
    pub fn new(
        request_id: Uuid,
        ids: Vec<i64>,
        priority: Priority,
        enqueued_at: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            unit_id: Uuid::new_v4(),
            request_id,
            ids,
            status: UnitStatus::Pending,
            priority_rank: priority.rank(),
            enqueued_at,
            seq,
            attempts: 0,
            started_at: None,
            completed_at: None,
            result: Vec::new(),
            last_error: None,
        }
    }

    pub fn queue_entry(&self) -> QueueEntry {
        QueueEntry {
            unit_id: self.unit_id,
            request_id: self.request_id,
            priority_rank: self.priority_rank,
            enqueued_at: self.enqueued_at,
            seq: self.seq,
        }
    }

    /// PENDING -> IN_FLIGHT.
    pub fn start(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.advance(UnitStatus::InFlight)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// IN_FLIGHT -> DONE, attaching the processing output.
    pub fn complete(&mut self, result: Vec<ItemResult>, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.advance(UnitStatus::Done)?;
        self.result = result;
        self.completed_at = Some(now);
        Ok(())
    }

    /// IN_FLIGHT -> FAILED.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.advance(UnitStatus::Failed)?;
        self.last_error = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn advance(&mut self, next: UnitStatus) -> anyhow::Result<()> {
        if !self.status.can_advance_to(next) {
            bail!(
                "illegal transition {} -> {} for unit {}",
                self.status,
                next,
                self.unit_id
            );
        }
        self.status = next;
        Ok(())
    }
}

/// Scheduling projection of a unit; the queue only ever orders these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub unit_id: Uuid,
    pub request_id: Uuid,
    pub priority_rank: u8,
    pub enqueued_at: DateTime<Utc>,
    pub seq: u64,
}

/// One client submission and all of its units.
#[derive(Clone, Debug)]
pub struct Request {
    pub request_id: Uuid,
    pub priority: Priority,
    pub overall_status: OverallStatus,
    /// Creation order; concatenated `ids` equal the submitted sequence.
    pub units: Vec<Unit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read model returned by status lookups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    pub request_id: Uuid,
    pub overall_status: OverallStatus,
    pub units: Vec<UnitView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitView {
    pub unit_id: Uuid,
    pub ids: Vec<i64>,
    pub status: UnitStatus,
}

impl From<&Request> for RequestStatus {
    fn from(r: &Request) -> Self {
        Self {
            request_id: r.request_id,
            overall_status: r.overall_status,
            units: r
                .units
                .iter()
                .map(|u| UnitView {
                    unit_id: u.unit_id,
                    ids: u.ids.clone(),
                    status: u.status,
                })
                .collect(),
        }
    }
}
