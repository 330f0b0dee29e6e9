use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};
use uuid::Uuid;

use crate::ingestion::model::{
    ItemResult, OverallStatus, Priority, QueueEntry, Request, Unit, UnitStatus,
};
use crate::ingestion::repository::IngestionRepository;
use crate::time::{from_ms, to_ms};

const PROCESSING_KEY: &str = "is_processing";

const UNIT_COLUMNS: &str = r#"
  unit_id, request_id, ids_json, status, priority_rank,
  enqueued_at_ms, seq, attempts,
  started_at_ms, completed_at_ms, result_json, last_error
"#;

/// SQLx-backed implementation of IngestionRepository.
/// Responsible only for persistence and row mapping.
pub struct SqlxIngestionRepository {
    pool: AnyPool,
}

impl SqlxIngestionRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IngestionRepository for SqlxIngestionRepository {
    async fn insert_request(&self, request: &Request) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO ingestion_requests
  (request_id, priority, overall_status, created_at_ms, updated_at_ms)
VALUES (?, ?, ?, ?, ?);
"#,
        )
        .bind(request.request_id.to_string())
        .bind(request.priority.as_str())
        .bind(request.overall_status.as_str())
        .bind(to_ms(&request.created_at))
        .bind(to_ms(&request.updated_at))
        .execute(&mut *tx)
        .await?;

        for (position, u) in request.units.iter().enumerate() {
            let seq = u64_to_i64(u.seq)?;

            sqlx::query(
                r#"
INSERT INTO ingestion_units
  (unit_id, request_id, position, ids_json, status, priority_rank,
   enqueued_at_ms, seq, attempts,
   started_at_ms, completed_at_ms, result_json, last_error)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
"#,
            )
            .bind(u.unit_id.to_string())
            .bind(u.request_id.to_string())
            .bind(position as i64)
            .bind(serde_json::to_string(&u.ids)?)
            .bind(u.status.as_str())
            .bind(u.priority_rank as i64)
            .bind(to_ms(&u.enqueued_at))
            .bind(seq)
            .bind(u.attempts as i64)
            .bind(opt_ms(&u.started_at))
            .bind(opt_ms(&u.completed_at))
            .bind(serde_json::to_string(&u.result)?)
            .bind(u.last_error.clone().unwrap_or_default())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
INSERT INTO queue_entries (unit_id, request_id, priority_rank, enqueued_at_ms, seq)
VALUES (?, ?, ?, ?, ?);
"#,
            )
            .bind(u.unit_id.to_string())
            .bind(u.request_id.to_string())
            .bind(u.priority_rank as i64)
            .bind(to_ms(&u.enqueued_at))
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn fetch_request(&self, request_id: &Uuid) -> anyhow::Result<Option<Request>> {
        let row = sqlx::query(
            r#"
SELECT request_id, priority, overall_status, created_at_ms, updated_at_ms
FROM ingestion_requests
WHERE request_id = ?;
"#,
        )
        .bind(request_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let unit_rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM ingestion_units WHERE request_id = ? ORDER BY position ASC;"
        ))
        .bind(request_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let units = unit_rows
            .iter()
            .map(row_to_unit)
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Some(Request {
            request_id: parse_uuid(&r.get::<String, _>("request_id"))?,
            priority: r
                .get::<String, _>("priority")
                .parse::<Priority>()
                .map_err(|e| anyhow!("{e}"))?,
            overall_status: OverallStatus::parse(&r.get::<String, _>("overall_status"))?,
            units,
            created_at: ms_to_ts(r.get("created_at_ms"))?,
            updated_at: ms_to_ts(r.get("updated_at_ms"))?,
        }))
    }

    async fn fetch_unit(&self, unit_id: &Uuid) -> anyhow::Result<Option<Unit>> {
        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM ingestion_units WHERE unit_id = ?;"
        ))
        .bind(unit_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_unit(&r)?)),
            None => Ok(None),
        }
    }

    async fn fetch_units_in_status(&self, status: UnitStatus) -> anyhow::Result<Vec<Unit>> {
        let rows = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM ingestion_units WHERE status = ? ORDER BY seq ASC;"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_unit(&r) {
                Ok(u) => out.push(u),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the scan
                    tracing::warn!(error = %e, "skipping malformed unit row");
                }
            }
        }
        Ok(out)
    }

    async fn update_unit(&self, unit: &Unit, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
UPDATE ingestion_units
SET status = ?, attempts = ?, started_at_ms = ?, completed_at_ms = ?,
    result_json = ?, last_error = ?
WHERE unit_id = ?;
"#,
        )
        .bind(unit.status.as_str())
        .bind(unit.attempts as i64)
        .bind(opt_ms(&unit.started_at))
        .bind(opt_ms(&unit.completed_at))
        .bind(serde_json::to_string(&unit.result)?)
        .bind(unit.last_error.clone().unwrap_or_default())
        .bind(unit.unit_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(anyhow!("unit not found: {}", unit.unit_id));
        }

        sqlx::query("UPDATE ingestion_requests SET updated_at_ms = ? WHERE request_id = ?;")
            .bind(to_ms(&now))
            .bind(unit.request_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn persist_overall_status(
        &self,
        request_id: &Uuid,
        status: OverallStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE ingestion_requests
SET overall_status = ?, updated_at_ms = ?
WHERE request_id = ?;
"#,
        )
        .bind(status.as_str())
        .bind(to_ms(&now))
        .bind(request_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_queue_entry(&self, unit_id: &Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM queue_entries WHERE unit_id = ?;")
            .bind(unit_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_unit(&self, unit_id: &Uuid, now: DateTime<Utc>) -> anyhow::Result<Option<Unit>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_entries WHERE unit_id = ?;")
            .bind(unit_id.to_string())
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            "SELECT {UNIT_COLUMNS} FROM ingestion_units WHERE unit_id = ?;"
        ))
        .bind(unit_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;

        let mut unit = match row {
            Some(r) => row_to_unit(&r)?,
            None => {
                tx.commit().await?;
                return Ok(None);
            }
        };

        if unit.status != UnitStatus::Pending {
            tx.commit().await?;
            return Ok(None);
        }

        unit.start(now)?;

        sqlx::query(
            r#"
UPDATE ingestion_units
SET status = ?, started_at_ms = ?
WHERE unit_id = ? AND status = ?;
"#,
        )
        .bind(unit.status.as_str())
        .bind(opt_ms(&unit.started_at))
        .bind(unit.unit_id.to_string())
        .bind(UnitStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE ingestion_requests SET updated_at_ms = ? WHERE request_id = ?;")
            .bind(to_ms(&now))
            .bind(unit.request_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(unit))
    }

    async fn requeue_entry(&self, entry: &QueueEntry) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO queue_entries (unit_id, request_id, priority_rank, enqueued_at_ms, seq)
VALUES (?, ?, ?, ?, ?)
ON CONFLICT (unit_id) DO NOTHING;
"#,
        )
        .bind(entry.unit_id.to_string())
        .bind(entry.request_id.to_string())
        .bind(entry.priority_rank as i64)
        .bind(to_ms(&entry.enqueued_at))
        .bind(u64_to_i64(entry.seq)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_queue_entries(&self) -> anyhow::Result<Vec<QueueEntry>> {
        let rows = sqlx::query(
            r#"
SELECT unit_id, request_id, priority_rank, enqueued_at_ms, seq
FROM queue_entries
ORDER BY priority_rank DESC, enqueued_at_ms ASC, seq ASC;
"#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                Ok(QueueEntry {
                    unit_id: parse_uuid(&r.get::<String, _>("unit_id"))?,
                    request_id: parse_uuid(&r.get::<String, _>("request_id"))?,
                    priority_rank: i64_to_u8(r.get("priority_rank"))?,
                    enqueued_at: ms_to_ts(r.get("enqueued_at_ms"))?,
                    seq: i64_to_u64(r.get("seq"))?,
                })
            })
            .collect()
    }

    async fn set_processing_flag(&self, value: bool, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
INSERT INTO processing_state (state_key, value, updated_at_ms)
VALUES (?, ?, ?)
ON CONFLICT (state_key) DO UPDATE
SET value = excluded.value, updated_at_ms = excluded.updated_at_ms;
"#,
        )
        .bind(PROCESSING_KEY)
        .bind(value as i64)
        .bind(to_ms(&now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_processing_flag(&self) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT value FROM processing_state WHERE state_key = ?;")
            .bind(PROCESSING_KEY)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some_and(|r| r.get::<i64, _>("value") == 1))
    }
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_unit(r: &sqlx::any::AnyRow) -> anyhow::Result<Unit> {
    let ids: Vec<i64> =
        serde_json::from_str(&r.get::<String, _>("ids_json")).context("invalid ids_json")?;
    let result: Vec<ItemResult> =
        serde_json::from_str(&r.get::<String, _>("result_json")).context("invalid result_json")?;
    let last_error: String = r.get("last_error");

    Ok(Unit {
        unit_id: parse_uuid(&r.get::<String, _>("unit_id"))?,
        request_id: parse_uuid(&r.get::<String, _>("request_id"))?,
        ids,
        status: UnitStatus::parse(&r.get::<String, _>("status"))?,
        priority_rank: i64_to_u8(r.get("priority_rank"))?,
        enqueued_at: ms_to_ts(r.get("enqueued_at_ms"))?,
        seq: i64_to_u64(r.get("seq"))?,
        attempts: i64_to_u32(r.get("attempts"))?,
        started_at: ms_to_opt_ts(r.get("started_at_ms"))?,
        completed_at: ms_to_opt_ts(r.get("completed_at_ms"))?,
        result,
        last_error: (!last_error.is_empty()).then_some(last_error),
    })
}

fn parse_uuid(s: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("invalid uuid: {s}"))
}

/* =========================
Numeric safety helpers
========================= */

/// Unset timestamps are stored as 0.
fn opt_ms(ts: &Option<DateTime<Utc>>) -> i64 {
    ts.as_ref().map(to_ms).unwrap_or(0)
}

fn ms_to_ts(v: i64) -> anyhow::Result<DateTime<Utc>> {
    from_ms(v).ok_or_else(|| anyhow!("timestamp out of range: {v}"))
}

fn ms_to_opt_ts(v: i64) -> anyhow::Result<Option<DateTime<Utc>>> {
    if v == 0 {
        return Ok(None);
    }
    ms_to_ts(v).map(Some)
}

fn i64_to_u8(v: i64) -> anyhow::Result<u8> {
    u8::try_from(v).map_err(|_| anyhow!("out of range for u8: {v}"))
}

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    u32::try_from(v).map_err(|_| anyhow!("out of range for u32: {v}"))
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}
