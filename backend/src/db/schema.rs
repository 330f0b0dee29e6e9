use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Requests
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS ingestion_requests (
  request_id TEXT PRIMARY KEY,
  priority TEXT NOT NULL CHECK (priority IN ('HIGH','MEDIUM','LOW')),
  overall_status TEXT NOT NULL,
  created_at_ms BIGINT NOT NULL,
  updated_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Units
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS ingestion_units (
  unit_id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL,
  position BIGINT NOT NULL,
  ids_json TEXT NOT NULL,
  status TEXT NOT NULL,
  priority_rank BIGINT NOT NULL,
  enqueued_at_ms BIGINT NOT NULL,
  seq BIGINT NOT NULL,
  attempts BIGINT NOT NULL DEFAULT 0,
  started_at_ms BIGINT NOT NULL DEFAULT 0,
  completed_at_ms BIGINT NOT NULL DEFAULT 0,
  result_json TEXT NOT NULL DEFAULT '[]',
  last_error TEXT NOT NULL DEFAULT ''
);
"#,
    )
    .execute(pool)
    .await?;

    // Queue projection of PENDING units
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS queue_entries (
  unit_id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL,
  priority_rank BIGINT NOT NULL,
  enqueued_at_ms BIGINT NOT NULL,
  seq BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Singleton processing flag
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS processing_state (
  state_key TEXT PRIMARY KEY,
  value INTEGER NOT NULL CHECK (value IN (0,1)),
  updated_at_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_units_request ON ingestion_units(request_id);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_units_status ON ingestion_units(status);"#)
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
CREATE INDEX IF NOT EXISTS idx_queue_order
ON queue_entries(priority_rank DESC, enqueued_at_ms ASC, seq ASC);
"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
