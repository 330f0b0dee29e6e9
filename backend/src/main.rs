use std::sync::Arc;

use ingest_backend::{
    aggregator::StatusAggregator,
    config::AppConfig,
    db::Db,
    error::IngestError,
    execution::processor::SimulatedProcessor,
    ingestion::model::Priority,
    ingestion::recovery::recover_after_restart,
    ingestion::repository_sqlx::SqlxIngestionRepository,
    ingestion::store::IngestionStore,
    intake::IngestService,
    logger::init_tracing,
    metrics::counters::Counters,
    scheduler::queue::WorkQueue,
    scheduler::scheduler::{Scheduler, SchedulerHandle},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

/// Initializes DB, runs migrations, constructs repository/store.
async fn init_store(cfg: &AppConfig) -> anyhow::Result<Arc<IngestionStore>> {
    let db = Db::connect(&cfg.database_url).await?;
    db.migrate().await?;

    let repo = Arc::new(SqlxIngestionRepository::new(db.pool.clone()));
    Ok(Arc::new(IngestionStore::new(repo)))
}

/// Restores the queue from the DB and starts the worker loop.
async fn start_scheduler(
    store: Arc<IngestionStore>,
    queue: Arc<WorkQueue>,
    cfg: &AppConfig,
    counters: Counters,
) -> anyhow::Result<SchedulerHandle> {
    // Safety: fail units stranded IN_FLIGHT and reload pending work on restart.
    recover_after_restart(&store, &queue, &StatusAggregator::new(store.clone())).await?;

    let processor = Arc::new(SimulatedProcessor::new(cfg.processing_time));
    let scheduler = Arc::new(Scheduler::new(
        store,
        queue,
        processor,
        cfg.scheduler_config(),
        counters,
    ));

    Ok(scheduler.spawn())
}

/// Line-oriented intake on stdin:
///   submit <HIGH|MEDIUM|LOW> <id> [<id> ...]
///   status <request_id>
async fn handle_line(service: &IngestService, line: &str) -> Result<String, IngestError> {
    let mut parts = line.split_whitespace();

    match parts.next() {
        Some("submit") => {
            let priority: Priority = parts.next().unwrap_or_default().parse()?;
            let ids = parts
                .map(|p| {
                    p.trim_matches(',')
                        .parse::<i64>()
                        .map_err(|_| IngestError::InvalidInput(format!("not an integer: {p}")))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let request_id = service.submit(&ids, priority).await?;
            Ok(serde_json::json!({ "request_id": request_id }).to_string())
        }
        Some("status") => {
            let raw = parts.next().unwrap_or_default();
            let request_id = Uuid::parse_str(raw)
                .map_err(|_| IngestError::InvalidInput(format!("not a request id: {raw}")))?;

            let status = service.get_status(&request_id).await?;
            serde_json::to_string(&status).map_err(|e| IngestError::Storage(e.into()))
        }
        _ => Err(IngestError::InvalidInput(
            "expected `submit <PRIORITY> <ids...>` or `status <request_id>`".into(),
        )),
    }
}

async fn run_stdin_intake(service: IngestService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match handle_line(&service, &line).await {
            Ok(out) => println!("{out}"),
            Err(e) => {
                if !e.is_client_error() {
                    tracing::error!(error = ?e, "intake command failed");
                }
                println!("{}", serde_json::json!({ "error": e.to_string() }));
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting ingestion backend...");

    let cfg = AppConfig::from_env();
    let counters = Counters::default();

    let store = init_store(&cfg).await?;
    let queue = Arc::new(WorkQueue::new());

    let scheduler = start_scheduler(store.clone(), queue.clone(), &cfg, counters.clone()).await?;

    let service = IngestService::new(store, queue, cfg.batch_size, counters);

    tokio::select! {
        res = run_stdin_intake(service) => {
            if let Err(e) = res {
                tracing::error!(error = ?e, "stdin intake stopped");
            }
            // Keep draining queued work after stdin closes.
            tokio::signal::ctrl_c().await?;
        }
        res = tokio::signal::ctrl_c() => res?,
    }
    tracing::info!("Shutdown signal received");

    scheduler.shutdown().await?;

    Ok(())
}
