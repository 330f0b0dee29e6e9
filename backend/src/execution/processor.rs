use std::time::Duration;

use async_trait::async_trait;

use crate::ingestion::model::{ItemResult, Unit};

/// Abstraction over the external processing call for one unit.
///
/// Implementations return exactly one `ItemResult` per identifier, in
/// the unit's order, or an error describing why the unit failed.
#[async_trait]
pub trait UnitProcessor: Send + Sync + 'static {
    async fn process(&self, unit: &Unit) -> anyhow::Result<Vec<ItemResult>>;
}

/// Stand-in for the external API: waits a fixed latency, then reports every
/// identifier as processed.
#[derive(Clone, Debug)]
pub struct SimulatedProcessor {
    latency: Duration,
}

impl SimulatedProcessor {
    pub const PROCESSED: &'static str = "processed";

    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl UnitProcessor for SimulatedProcessor {
    async fn process(&self, unit: &Unit) -> anyhow::Result<Vec<ItemResult>> {
        tokio::time::sleep(self.latency).await;

        Ok(unit
            .ids
            .iter()
            .map(|&id| ItemResult {
                id,
                data: Self::PROCESSED.to_string(),
            })
            .collect())
    }
}
