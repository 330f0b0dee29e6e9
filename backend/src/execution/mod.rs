//! Runs a unit through the processing collaborator.
//!
//! Each attempt is bounded by a timeout; a timeout counts as a failed attempt.
//! Failed attempts are retried with exponential backoff until the policy's
//! attempt budget is spent. The unit stays IN_FLIGHT throughout; deciding
//! DONE vs FAILED is the scheduler's job.

pub mod processor;

use std::time::Duration;

use anyhow::anyhow;
use tracing::warn;

use crate::ingestion::model::{ItemResult, Unit};
use crate::metrics::counters::Counters;
use processor::UnitProcessor;

/// Backoff growth stops at this multiple of the initial delay.
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Bound on persisted error strings.
const MAX_ERROR_LEN: usize = 160;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. 0 is treated as 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32
            .checked_shl(exp)
            .unwrap_or(u32::MAX)
            .min(MAX_BACKOFF_FACTOR);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Processes `unit`, retrying per `policy`. Increments `unit.attempts` once
/// per attempt.
pub async fn execute_with_retry<P>(
    processor: &P,
    unit: &mut Unit,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    counters: &Counters,
) -> anyhow::Result<Vec<ItemResult>>
where
    P: UnitProcessor + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);

    loop {
        unit.attempts += 1;

        let outcome = match tokio::time::timeout(attempt_timeout, processor.process(unit)).await {
            Ok(res) => res.and_then(|results| check_results(unit, results)),
            Err(_) => Err(anyhow!(
                "ProcessingTimeout: no response within {}ms",
                attempt_timeout.as_millis()
            )),
        };

        match outcome {
            Ok(results) => return Ok(results),
            Err(e) if unit.attempts < max_attempts => {
                let delay = policy.backoff_after(unit.attempts);
                warn!(
                    unit_id = %unit.unit_id,
                    attempt = unit.attempts,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "processing attempt failed; retrying"
                );
                Counters::bump(&counters.retries);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e.context(format!("giving up after {} attempt(s)", unit.attempts)));
            }
        }
    }
}

/// One result per identifier, in order.
fn check_results(unit: &Unit, results: Vec<ItemResult>) -> anyhow::Result<Vec<ItemResult>> {
    let matches = results.len() == unit.ids.len()
        && results.iter().zip(&unit.ids).all(|(r, id)| r.id == *id);

    if !matches {
        return Err(anyhow!(
            "ResultMismatch: expected {} results for ids {:?}, got {}",
            unit.ids.len(),
            unit.ids,
            results.len()
        ));
    }
    Ok(results)
}

/// Normalizes processing errors into stable bounded strings.
pub fn classify_error(e: &anyhow::Error) -> String {
    let s = format!("{e:#}");
    if s.contains("ProcessingTimeout") {
        return "ProcessingTimeout".into();
    }
    if s.contains("ResultMismatch") {
        return "ResultMismatch".into();
    }

    if s.chars().count() > MAX_ERROR_LEN {
        format!("ERR:{}", s.chars().take(MAX_ERROR_LEN).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    use crate::ingestion::model::Priority;
    use crate::time::now;

    struct FlakyProcessor {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl UnitProcessor for FlakyProcessor {
        async fn process(&self, unit: &Unit) -> anyhow::Result<Vec<ItemResult>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(anyhow!("UpstreamUnavailable (call {n})"));
            }
            Ok(unit
                .ids
                .iter()
                .map(|&id| ItemResult {
                    id,
                    data: "ok".into(),
                })
                .collect())
        }
    }

    struct HangingProcessor;

    #[async_trait]
    impl UnitProcessor for HangingProcessor {
        async fn process(&self, _: &Unit) -> anyhow::Result<Vec<ItemResult>> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct ShortProcessor;

    #[async_trait]
    impl UnitProcessor for ShortProcessor {
        async fn process(&self, _: &Unit) -> anyhow::Result<Vec<ItemResult>> {
            Ok(vec![])
        }
    }

    fn mk_unit() -> Unit {
        Unit::new(Uuid::new_v4(), vec![1, 2, 3], Priority::Medium, now(), 0)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = policy(10);
        assert_eq!(p.backoff_after(1), Duration::from_millis(100));
        assert_eq!(p.backoff_after(2), Duration::from_millis(200));
        assert_eq!(p.backoff_after(3), Duration::from_millis(400));
        assert_eq!(p.backoff_after(4), Duration::from_millis(800));
        assert_eq!(p.backoff_after(5), Duration::from_millis(800));
        assert_eq!(p.backoff_after(u32::MAX), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_attempt_budget() {
        let proc = FlakyProcessor {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let counters = Counters::default();
        let mut unit = mk_unit();

        let out = execute_with_retry(&proc, &mut unit, &policy(3), Duration::from_secs(5), &counters)
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(unit.attempts, 3);
        assert_eq!(Counters::get(&counters.retries), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let proc = FlakyProcessor {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let counters = Counters::default();
        let mut unit = mk_unit();

        let err = execute_with_retry(&proc, &mut unit, &policy(2), Duration::from_secs(5), &counters)
            .await
            .unwrap_err();

        assert_eq!(unit.attempts, 2);
        assert_eq!(proc.calls.load(Ordering::SeqCst), 2);
        let msg = format!("{err:#}");
        assert!(msg.contains("giving up after 2 attempt(s)"), "{msg}");
        assert!(msg.contains("UpstreamUnavailable"), "{msg}");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let counters = Counters::default();
        let mut unit = mk_unit();

        let err = execute_with_retry(
            &HangingProcessor,
            &mut unit,
            &policy(1),
            Duration::from_secs(2),
            &counters,
        )
        .await
        .unwrap_err();

        assert_eq!(classify_error(&err), "ProcessingTimeout");
    }

    #[tokio::test]
    async fn short_result_set_is_rejected() {
        let counters = Counters::default();
        let mut unit = mk_unit();

        let err = execute_with_retry(
            &ShortProcessor,
            &mut unit,
            &policy(1),
            Duration::from_secs(2),
            &counters,
        )
        .await
        .unwrap_err();

        assert_eq!(classify_error(&err), "ResultMismatch");
    }

    #[test]
    fn classify_error_bounds_length() {
        let long = anyhow!("{}", "x".repeat(500));
        let s = classify_error(&long);
        assert!(s.starts_with("ERR:"));
        assert_eq!(s.chars().count(), 4 + MAX_ERROR_LEN);
    }
}
