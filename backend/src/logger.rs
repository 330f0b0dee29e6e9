use std::time::Duration;
use tracing::{Span, field};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        // Includes timing when the span closes
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty())
            .init();
    }
}

/// Records the unit being worked on the current span.
///
/// The span must declare `request_id` and `unit_id` as `field::Empty`.
pub fn annotate_span(request_id: &Uuid, unit_id: &Uuid) {
    let span = Span::current();
    span.record("request_id", field::display(request_id));
    span.record("unit_id", field::display(unit_id));
}

pub async fn warn_if_slow<F, T>(label: &'static str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            label = label,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow operation detected"
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn warn_if_slow_reports_slow_futures() {
        let out = warn_if_slow("sleepy", Duration::from_millis(1), async {
            std::thread::sleep(Duration::from_millis(5));
            42
        })
        .await;

        assert_eq!(out, 42);
        assert!(logs_contain("slow operation detected"));
    }

    #[tokio::test]
    #[traced_test]
    async fn warn_if_slow_is_quiet_for_fast_futures() {
        let out = warn_if_slow("quick", Duration::from_secs(5), async { "ok" }).await;

        assert_eq!(out, "ok");
        assert!(!logs_contain("slow operation detected"));
    }
}
