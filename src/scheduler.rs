use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use tracing::{error, info};

use crate::engine::{retention_cutoff, Engine, EngineError};

/// Expire every penalty older than the retention window as of `now`.
/// Safe to call any number of times; a repeat run finds nothing to remove.
pub async fn run_expiry(engine: &Engine, now: NaiveDateTime) -> Result<usize, EngineError> {
    engine.expire_penalties_older_than(retention_cutoff(now)).await
}

/// Next instant strictly after `now` whose wall-clock time is `hour:00`.
pub fn next_run_after(now: NaiveDateTime, hour: u32) -> NaiveDateTime {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Background task: run penalty expiry once a day at `hour` local time.
/// A failed run is logged and retried at the next tick.
pub async fn run_expiry_scheduler(engine: Arc<Engine>, hour: u32) {
    loop {
        let now = Local::now().naive_local();
        let next = next_run_after(now, hour);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        info!(%next, "next penalty expiry run");
        tokio::time::sleep(wait).await;

        let now = Local::now().naive_local();
        match run_expiry(&engine, now).await {
            Ok(removed) => {
                metrics::counter!(crate::observability::EXPIRY_RUNS_TOTAL, "status" => "ok").increment(1);
                info!(removed, "penalty expiry run finished");
            }
            Err(e) => {
                metrics::counter!(crate::observability::EXPIRY_RUNS_TOTAL, "status" => "error").increment(1);
                error!("penalty expiry run failed: {e}");
            }
        }
    }
}

/// Background task: compact the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "journal compacted"),
            Err(e) => error!("journal compaction failed: {e}"),
        }
    }
}
