use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::model::Ms;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Background task that keeps time-driven state moving: lapsed holds are
/// released and their pending bookings failed, elapsed stays complete, and
/// processed-event records past retention are pruned.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let now = now_ms();

        let failed = engine.expire_overdue(now).await;
        for booking_id in &failed {
            info!("reaped overdue pending booking {booking_id}");
        }

        let completed = engine.complete_elapsed(now).await;
        for booking_id in &completed {
            info!("completed elapsed booking {booking_id}");
        }

        let pruned = engine.prune_processed_events(now);
        if pruned > 0 {
            debug!("pruned {pruned} processed webhook events past retention");
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_append_count().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => debug!("WAL compaction skipped: {e}"),
        }
    }
}
