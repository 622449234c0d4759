use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;

/// Background task that cancels unpaid orders past their deadline, drops
/// expired sessions and prunes idle notification channels.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        reap_once(&engine, now_ms()).await;
    }
}

/// One sweep. Returns how many orders were expired.
pub async fn reap_once(engine: &Engine, now: Ms) -> usize {
    let mut expired = 0;
    for order_id in engine.collect_expired_orders(now) {
        match engine.expire_order(order_id, now).await {
            Ok(true) => expired += 1,
            Ok(false) => {}
            Err(e) => {
                // Deleted or paid in the meantime.
                debug!("reaper skip {order_id}: {e}");
            }
        }
    }
    let sessions = engine.sweep_sessions(now);
    if sessions > 0 {
        debug!("swept {sessions} expired sessions");
    }
    engine.notify.prune();
    expired
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
