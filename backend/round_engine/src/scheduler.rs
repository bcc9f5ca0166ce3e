//! Background maintenance loop: retire expired rounds and keep matching
//! figures of active QF rounds fresh.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::caps::now;
use crate::engine::Engine;
use crate::errors::Result;

/// Run forever, ticking every `interval`.
pub async fn run(engine: Arc<Engine>, interval: Duration) {
    info!("Scheduler starting, interval {interval:?}");

    loop {
        if let Err(e) = tick(&engine, now()).await {
            error!("Scheduler tick error: {e}");
        }
        tokio::time::sleep(interval).await;
    }
}

/// One maintenance pass at `now`.  A failing round does not stop the others.
///
/// Returns `(deactivated round ids, rounds whose matching was refreshed)`.
pub async fn tick(engine: &Engine, now: i64) -> Result<(Vec<i64>, usize)> {
    let deactivated = engine.deactivate_expired_rounds(now).await?;

    let mut refreshed = 0;
    for round in engine.active_qf_rounds().await? {
        match engine.recompute_matching(round.id).await {
            Ok(_) => refreshed += 1,
            Err(e) => error!("Matching refresh of round {} failed: {e}", round.id),
        }
    }
    Ok((deactivated, refreshed))
}
