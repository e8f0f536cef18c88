//! In-process periodic update driver.
//!
//! Calls [`BundleEngine::update_all`] on a fixed interval until the shutdown
//! token fires.  Per-route failures are already logged by the engine; a failed
//! tick (for example an unreadable registry) is logged here and the loop
//! carries on.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::engine::{BundleEngine, UpdateSummary};

/// Run update cycles every `interval` until `shutdown` is cancelled.
///
/// The first cycle starts immediately.  An in-flight cycle is abandoned on
/// shutdown; the route locks it held are released as its futures drop.
pub async fn run(engine: Arc<BundleEngine>, interval: Duration, shutdown: CancellationToken) {
    info!(interval_secs = interval.as_secs(), "bundle scheduler started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = tick(&engine) => {}
        }
    }

    info!("bundle scheduler stopped");
}

#[instrument(skip(engine))]
async fn tick(engine: &BundleEngine) -> Option<UpdateSummary> {
    match engine.update_all().await {
        Ok(summary) => {
            info!(
                created = summary.created,
                unchanged = summary.unchanged,
                skipped = summary.skipped,
                failed = summary.failed,
                "scheduled update cycle finished"
            );
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "scheduled update cycle failed");
            None
        }
    }
}
