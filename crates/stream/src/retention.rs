//! Background retention sweeper.
//!
//! One loop per server instance periodically asks the store to delete
//! expired streams and prune records past the retention horizon. Expiry is
//! also enforced lazily on access, so the sweep period only bounds how long
//! dead state lingers on disk, not how long it stays visible.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::store::StreamStore;

/// Spawn the retention sweep loop. Aborting the handle stops the loop; a
/// sweep already holding a stream lock finishes first.
pub fn spawn_retention_sweeper(store: Arc<StreamStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup is quiet.
        interval.tick().await;

        loop {
            interval.tick().await;
            debug!("running retention sweep");
            store.sweep();
        }
    })
}
