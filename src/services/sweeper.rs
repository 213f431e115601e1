//! Background eviction of expired uploads.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::chunk_store::ChunkStore;

/// Spawn the periodic sweep. Each tick evicts every upload whose last write
/// is older than the expiration horizon, chunks included.
pub fn spawn(
    store: Arc<dyn ChunkStore>,
    period: Duration,
    expiration: chrono::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - expiration;
            match store.expire_files(cutoff).await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "expired uploads removed"),
                Err(err) => warn!(error = %err, "expiration sweep failed"),
            }
        }
    })
}
