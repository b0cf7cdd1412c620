//! Background Cleanup Sweeper
//!
//! Lazy expiry only reclaims keys that get read again. The sweeper
//! covers the rest: a tokio task that wakes on a fixed interval and
//! scans a bounded window of shards, so one tick never stalls the
//! whole store behind write locks.

use crate::storage::engine::{ShardedStore, SHARD_COUNT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Sweeper tuning knobs.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// How many shards one tick may visit.
    pub shards_per_tick: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            shards_per_tick: 32,
        }
    }
}

/// Handle to the running sweeper task.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl Sweeper {
    /// Starts the sweeper over `store` as a background task.
    pub fn start(store: Arc<ShardedStore>, config: SweeperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweep_loop(store, config, shutdown_rx));
        info!("cleanup sweeper started");

        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep_loop(
    store: Arc<ShardedStore>,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut cursor = 0usize;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("cleanup sweeper stopping");
                    return;
                }
            }
        }

        let reclaimed = store.cleanup_expired(cursor, config.shards_per_tick);
        cursor = (cursor + config.shards_per_tick) % SHARD_COUNT;

        if reclaimed > 0 {
            debug!(reclaimed, remaining = store.len(), "expired keys reclaimed");
        }
    }
}
