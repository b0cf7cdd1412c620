//! Service Registry Client
//!
//! Membership lives in etcd. A storage node announces itself by
//! writing `/services/<service>/<uuid> = host:port` bound to a short
//! lease and heartbeating that lease from a background task; if the
//! process dies, the lease expires and the key vanishes on its own.
//!
//! Consumers call [`Watcher::spawn`] with a prefix and a handler: the
//! handler first sees an add for every existing entry, then a live
//! stream of puts and deletes. On a broken watch the loop reconnects
//! with doubling backoff and re-snapshots, so handlers must treat a
//! repeated add for a known key as a no-op.

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lease TTL for self-registration. Short enough that a dead node
/// disappears quickly, long enough to ride out a heartbeat hiccup.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Consecutive heartbeat failures tolerated before the registration
/// is declared lost.
const MAX_KEEPALIVE_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
}

/// Key prefix for all instances of a service.
pub fn service_prefix(service: &str) -> String {
    format!("/services/{service}/")
}

/// Connects to the etcd cluster.
pub async fn connect(endpoints: &[String]) -> Result<Client, RegistryError> {
    let client = Client::connect(endpoints, None).await?;
    debug!(?endpoints, "connected to registry");
    Ok(client)
}

/// A live self-registration: a leased key plus its heartbeat task.
pub struct Registration {
    client: Client,
    key: String,
    lease_id: i64,
    lost_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl Registration {
    /// Registers `addr` under the service prefix with a fresh uuid
    /// and starts the keepalive heartbeat.
    pub async fn register(
        client: &Client,
        service: &str,
        addr: &str,
        ttl: Duration,
    ) -> Result<Self, RegistryError> {
        let mut client = client.clone();

        let lease = client.lease_grant(ttl.as_secs() as i64, None).await?;
        let lease_id = lease.id();

        let key = format!("{}{}", service_prefix(service), Uuid::new_v4());
        client
            .put(
                key.clone(),
                addr,
                Some(PutOptions::new().with_lease(lease_id)),
            )
            .await?;
        info!(key = %key, addr, lease_id, "registered in service registry");

        let (lost_tx, lost_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(keepalive_loop(
            client.clone(),
            lease_id,
            ttl,
            lost_tx,
            shutdown_rx,
        ));

        Ok(Self {
            client,
            key,
            lease_id,
            lost_rx,
            shutdown_tx,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Resolves if the heartbeat gives up and the registration is
    /// gone for good. The node treats this as fatal.
    pub async fn lost(&self) {
        let mut rx = self.lost_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Graceful exit: stop the heartbeat, revoke the lease, remove
    /// the key. After this the watchers see a delete immediately
    /// instead of waiting out the TTL.
    pub async fn deregister(mut self) -> Result<(), RegistryError> {
        let _ = self.shutdown_tx.send(true);
        self.client.lease_revoke(self.lease_id).await?;
        // Revoking the lease already deletes the key; this is only a
        // belt against a lease that somehow detached.
        let _ = self.client.delete(self.key.clone(), None).await;
        info!(key = %self.key, "deregistered");
        Ok(())
    }
}

async fn keepalive_loop(
    mut client: Client,
    lease_id: i64,
    ttl: Duration,
    lost_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = (ttl / 3).max(Duration::from_secs(1));
    let mut failures = 0u32;

    'reconnect: loop {
        let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                failures += 1;
                warn!(lease_id, failures, error = %e, "keepalive stream failed");
                if failures >= MAX_KEEPALIVE_FAILURES {
                    break 'reconnect;
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => continue 'reconnect,
                    _ = shutdown_rx.changed() => return,
                }
            }
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => return,
            }

            let beat = async {
                keeper.keep_alive().await?;
                stream.message().await
            };
            match beat.await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    failures = 0;
                }
                Ok(_) => {
                    // The server answered but the lease is gone.
                    warn!(lease_id, "lease expired on the registry side");
                    break 'reconnect;
                }
                Err(e) => {
                    failures += 1;
                    warn!(lease_id, failures, error = %e, "keepalive heartbeat failed");
                    if failures >= MAX_KEEPALIVE_FAILURES {
                        break 'reconnect;
                    }
                    continue 'reconnect;
                }
            }
        }
    }

    let _ = lost_tx.send(true);
}

/// Receives membership changes under a watched prefix.
///
/// Calls arrive serially, in registry order. `on_add` may repeat for
/// a key after a reconnect re-snapshot; implementations must be
/// idempotent.
#[async_trait]
pub trait WatchHandler: Send + Sync {
    async fn on_add(&self, key: &str, value: &str);
    async fn on_remove(&self, key: &str, value: &str);
}

/// Handle to a running prefix watch. Dropping it stops the task.
pub struct Watcher {
    shutdown_tx: watch::Sender<bool>,
}

impl Watcher {
    pub fn spawn(client: Client, prefix: String, handler: Arc<dyn WatchHandler>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(watch_loop(client, prefix, handler, shutdown_rx));
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

enum WatchExit {
    Shutdown,
    Disconnected,
}

async fn watch_loop(
    mut client: Client,
    prefix: String,
    handler: Arc<dyn WatchHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match watch_once(&mut client, &prefix, &handler, &mut shutdown_rx).await {
            Ok(WatchExit::Shutdown) => return,
            Ok(WatchExit::Disconnected) => {
                warn!(prefix = %prefix, "registry watch stream ended, reconnecting");
            }
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "registry watch failed, reconnecting");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// One snapshot-then-stream cycle.
async fn watch_once(
    client: &mut Client,
    prefix: &str,
    handler: &Arc<dyn WatchHandler>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<WatchExit, etcd_client::Error> {
    // Snapshot first: the handler sees every existing member.
    let snapshot = client
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await?;
    for kv in snapshot.kvs() {
        handler.on_add(kv.key_str()?, kv.value_str()?).await;
    }

    // Watch from just past the snapshot revision so no event falls
    // into the gap between the two calls.
    let revision = snapshot.header().map(|h| h.revision() + 1).unwrap_or(0);
    let options = WatchOptions::new()
        .with_prefix()
        .with_prev_key()
        .with_start_revision(revision);
    let (mut watcher, mut stream) = client.watch(prefix, Some(options)).await?;
    debug!(prefix, revision, "registry watch established");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = watcher.cancel().await;
                return Ok(WatchExit::Shutdown);
            }
            message = stream.message() => {
                let Some(response) = message? else {
                    return Ok(WatchExit::Disconnected);
                };
                for event in response.events() {
                    let Some(kv) = event.kv() else { continue };
                    match event.event_type() {
                        EventType::Put => {
                            handler.on_add(kv.key_str()?, kv.value_str()?).await;
                        }
                        EventType::Delete => {
                            // A deleted kv carries no value; the
                            // previous revision does.
                            let value = match event.prev_kv() {
                                Some(prev) => prev.value_str()?.to_string(),
                                None => String::new(),
                            };
                            handler.on_remove(kv.key_str()?, &value).await;
                        }
                    }
                }
            }
        }
    }
}
