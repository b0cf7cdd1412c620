//! Routing Client
//!
//! The client side of the cluster: a pool of persistent connections,
//! one per live storage node, kept in sync with the service registry,
//! plus the consistent-hash ring that gives keys an affinity node.
//!
//! Dispatch picks a node by [`Policy`]:
//! - `RoundRobin` spreads load evenly when any node will do;
//! - `KeyHash` routes through the ring so one key keeps hitting the
//!   node that owns it.
//!
//! Failed calls surface unchanged. Retrying is the caller's decision,
//! not this layer's; a dispatch that raced a node removal simply
//! comes back as a transport error.

mod conn;

pub use conn::NodeConn;

use crate::protocol::{FrameError, Request, Response};
use crate::registry::{self, WatchHandler, Watcher};
use crate::ring::HashRing;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Per-operation deadlines. Writes get the most room; deletes are
/// small and urgent.
pub const SET_TIMEOUT: Duration = Duration::from_secs(15);
pub const GET_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEL_TIMEOUT: Duration = Duration::from_secs(2);

/// How dispatch elects a target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    /// Atomic-counter rotation over the live nodes.
    #[default]
    RoundRobin,
    /// Consistent-hash by key.
    KeyHash,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no available nodes")]
    NoAvailableNodes,

    #[error("transport error to {addr}: {source}")]
    Transport {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("request to {addr} timed out after {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("node reported: {0}")]
    Node(String),

    #[error("node sent a mismatched response")]
    UnexpectedResponse,
}

#[derive(Default)]
struct Pool {
    conns: HashMap<String, Arc<NodeConn>>,
    /// Stable iteration order for the round-robin counter.
    addrs: Vec<String>,
    ring: HashRing,
}

struct ClientInner {
    pool: RwLock<Pool>,
    seq: AtomicU64,
}

impl ClientInner {
    fn new() -> Self {
        Self {
            pool: RwLock::new(Pool::default()),
            seq: AtomicU64::new(0),
        }
    }

    fn add_conn(&self, addr: &str, conn: NodeConn) {
        let mut pool = self.pool.write().unwrap();
        if pool.conns.contains_key(addr) {
            return;
        }
        pool.conns.insert(addr.to_string(), Arc::new(conn));
        pool.addrs.push(addr.to_string());
        pool.ring.add(addr);
        info!(addr, nodes = pool.addrs.len(), "node joined the pool");
    }

    fn remove_conn(&self, addr: &str) {
        let mut pool = self.pool.write().unwrap();
        if pool.conns.remove(addr).is_none() {
            return;
        }
        pool.addrs.retain(|a| a != addr);
        pool.ring.remove(addr);
        info!(addr, nodes = pool.addrs.len(), "node left the pool");
    }

    /// Elects a node under the read lock; the lock is dropped before
    /// any I/O happens on the returned connection.
    fn pick(&self, key: &str, policy: Policy) -> Result<Arc<NodeConn>, ClientError> {
        let pool = self.pool.read().unwrap();
        if pool.addrs.is_empty() {
            return Err(ClientError::NoAvailableNodes);
        }

        let addr = match policy {
            Policy::RoundRobin => {
                let next = self.seq.fetch_add(1, Ordering::Relaxed);
                pool.addrs[(next % pool.addrs.len() as u64) as usize].as_str()
            }
            Policy::KeyHash => pool
                .ring
                .get(key)
                .ok_or(ClientError::NoAvailableNodes)?,
        };

        // Pool and ring membership move together, so this lookup can
        // only miss if that invariant broke.
        pool.conns
            .get(addr)
            .cloned()
            .ok_or(ClientError::NoAvailableNodes)
    }
}

#[async_trait]
impl WatchHandler for ClientInner {
    async fn on_add(&self, _key: &str, addr: &str) {
        if self.pool.read().unwrap().conns.contains_key(addr) {
            return; // re-snapshot after a reconnect
        }
        match NodeConn::connect(addr).await {
            Ok(conn) => self.add_conn(addr, conn),
            Err(e) => warn!(addr, error = %e, "could not connect to new node"),
        }
    }

    async fn on_remove(&self, key: &str, addr: &str) {
        if addr.is_empty() {
            warn!(key, "remove event without an address, ignoring");
            return;
        }
        self.remove_conn(addr);
    }
}

/// Cluster client: connection pool + ring, fed by the registry.
pub struct KvClient {
    inner: Arc<ClientInner>,
    _watcher: Option<Watcher>,
}

impl KvClient {
    /// Discovery mode: follow the registry prefix for `service` and
    /// keep the pool in sync with cluster membership. The pool starts
    /// empty and fills as the watch snapshot arrives.
    pub fn discover(etcd: &etcd_client::Client, service: &str) -> Self {
        let inner = Arc::new(ClientInner::new());
        let watcher = Watcher::spawn(
            etcd.clone(),
            registry::service_prefix(service),
            Arc::clone(&inner) as Arc<dyn WatchHandler>,
        );
        Self {
            inner,
            _watcher: Some(watcher),
        }
    }

    /// Direct mode: one static node, no registry.
    pub async fn direct(addr: &str) -> Result<Self, ClientError> {
        let inner = Arc::new(ClientInner::new());
        let conn = NodeConn::connect(addr).await.map_err(|e| {
            ClientError::Transport {
                addr: addr.to_string(),
                source: e,
            }
        })?;
        inner.add_conn(addr, conn);
        Ok(Self {
            inner,
            _watcher: None,
        })
    }

    /// Live nodes currently in the pool.
    pub fn node_count(&self) -> usize {
        self.inner.pool.read().unwrap().addrs.len()
    }

    /// The node a key routes to under `KeyHash`, if any.
    pub fn key_owner(&self, key: &str) -> Option<String> {
        let pool = self.inner.pool.read().unwrap();
        pool.ring.get(key).map(str::to_string)
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.set_with(Policy::default(), key, value).await
    }

    pub async fn set_with(
        &self,
        policy: Policy,
        key: &str,
        value: &str,
    ) -> Result<(), ClientError> {
        let request = Request::Set {
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.dispatch(policy, key, request, SET_TIMEOUT).await? {
            Response::Set { success: true } => Ok(()),
            Response::Set { success: false } => Err(ClientError::Node("set rejected".into())),
            Response::Error { message } => Err(ClientError::Node(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        self.get_with(Policy::default(), key).await
    }

    pub async fn get_with(
        &self,
        policy: Policy,
        key: &str,
    ) -> Result<Option<String>, ClientError> {
        let request = Request::Get {
            key: key.to_string(),
        };
        match self.dispatch(policy, key, request, GET_TIMEOUT).await? {
            Response::Get { value, found: true } => Ok(Some(value)),
            Response::Get { found: false, .. } => Ok(None),
            Response::Error { message } => Err(ClientError::Node(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    pub async fn del(&self, key: &str) -> Result<(), ClientError> {
        self.del_with(Policy::default(), key).await
    }

    pub async fn del_with(&self, policy: Policy, key: &str) -> Result<(), ClientError> {
        let request = Request::Del {
            key: key.to_string(),
        };
        match self.dispatch(policy, key, request, DEL_TIMEOUT).await? {
            Response::Del { success: true } => Ok(()),
            Response::Del { success: false } => Err(ClientError::Node("del rejected".into())),
            Response::Error { message } => Err(ClientError::Node(message)),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    async fn dispatch(
        &self,
        policy: Policy,
        key: &str,
        request: Request,
        deadline: Duration,
    ) -> Result<Response, ClientError> {
        let conn = self.inner.pick(key, policy)?;

        match tokio::time::timeout(deadline, conn.call(&request)).await {
            Ok(result) => result,
            Err(_) => {
                // The exchange was cut mid-flight; force a redial.
                conn.poison().await;
                Err(ClientError::Timeout {
                    addr: conn.addr().to_string(),
                    timeout: deadline,
                })
            }
        }
    }
}
