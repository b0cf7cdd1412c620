//! Storage Node Core
//!
//! [`KvNode`] ties the three planes together: the sharded store, the
//! append-only file, and the event bus. Every mutation flows memory
//! first, then log, then event, in that order. The AOF and the bus
//! are both optional so a node can run volatile or CDC-less, which is
//! also what makes replay simple: a replaying node applies records
//! through the store alone, producing no new records and no events.
//!
//! A failed AOF append does not roll back the in-memory write. The
//! caller gets the durability error and the key stays readable; a
//! crash before the record lands loses that write on replay. That is
//! the accepted trade-off, pinned by the tests below.

use crate::aof::{AofError, AofWriter, Record};
use crate::events::{Event, EventBus};
use crate::storage::ShardedStore;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("durability: {0}")]
    Durability(#[from] AofError),
}

/// One storage node's state: store + optional AOF + optional bus.
pub struct KvNode {
    store: Arc<ShardedStore>,
    aof: Option<Arc<AofWriter>>,
    bus: Option<Arc<EventBus>>,
}

impl KvNode {
    pub fn new(
        store: Arc<ShardedStore>,
        aof: Option<Arc<AofWriter>>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self { store, aof, bus }
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    /// Rebuilds the store from the AOF. Runs once at startup, before
    /// the node serves traffic, with no concurrent writers.
    pub fn replay(&self) -> Result<usize, AofError> {
        let Some(aof) = &self.aof else {
            return Ok(0);
        };

        let records = aof.read_all()?;
        let count = records.len();
        for record in records {
            match record {
                Record::Set { key, value } => {
                    self.store.set(key, Bytes::from(value), None);
                }
                Record::Del { key } => {
                    self.store.del(&key);
                }
            }
        }

        if count > 0 {
            info!(records = count, keys = self.store.len(), "AOF replay complete");
        }
        Ok(count)
    }

    /// Stores a key. The wire never carries a TTL; internal callers
    /// may pass one and the key expires on schedule.
    pub async fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<(), NodeError> {
        self.store
            .set(key.clone(), Bytes::from(value.clone()), ttl);

        let mut result = Ok(());
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.write(&Record::Set {
                key: key.clone(),
                value: value.clone(),
            }) {
                error!(key = %key, error = %e, "AOF append failed, mutation stands");
                result = Err(e.into());
            }
        }

        self.emit(Event::set(key, value)).await;
        result
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.store.get(key)
    }

    pub async fn del(&self, key: String) -> Result<(), NodeError> {
        self.store.del(&key);

        let mut result = Ok(());
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.write(&Record::Del { key: key.clone() }) {
                error!(key = %key, error = %e, "AOF append failed, mutation stands");
                result = Err(e.into());
            }
        }

        self.emit(Event::del(key)).await;
        result
    }

    async fn emit(&self, event: Event) {
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.publish(event).await {
                warn!(error = %e, "event not enqueued");
            }
        }
    }

    /// Final persistence step of shutdown: stop the bus intake and
    /// force the log to disk. The caller drains the bus consumer.
    pub fn shutdown(&self) {
        if let Some(bus) = &self.bus {
            bus.close();
        }
        if let Some(aof) = &self.aof {
            if let Err(e) = aof.sync() {
                error!(error = %e, "final AOF sync failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aof::FsyncPolicy;
    use crate::events::EnqueuePolicy;

    fn volatile_node() -> KvNode {
        KvNode::new(Arc::new(ShardedStore::new()), None, None)
    }

    fn node_with_aof(path: &std::path::Path) -> KvNode {
        let aof = AofWriter::open(path, FsyncPolicy::Always).unwrap();
        KvNode::new(Arc::new(ShardedStore::new()), Some(Arc::new(aof)), None)
    }

    #[tokio::test]
    async fn set_get_del() {
        let node = volatile_node();

        node.set("a".into(), "1".into(), None).await.unwrap();
        assert_eq!(node.get("a"), Some(Bytes::from("1")));

        node.del("a".into()).await.unwrap();
        assert_eq!(node.get("a"), None);
    }

    #[tokio::test]
    async fn restart_replays_to_the_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.aof");

        {
            let node = node_with_aof(&path);
            node.set("x".into(), "1".into(), None).await.unwrap();
            node.set("y".into(), "2".into(), None).await.unwrap();
            node.set("x".into(), "3".into(), None).await.unwrap();
            node.del("y".into()).await.unwrap();
            node.shutdown();
            // Process "crashes" here; nothing else is flushed.
        }

        let restarted = node_with_aof(&path);
        assert_eq!(restarted.replay().unwrap(), 4);
        assert_eq!(restarted.get("x"), Some(Bytes::from("3")));
        assert_eq!(restarted.get("y"), None);
    }

    #[tokio::test]
    async fn replay_emits_no_events_and_no_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.aof");

        {
            let node = node_with_aof(&path);
            node.set("a".into(), "1".into(), None).await.unwrap();
        }

        let aof = Arc::new(AofWriter::open(&path, FsyncPolicy::Always).unwrap());
        let bus = EventBus::new(16, EnqueuePolicy::DropOldest);
        let node = KvNode::new(
            Arc::new(ShardedStore::new()),
            Some(Arc::clone(&aof)),
            Some(Arc::clone(&bus)),
        );

        node.replay().unwrap();
        assert!(bus.is_empty());
        assert_eq!(aof.read_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_successful_mutation_enqueues_an_event() {
        let bus = EventBus::new(16, EnqueuePolicy::DropOldest);
        let node = KvNode::new(Arc::new(ShardedStore::new()), None, Some(Arc::clone(&bus)));

        node.set("a".into(), "1".into(), None).await.unwrap();
        node.del("a".into()).await.unwrap();
        // Get is not a mutation and must not publish.
        node.get("a");

        assert_eq!(bus.len(), 2);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn aof_failure_surfaces_but_mutation_stands() {
        // /dev/full accepts the open and fails every write with ENOSPC.
        let aof = AofWriter::open("/dev/full", FsyncPolicy::No).unwrap();
        let node = KvNode::new(Arc::new(ShardedStore::new()), Some(Arc::new(aof)), None);

        let result = node.set("k".into(), "v".into(), None).await;
        assert!(matches!(result, Err(NodeError::Durability(_))));

        // Apply-then-log: the in-memory write is not rolled back.
        assert_eq!(node.get("k"), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn ttl_set_expires_internally() {
        let node = volatile_node();
        node.set("s".into(), "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(node.get("s").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node.get("s"), None);
    }
}
