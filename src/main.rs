//! MeshKV storage node server.
//!
//! Startup order matters: replay the log before serving, serve before
//! registering, so a node is never discoverable while its state is
//! still incomplete. Shutdown runs the same steps backwards.

use anyhow::Context;
use meshkv::aof::{AofFlusher, AofWriter, FsyncPolicy};
use meshkv::config::Config;
use meshkv::events::amqp::AmqpPublisher;
use meshkv::events::{EnqueuePolicy, EventBus, EventSink, DEFAULT_CAPACITY};
use meshkv::node::KvNode;
use meshkv::registry::{self, Registration, DEFAULT_LEASE_TTL};
use meshkv::server::{self, ServerStats};
use meshkv::storage::{ShardedStore, Sweeper, SweeperConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// How long shutdown waits for the event bus to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    FmtSubscriber::builder()
        .with_max_level(config.log_level())
        .with_target(false)
        .init();
    info!(version = meshkv::VERSION, "starting meshkv storage node");
    if config.pprof.enabled {
        warn!("pprof.enabled is set but this build has no profiling endpoint");
    }

    let store = Arc::new(ShardedStore::new());

    // Durability plane. A configured AOF that cannot open is fatal;
    // an empty filename disables persistence.
    let aof = if config.aof.filename.is_empty() {
        warn!("aof.filename is empty, running without persistence");
        None
    } else {
        let policy: FsyncPolicy = config
            .aof
            .append_fsync
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let writer = AofWriter::open(&config.aof.filename, policy)
            .with_context(|| format!("opening AOF at {}", config.aof.filename))?;
        info!(path = %config.aof.filename, ?policy, "AOF open");
        Some(Arc::new(writer))
    };
    let _flusher = aof
        .as_ref()
        .filter(|w| w.policy() == FsyncPolicy::EverySec)
        .map(|w| AofFlusher::start(Arc::clone(w)));

    // CDC plane. A dead broker downgrades the node, it does not stop it.
    let mut bus_parts = None;
    match AmqpPublisher::connect(&config.rabbitmq.url, &config.cdc.exchange).await {
        Ok(publisher) => {
            let bus = EventBus::new(DEFAULT_CAPACITY, EnqueuePolicy::DropOldest);
            let sink: Arc<dyn EventSink> = Arc::new(publisher);
            let consumer = tokio::spawn(Arc::clone(&bus).run_publisher(sink));
            bus_parts = Some((bus, consumer));
        }
        Err(e) => {
            warn!(error = %e, "event broker unreachable, running without CDC");
        }
    }
    let bus = bus_parts.as_ref().map(|(bus, _)| Arc::clone(bus));

    let node = Arc::new(KvNode::new(Arc::clone(&store), aof.clone(), bus));
    let replayed = node.replay().context("AOF replay")?;
    info!(records = replayed, keys = store.len(), "state restored");

    let sweeper = Sweeper::start(Arc::clone(&store), SweeperConfig::default());

    let listener = server::bind(&config.bind_addr())
        .await
        .with_context(|| format!("binding {}", config.bind_addr()))?;
    let stats = Arc::new(ServerStats::new());
    let serve_task = tokio::spawn(server::serve(listener, Arc::clone(&node), stats));

    // Last step of startup: become discoverable.
    let etcd = registry::connect(&config.etcd.endpoints)
        .await
        .context("connecting to etcd")?;
    let registration = Registration::register(
        &etcd,
        &config.server.service_name,
        &config.advertise_addr(),
        DEFAULT_LEASE_TTL,
    )
    .await
    .context("registering in etcd")?;

    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        _ = registration.lost() => error!("registry lease lost, shutting down"),
    }

    // 1. Stop accepting requests.
    serve_task.abort();
    // 2. Leave the cluster so clients stop routing here.
    if let Err(e) = registration.deregister().await {
        warn!(error = %e, "deregistration failed");
    }
    // 3. Stop background reclamation.
    sweeper.stop();
    // 4. Drain the event bus with a deadline.
    if let Some((bus, consumer)) = bus_parts {
        bus.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, consumer).await.is_err() {
            warn!(queued = bus.len(), "event drain deadline hit, events abandoned");
        }
        if bus.dropped() > 0 {
            warn!(dropped = bus.dropped(), "events were dropped during this run");
        }
    }
    // 5. Final fsync.
    if let Some(aof) = &aof {
        if let Err(e) = aof.sync() {
            error!(error = %e, "final AOF sync failed");
        }
    }

    let totals = store.stats();
    info!(
        keys = totals.keys,
        sets = totals.sets,
        gets = totals.gets,
        dels = totals.dels,
        expired = totals.expired,
        "final store counters"
    );
    info!("server stopped");
    Ok(())
}
