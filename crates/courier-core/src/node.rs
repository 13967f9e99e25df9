//! Gateway node.
//!
//! A [`Node`] owns the broker, the presence manager and the registry of live
//! sessions. Once [`Node::run`] has connected every shard it drives three
//! background loops:
//!
//! - **delivery** - hands pushes fanned out by the shards to local sessions
//! - **refresh** - keeps presence entries of live sessions alive
//! - **sweep** - removes stale presence and expired history

use crate::broker::{Broker, PublishResult};
use crate::error::{Error, Result};
use crate::handler::{EventHandler, NoopHandler};
use crate::history::HistoryOptions;
use crate::message::{Disconnect, Push};
use crate::presence_manager::{PresenceManager, DEFAULT_PRESENCE_TTL};
use crate::session::{Session, SubscribeOptions};
use crate::shard::ShardRing;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Retention applied to client publications.
    pub history: HistoryOptions,
    /// Options handed to [`EventHandler::on_subscribe`].
    pub subscribe_options: SubscribeOptions,
    /// Presence entries not refreshed within this window are stale.
    pub presence_ttl: Duration,
    /// How often live sessions refresh their presence.
    pub presence_refresh_interval: Duration,
    /// How often stale presence and expired history are swept.
    pub sweep_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            history: HistoryOptions::default(),
            subscribe_options: SubscribeOptions::default(),
            presence_ttl: DEFAULT_PRESENCE_TTL,
            presence_refresh_interval: Duration::from_secs(25),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{nanos:x}{counter:04x}")
}

/// State shared between a node and its sessions.
pub(crate) struct NodeShared {
    pub(crate) id: String,
    pub(crate) config: NodeConfig,
    pub(crate) broker: Broker,
    pub(crate) presence: PresenceManager,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) sessions: DashMap<String, Arc<Session>>,
}

/// A gateway node.
pub struct Node {
    shared: Arc<NodeShared>,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node with the default handler.
    #[must_use]
    pub fn new(config: NodeConfig, ring: ShardRing) -> Self {
        Self::with_handler(config, ring, Arc::new(NoopHandler))
    }

    /// Create a node with a custom lifecycle handler.
    #[must_use]
    pub fn with_handler(
        config: NodeConfig,
        ring: ShardRing,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let id = generate_id("node");
        let presence = PresenceManager::new(ring.clone(), config.presence_ttl);
        let broker = Broker::new(id.clone(), ring);
        Self {
            shared: Arc::new(NodeShared {
                id,
                config,
                broker,
                presence,
                handler,
                sessions: DashMap::new(),
            }),
            accepting: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn broker(&self) -> &Broker {
        &self.shared.broker
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceManager {
        &self.shared.presence
    }

    /// Connect every shard and start the background loops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FatalStartup`] if any shard cannot be reached.
    pub async fn run(&self) -> Result<()> {
        let ring = self.shared.broker.ring();
        for shard in ring.shards() {
            shard.connect().await.map_err(|e| {
                error!(shard = %shard.name(), error = %e, "Shard unreachable at startup");
                Error::FatalStartup(format!("shard {}: {e}", shard.name()))
            })?;
        }

        let (sink, rx) = mpsc::unbounded_channel();
        self.shared
            .broker
            .register(sink)
            .await
            .map_err(|e| Error::FatalStartup(e.to_string()))?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(delivery_loop(Arc::clone(&self.shared), rx)));
        tasks.push(tokio::spawn(refresh_loop(Arc::clone(&self.shared))));
        tasks.push(tokio::spawn(sweep_loop(Arc::clone(&self.shared))));
        drop(tasks);

        self.accepting.store(true, Ordering::SeqCst);
        info!(node = %self.shared.id, shards = ring.len(), "Node running");
        Ok(())
    }

    /// Create a session for a new connection.
    ///
    /// Returns the session and the receiver of its pushes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] before [`Node::run`] or once shutdown began.
    pub fn accept(&self) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<Push>)> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = generate_id("conn");
        let session = Arc::new(Session::new(id.clone(), Arc::clone(&self.shared), tx));
        self.shared.sessions.insert(id, Arc::clone(&session));
        debug!(client = %session.id(), "Session accepted");
        Ok((session, rx))
    }

    /// Look up a live session.
    #[must_use]
    pub fn session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.shared.sessions.get(client_id).map(|s| Arc::clone(&s))
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Publish on behalf of the server. The payload is delivered as given.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down or history cannot be written.
    pub async fn publish(&self, channel: &str, data: Bytes) -> Result<PublishResult> {
        self.shared
            .broker
            .publish(channel, data, None, &self.shared.config.history)
            .await
    }

    /// Disconnect a session. Returns `false` if it was not found.
    pub async fn disconnect(&self, client_id: &str, disconnect: Disconnect) -> bool {
        match self.session(client_id) {
            Some(session) => {
                session.disconnect(disconnect).await;
                true
            }
            None => false,
        }
    }

    /// Stop accepting, disconnect every session and release the shards.
    ///
    /// Sessions still tearing down when `deadline` passes are dropped.
    pub async fn shutdown(&self, deadline: Duration) {
        self.accepting.store(false, Ordering::SeqCst);
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(node = %self.shared.id, sessions = sessions.len(), "Shutting down node");

        let teardown = join_all(
            sessions
                .iter()
                .map(|session| session.disconnect(Disconnect::SHUTDOWN)),
        );
        if tokio::time::timeout(deadline, teardown).await.is_err() {
            error!(
                remaining = self.shared.sessions.len(),
                "Shutdown deadline passed, dropping remaining sessions"
            );
            self.shared.sessions.clear();
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.broker.unregister().await;
        for shard in self.shared.broker.ring().shards() {
            shard.close();
        }
        info!(node = %self.shared.id, "Node stopped");
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.shared.id)
            .field("sessions", &self.shared.sessions.len())
            .field("broker", &self.shared.broker)
            .finish()
    }
}

async fn delivery_loop(shared: Arc<NodeShared>, mut rx: mpsc::UnboundedReceiver<Push>) {
    while let Some(push) = rx.recv().await {
        shared.broker.deliver(&push);
    }
    debug!(node = %shared.id, "Delivery loop stopped");
}

async fn refresh_loop(shared: Arc<NodeShared>) {
    let mut interval = tokio::time::interval(shared.config.presence_refresh_interval);
    interval.tick().await;
    loop {
        interval.tick().await;
        let sessions: Vec<Arc<Session>> = shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            session.refresh_presence().await;
        }
    }
}

async fn sweep_loop(shared: Arc<NodeShared>) {
    let mut interval = tokio::time::interval(shared.config.sweep_interval);
    interval.tick().await;
    loop {
        interval.tick().await;
        let removed = shared.presence.remove_stale().await;
        if removed > 0 {
            debug!(removed, "Swept expired entries");
        }
        shared.broker.remove_idle_locks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::Shard;
    use crate::store::MemoryStore;

    fn ring(store: Arc<MemoryStore>) -> ShardRing {
        ShardRing::new(vec![Shard::new("s0", store)]).unwrap()
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_id("conn");
        let b = generate_id("conn");
        assert!(a.starts_with("conn_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_accept_requires_run() {
        let node = Node::new(NodeConfig::default(), ring(Arc::new(MemoryStore::default())));
        assert!(matches!(node.accept(), Err(Error::Closed)));

        node.run().await.unwrap();
        let (session, _rx) = node.accept().unwrap();
        assert_eq!(node.session_count(), 1);
        assert!(node.session(session.id()).is_some());
        node.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_run_fails_fast_on_unreachable_shard() {
        let store = Arc::new(MemoryStore::default());
        store.set_reachable(false);
        let node = Node::new(NodeConfig::default(), ring(store));
        assert!(matches!(node.run().await, Err(Error::FatalStartup(_))));
        assert!(matches!(node.accept(), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_sessions() {
        let node = Node::new(NodeConfig::default(), ring(Arc::new(MemoryStore::default())));
        node.run().await.unwrap();
        let (_session, mut rx) = node.accept().unwrap();

        node.shutdown(Duration::from_secs(1)).await;
        assert_eq!(node.session_count(), 0);
        assert!(matches!(
            rx.recv().await,
            Some(Push::Disconnect(d)) if d == Disconnect::SHUTDOWN
        ));
        assert!(matches!(node.accept(), Err(Error::Closed)));
    }
}
