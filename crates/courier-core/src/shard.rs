//! Shards: connections to backing store instances.
//!
//! A [`Shard`] owns the lifecycle of one store connection. It goes `Down`
//! as soon as the store reports a lost connection and reconnects in the
//! background with capped exponential backoff, flipping back `Up` only after
//! a successful handshake. Operations on a `Down` shard fail fast so a
//! single outage never stalls channels owned by other shards.

use crate::channel::ChannelId;
use crate::error::{Error, Result, StoreError};
use crate::history::HistoryOptions;
use crate::message::{ClientInfo, Publication, Push, StreamPosition};
use crate::presence::PresenceEntry;
use crate::store::{NodeSink, Published, Store};
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Shard health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardHealth {
    Up,
    Down,
}

/// Reconnect backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            factor: 2,
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let multiplier = self.config.factor.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.config
            .min_delay
            .saturating_mul(multiplier)
            .min(self.config.max_delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

struct ShardInner {
    name: String,
    store: Arc<dyn Store>,
    up: AtomicBool,
    backoff: BackoffConfig,
    /// Node registration replayed after a reconnect.
    node: Mutex<Option<(String, NodeSink)>>,
    /// Channels routed to the registered node, replayed after a reconnect.
    routes: DashSet<ChannelId>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// A connection to one backing store instance.
#[derive(Clone)]
pub struct Shard {
    inner: Arc<ShardInner>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("name", &self.inner.name)
            .field("health", &self.health())
            .finish()
    }
}

impl Shard {
    /// Create a shard. It stays `Down` until [`Shard::connect`] succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self::with_backoff(name, store, BackoffConfig::default())
    }

    /// Create a shard with custom reconnect backoff.
    #[must_use]
    pub fn with_backoff(
        name: impl Into<String>,
        store: Arc<dyn Store>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ShardInner {
                name: name.into(),
                store,
                up: AtomicBool::new(false),
                backoff,
                node: Mutex::new(None),
                routes: DashSet::new(),
                reconnect_task: Mutex::new(None),
            }),
        }
    }

    /// Shard name, usually the store address.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn health(&self) -> ShardHealth {
        if self.inner.up.load(Ordering::SeqCst) {
            ShardHealth::Up
        } else {
            ShardHealth::Down
        }
    }

    #[must_use]
    pub fn is_up(&self) -> bool {
        self.health() == ShardHealth::Up
    }

    /// Perform the initial handshake.
    ///
    /// # Errors
    ///
    /// Returns the store error if the handshake fails.
    pub async fn connect(&self) -> std::result::Result<(), StoreError> {
        self.inner.store.handshake().await?;
        self.inner.up.store(true, Ordering::SeqCst);
        info!(shard = %self.inner.name, "Shard connected");
        Ok(())
    }

    /// Whether a background reconnect is in progress.
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner
            .reconnect_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Flip the shard `Down` and start reconnecting.
    pub fn mark_down(&self) {
        if !self.inner.up.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(shard = %self.inner.name, "Shard connection lost");

        let mut task = self.inner.reconnect_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(reconnect(inner)));
    }

    /// Stop any reconnect in progress.
    pub fn close(&self) {
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
    }

    fn store(&self) -> Result<&Arc<dyn Store>> {
        if self.is_up() {
            Ok(&self.inner.store)
        } else {
            Err(Error::ShardUnavailable(self.inner.name.clone()))
        }
    }

    fn observe<T>(&self, result: std::result::Result<T, StoreError>) -> Result<T> {
        result.map_err(|e| match e {
            StoreError::ConnectionLost => {
                self.mark_down();
                Error::ShardUnavailable(self.inner.name.clone())
            }
            StoreError::Unavailable(reason) => Error::StorageUnavailable(reason),
        })
    }

    /// Register the node fan-out sink.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the registration.
    pub async fn register_node(&self, node_id: &str, sink: NodeSink) -> Result<()> {
        *self.inner.node.lock() = Some((node_id.to_string(), sink.clone()));
        let store = self.store()?;
        self.observe(store.register_node(node_id, sink).await)
    }

    /// Remove the node registration.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn unregister_node(&self, node_id: &str) -> Result<()> {
        self.inner.node.lock().take();
        self.inner.routes.clear();
        let store = self.store()?;
        self.observe(store.unregister_node(node_id).await)
    }

    /// Route a channel to a node.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn subscribe(&self, channel: &str, node_id: &str) -> Result<()> {
        let store = self.store()?;
        self.observe(store.subscribe(channel, node_id).await)?;
        self.inner.routes.insert(channel.to_string());
        Ok(())
    }

    /// Stop routing a channel to a node.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn unsubscribe(&self, channel: &str, node_id: &str) -> Result<()> {
        self.inner.routes.remove(channel);
        let store = self.store()?;
        self.observe(store.unsubscribe(channel, node_id).await)
    }

    /// Append and fan out a publication.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        info: Option<ClientInfo>,
        history: &HistoryOptions,
    ) -> Result<Published> {
        let store = self.store()?;
        self.observe(store.publish(channel, payload, info, history).await)
    }

    /// Fan out a push without history.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn broadcast(&self, push: Push) -> Result<()> {
        let store = self.store()?;
        self.observe(store.broadcast(push).await)
    }

    /// Read history after `since`.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn history(
        &self,
        channel: &str,
        since: u64,
    ) -> Result<(Vec<Publication>, StreamPosition)> {
        let store = self.store()?;
        self.observe(store.history(channel, since).await)
    }

    /// Insert or refresh presence.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn add_presence(&self, channel: &str, info: &ClientInfo) -> Result<()> {
        let store = self.store()?;
        self.observe(store.add_presence(channel, info).await)
    }

    /// Remove presence.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<()> {
        let store = self.store()?;
        self.observe(store.remove_presence(channel, client_id).await)
    }

    /// Refresh presence.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn refresh_presence(&self, channel: &str, client_id: &str) -> Result<bool> {
        let store = self.store()?;
        self.observe(store.refresh_presence(channel, client_id).await)
    }

    /// Live presence of a channel.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn presence(&self, channel: &str, timeout: Duration) -> Result<Vec<PresenceEntry>> {
        let store = self.store()?;
        self.observe(store.presence(channel, timeout).await)
    }

    /// Run the store's expiry sweep.
    ///
    /// # Errors
    ///
    /// Fails if the shard is down or the store rejects the request.
    pub async fn remove_expired(&self, presence_timeout: Duration) -> Result<usize> {
        let store = self.store()?;
        self.observe(store.remove_expired(presence_timeout).await)
    }
}

async fn reconnect(inner: Arc<ShardInner>) {
    let mut backoff = Backoff::new(inner.backoff);
    loop {
        let delay = backoff.next_delay();
        debug!(shard = %inner.name, delay_ms = delay.as_millis() as u64, "Reconnecting shard");
        tokio::time::sleep(delay).await;

        if let Err(e) = inner.store.handshake().await {
            warn!(shard = %inner.name, error = %e, "Shard handshake failed");
            continue;
        }
        if let Err(e) = resync(&inner).await {
            warn!(shard = %inner.name, error = %e, "Shard resync failed");
            continue;
        }

        {
            // Free the slot before going Up so the next loss spawns a fresh task.
            let mut task = inner.reconnect_task.lock();
            task.take();
            inner.up.store(true, Ordering::SeqCst);
        }
        info!(shard = %inner.name, "Shard reconnected");
        return;
    }
}

/// Replay the node registration and channel routes on a fresh connection.
async fn resync(inner: &ShardInner) -> std::result::Result<(), StoreError> {
    let node = inner.node.lock().clone();
    let Some((node_id, sink)) = node else {
        return Ok(());
    };
    inner.store.register_node(&node_id, sink).await?;
    let routes: Vec<ChannelId> = inner.routes.iter().map(|c| c.clone()).collect();
    for channel in routes {
        inner.store.subscribe(&channel, &node_id).await?;
    }
    Ok(())
}

/// Fixed set of shards with channels assigned by consistent hashing.
#[derive(Debug, Clone)]
pub struct ShardRing {
    shards: Arc<[Shard]>,
}

impl ShardRing {
    /// Create a ring.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FatalStartup`] if `shards` is empty.
    pub fn new(shards: Vec<Shard>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::FatalStartup("at least one shard is required".into()));
        }
        Ok(Self {
            shards: shards.into(),
        })
    }

    /// The shard owning a channel.
    #[must_use]
    pub fn get(&self, channel: &str) -> &Shard {
        let index = jump_hash(xxh3_64(channel.as_bytes()), self.shards.len());
        &self.shards[index]
    }

    /// All shards in ring order.
    #[must_use]
    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

/// Jump consistent hash: maps `key` to a bucket in `0..buckets`.
fn jump_hash(mut key: u64, buckets: usize) -> usize {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as usize
}
