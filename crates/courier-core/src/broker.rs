//! Sharded broker.
//!
//! The broker routes publications between gateway nodes. Every channel is
//! owned by one shard (consistent hash of its name); publishing appends to
//! the owning store's history and fans the publication out to every node
//! that has local subscribers on the channel. Each node then delivers to its
//! own sessions through the local hub.

use crate::channel::{Channel, ChannelId, PushSender};
use crate::error::Result;
use crate::history::HistoryOptions;
use crate::message::{ClientInfo, Publication, Push, StreamPosition};
use crate::shard::{Shard, ShardRing};
use crate::store::NodeSink;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Result of a successful publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResult {
    /// Offset assigned by history; zero when history was not requested.
    pub offset: u64,
    /// Stream epoch the offset belongs to.
    pub epoch: String,
}

/// Result of a history recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    /// Missed publications in offset order.
    pub publications: Vec<Publication>,
    /// Current stream position.
    pub position: StreamPosition,
    /// Whether every missed publication could be returned.
    pub recovered: bool,
}

/// Routes publications across nodes and delivers them locally.
pub struct Broker {
    node_id: String,
    ring: ShardRing,
    /// Local subscribers indexed by channel.
    hub: DashMap<ChannelId, Channel>,
    /// Serializes attach/detach per channel.
    locks: DashMap<ChannelId, Arc<Mutex<()>>>,
}

impl Broker {
    #[must_use]
    pub fn new(node_id: impl Into<String>, ring: ShardRing) -> Self {
        Self {
            node_id: node_id.into(),
            ring,
            hub: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn ring(&self) -> &ShardRing {
        &self.ring
    }

    /// The shard owning a channel.
    #[must_use]
    pub fn shard_for(&self, channel: &str) -> &Shard {
        self.ring.get(channel)
    }

    /// Number of channels with local subscribers.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.hub.len()
    }

    /// Number of local subscribers of a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.hub
            .get(channel)
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Register this node's fan-out sink with every shard.
    ///
    /// # Errors
    ///
    /// Fails on the first shard that rejects the registration.
    pub async fn register(&self, sink: NodeSink) -> Result<()> {
        for shard in self.ring.shards() {
            shard.register_node(&self.node_id, sink.clone()).await?;
        }
        Ok(())
    }

    /// Remove this node from every reachable shard.
    pub async fn unregister(&self) {
        for shard in self.ring.shards() {
            if let Err(e) = shard.unregister_node(&self.node_id).await {
                warn!(shard = %shard.name(), error = %e, "Failed to unregister node");
            }
        }
    }

    /// Make sure publications on `channel` reach this node. Idempotent.
    ///
    /// # Errors
    ///
    /// Fails with `ShardUnavailable` if the owning shard is down.
    pub async fn ensure_channel(&self, channel: &str) -> Result<()> {
        self.ring.get(channel).subscribe(channel, &self.node_id).await
    }

    fn channel_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(channel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Deliver pushes on `channel` to a local session.
    ///
    /// # Errors
    ///
    /// Fails if the channel route cannot be established.
    pub async fn attach(&self, channel: &str, client_id: &str, sink: PushSender) -> Result<()> {
        let lock = self.channel_lock(channel);
        let _guard = lock.lock().await;

        if !self.hub.contains_key(channel) {
            self.ensure_channel(channel).await?;
            debug!(channel = %channel, node = %self.node_id, "Channel routed to node");
        }
        self.hub
            .entry(channel.to_string())
            .or_insert_with(|| Channel::new(channel))
            .subscribe(client_id, sink);
        Ok(())
    }

    /// Stop delivering `channel` to a local session. No-op if not attached.
    ///
    /// # Errors
    ///
    /// Fails if the channel route cannot be released.
    pub async fn detach(&self, channel: &str, client_id: &str) -> Result<()> {
        let lock = self.channel_lock(channel);
        let _guard = lock.lock().await;

        let empty = match self.hub.get_mut(channel) {
            Some(mut entry) => {
                entry.unsubscribe(client_id);
                entry.is_empty()
            }
            None => return Ok(()),
        };
        if empty {
            self.hub.remove(channel);
            self.ring.get(channel).unsubscribe(channel, &self.node_id).await?;
            debug!(channel = %channel, node = %self.node_id, "Channel route released");
        }
        Ok(())
    }

    /// Publish into a channel.
    ///
    /// # Errors
    ///
    /// Fails with `ShardUnavailable` if the owning shard is down and with
    /// `StorageUnavailable` if history could not be written (the
    /// publication has still been fanned out in that case).
    pub async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        info: Option<ClientInfo>,
        history: &HistoryOptions,
    ) -> Result<PublishResult> {
        let published = self
            .ring
            .get(channel)
            .publish(channel, payload, info, history)
            .await?;
        trace!(channel = %channel, offset = published.publication.offset, "Published");
        Ok(PublishResult {
            offset: published.publication.offset,
            epoch: published.position.map(|p| p.epoch).unwrap_or_default(),
        })
    }

    /// Announce a client joining a channel.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down.
    pub async fn publish_join(&self, channel: &str, info: ClientInfo) -> Result<()> {
        self.ring
            .get(channel)
            .broadcast(Push::Join {
                channel: channel.to_string(),
                info,
            })
            .await
    }

    /// Announce a client leaving a channel.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down.
    pub async fn publish_leave(&self, channel: &str, info: ClientInfo) -> Result<()> {
        self.ring
            .get(channel)
            .broadcast(Push::Leave {
                channel: channel.to_string(),
                info,
            })
            .await
    }

    /// Current position of a channel stream.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down.
    pub async fn position(&self, channel: &str) -> Result<StreamPosition> {
        let (_, position) = self.ring.get(channel).history(channel, u64::MAX).await?;
        Ok(position)
    }

    /// Publications missed since `since`.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down.
    pub async fn recover(&self, channel: &str, since: &StreamPosition) -> Result<Recovery> {
        let (publications, position) = self.ring.get(channel).history(channel, since.offset).await?;

        if position.epoch != since.epoch {
            debug!(channel = %channel, "Stream epoch changed, recovery not possible");
            return Ok(Recovery {
                publications: Vec::new(),
                position,
                recovered: false,
            });
        }
        let recovered = position.offset == since.offset || !publications.is_empty();
        Ok(Recovery {
            publications,
            position,
            recovered,
        })
    }

    /// Deliver a fanned-out push to local sessions.
    ///
    /// Returns the number of sessions it was queued for.
    pub fn deliver(&self, push: &Push) -> usize {
        let Some(channel) = push.channel() else {
            return 0;
        };
        self.hub
            .get(channel)
            .map(|entry| entry.deliver(push))
            .unwrap_or(0)
    }

    /// Forget per-channel locks nobody holds for channels without local subscribers.
    pub fn remove_idle_locks(&self) {
        self.locks
            .retain(|channel, lock| Arc::strong_count(lock) > 1 || self.hub.contains_key(channel));
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("node_id", &self.node_id)
            .field("shards", &self.ring.len())
            .field("channels", &self.hub.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    async fn broker(node_id: &str, stores: &[Arc<MemoryStore>]) -> (Broker, mpsc::UnboundedReceiver<Push>) {
        let shards: Vec<Shard> = stores
            .iter()
            .enumerate()
            .map(|(i, store)| Shard::new(format!("s{i}"), store.clone()))
            .collect();
        for shard in &shards {
            shard.connect().await.unwrap();
        }
        let broker = Broker::new(node_id, ShardRing::new(shards).unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        broker.register(tx).await.unwrap();
        (broker, rx)
    }

    /// Find two channels that hash to different shards of a two-shard ring.
    fn split_channels(broker: &Broker) -> (String, String) {
        let first = broker.shard_for("news").name().to_string();
        let other = (0..1000)
            .map(|i| format!("sports-{i}"))
            .find(|c| broker.shard_for(c).name() != first)
            .unwrap();
        ("news".to_string(), other)
    }

    #[tokio::test]
    async fn test_publish_offsets_and_fan_out() {
        let store = Arc::new(MemoryStore::default());
        let (broker, mut node_rx) = broker("node-a", &[store.clone()]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.attach("news", "conn-1", tx).await.unwrap();

        for expected in 1..=3 {
            let result = broker
                .publish("news", Bytes::from_static(b"x"), None, &HistoryOptions::default())
                .await
                .unwrap();
            assert_eq!(result.offset, expected);
            assert!(!result.epoch.is_empty());
        }

        // The node loop normally does this.
        while let Ok(push) = node_rx.try_recv() {
            broker.deliver(&push);
        }
        let offsets: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|push| match push {
                Push::Publication(p) => Some(p.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_attach_detach_manage_route() {
        let store = Arc::new(MemoryStore::default());
        let (broker, _node_rx) = broker("node-a", &[store.clone()]).await;
        let (tx, _rx) = mpsc::unbounded_channel();

        broker.attach("news", "conn-1", tx.clone()).await.unwrap();
        broker.attach("news", "conn-2", tx).await.unwrap();
        assert_eq!(store.routed_nodes("news"), 1);
        assert_eq!(broker.subscriber_count("news"), 2);

        broker.detach("news", "conn-1").await.unwrap();
        assert_eq!(store.routed_nodes("news"), 1);
        broker.detach("news", "conn-2").await.unwrap();
        assert_eq!(store.routed_nodes("news"), 0);
        assert_eq!(broker.channel_count(), 0);

        // Detaching twice is harmless.
        broker.detach("news", "conn-2").await.unwrap();
        broker.remove_idle_locks();
    }

    #[tokio::test]
    async fn test_down_shard_isolated() {
        let stores = [Arc::new(MemoryStore::default()), Arc::new(MemoryStore::default())];
        let (broker, _node_rx) = broker("node-a", &stores).await;
        let (news, sports) = split_channels(&broker);

        let news_shard = broker.shard_for(&news).clone();
        news_shard.mark_down();

        let result = broker
            .publish(&news, Bytes::from_static(b"x"), None, &HistoryOptions::default())
            .await;
        assert!(matches!(result, Err(Error::ShardUnavailable(_))));

        let result = broker
            .publish(&sports, Bytes::from_static(b"x"), None, &HistoryOptions::default())
            .await;
        assert_eq!(result.unwrap().offset, 1);
        news_shard.close();
    }

    #[tokio::test]
    async fn test_recover() {
        let store = Arc::new(MemoryStore::default());
        let (broker, _node_rx) = broker("node-a", &[store]).await;
        let start = broker.position("news").await.unwrap();
        assert_eq!(start.offset, 0);

        for _ in 0..3 {
            broker
                .publish("news", Bytes::from_static(b"x"), None, &HistoryOptions::default())
                .await
                .unwrap();
        }

        let recovery = broker.recover("news", &start).await.unwrap();
        assert!(recovery.recovered);
        assert_eq!(recovery.publications.len(), 3);
        assert_eq!(recovery.position.offset, 3);

        let stale = StreamPosition {
            offset: 1,
            epoch: "other".into(),
        };
        let recovery = broker.recover("news", &stale).await.unwrap();
        assert!(!recovery.recovered);
        assert!(recovery.publications.is_empty());
    }

    #[tokio::test]
    async fn test_cross_node_delivery() {
        let store = Arc::new(MemoryStore::default());
        let (node_a, _rx_a) = broker("node-a", &[store.clone()]).await;
        let (node_b, mut rx_b) = broker("node-b", &[store.clone()]).await;
        let (tx, mut session_rx) = mpsc::unbounded_channel();
        node_b.attach("news", "conn-b", tx).await.unwrap();

        node_a
            .publish("news", Bytes::from_static(b"x"), None, &HistoryOptions::default())
            .await
            .unwrap();

        let push = rx_b.try_recv().unwrap();
        assert_eq!(node_b.deliver(&push), 1);
        assert!(matches!(session_rx.try_recv().unwrap(), Push::Publication(p) if p.offset == 1));
    }
}
