//! Backing store contract.
//!
//! A [`Store`] is one instance of the storage shared by every gateway node:
//! it keeps history streams and presence, and fans publications out to all
//! nodes that registered interest in a channel. [`MemoryStore`] implements
//! the contract in process; several nodes sharing one `MemoryStore` behave
//! like several gateway processes sharing one store instance.

use crate::channel::ChannelId;
use crate::error::StoreError;
use crate::history::{HistoryBuffer, HistoryOptions};
use crate::message::{ClientInfo, Publication, Push, StreamPosition};
use crate::presence::{PresenceEntry, PresenceSet};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Queue a node receives fanned-out pushes on.
pub type NodeSink = mpsc::UnboundedSender<Push>;

/// Outcome of a publish at the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub publication: Publication,
    /// Stream position after the append; `None` without history.
    pub position: Option<StreamPosition>,
}

/// Operations a backing store instance must support.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Establish (or re-establish) the connection.
    async fn handshake(&self) -> Result<(), StoreError>;

    /// Register the sink a node receives fan-out on.
    async fn register_node(&self, node_id: &str, sink: NodeSink) -> Result<(), StoreError>;

    /// Remove a node and every channel route it held.
    async fn unregister_node(&self, node_id: &str) -> Result<(), StoreError>;

    /// Route publications on `channel` to `node_id`. Idempotent.
    async fn subscribe(&self, channel: &str, node_id: &str) -> Result<(), StoreError>;

    /// Stop routing `channel` to `node_id`. Idempotent.
    async fn unsubscribe(&self, channel: &str, node_id: &str) -> Result<(), StoreError>;

    /// Append to history (when `history` is enabled) and fan out, as one step.
    ///
    /// A history failure is reported as [`StoreError::Unavailable`] after the
    /// publication has been fanned out without an offset.
    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        info: Option<ClientInfo>,
        history: &HistoryOptions,
    ) -> Result<Published, StoreError>;

    /// Fan out a push without touching history.
    async fn broadcast(&self, push: Push) -> Result<(), StoreError>;

    /// Publications with offset greater than `since` and the stream position.
    async fn history(
        &self,
        channel: &str,
        since: u64,
    ) -> Result<(Vec<Publication>, StreamPosition), StoreError>;

    /// Insert or refresh a presence entry.
    async fn add_presence(&self, channel: &str, info: &ClientInfo) -> Result<(), StoreError>;

    /// Remove a presence entry.
    async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<(), StoreError>;

    /// Refresh a presence entry. Returns `false` if it does not exist.
    async fn refresh_presence(&self, channel: &str, client_id: &str) -> Result<bool, StoreError>;

    /// Live presence entries of a channel.
    async fn presence(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> Result<Vec<PresenceEntry>, StoreError>;

    /// Drop expired history and stale presence. Returns the number removed.
    async fn remove_expired(&self, presence_timeout: Duration) -> Result<usize, StoreError>;
}

/// In-process [`Store`].
#[derive(Debug)]
pub struct MemoryStore {
    history: HistoryBuffer,
    presence: DashMap<ChannelId, PresenceSet>,
    /// Channel -> nodes with local subscribers.
    routes: DashMap<ChannelId, HashSet<String>>,
    nodes: DashMap<String, NodeSink>,
    reachable: AtomicBool,
    history_writable: AtomicBool,
}

impl MemoryStore {
    /// Create a store whose history streams expire after `history_meta_ttl` of inactivity.
    #[must_use]
    pub fn new(history_meta_ttl: Duration) -> Self {
        Self {
            history: HistoryBuffer::new(history_meta_ttl),
            presence: DashMap::new(),
            routes: DashMap::new(),
            nodes: DashMap::new(),
            reachable: AtomicBool::new(true),
            history_writable: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to this store.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Simulate history writes failing while fan-out keeps working.
    pub fn set_history_writable(&self, writable: bool) {
        self.history_writable.store(writable, Ordering::SeqCst);
    }

    /// Nodes currently routed for a channel.
    #[must_use]
    pub fn routed_nodes(&self, channel: &str) -> usize {
        self.routes.get(channel).map(|r| r.len()).unwrap_or(0)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::ConnectionLost)
        }
    }

    fn fan_out(&self, nodes: &HashSet<String>, push: &Push) {
        for node_id in nodes {
            if let Some(sink) = self.nodes.get(node_id) {
                if sink.send(push.clone()).is_err() {
                    warn!(node = %node_id, "Node sink closed");
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 3600))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn handshake(&self) -> Result<(), StoreError> {
        self.check()
    }

    async fn register_node(&self, node_id: &str, sink: NodeSink) -> Result<(), StoreError> {
        self.check()?;
        self.nodes.insert(node_id.to_string(), sink);
        debug!(node = %node_id, "Node registered");
        Ok(())
    }

    async fn unregister_node(&self, node_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.nodes.remove(node_id);
        self.routes.retain(|_, nodes| {
            nodes.remove(node_id);
            !nodes.is_empty()
        });
        debug!(node = %node_id, "Node unregistered");
        Ok(())
    }

    async fn subscribe(&self, channel: &str, node_id: &str) -> Result<(), StoreError> {
        self.check()?;
        self.routes
            .entry(channel.to_string())
            .or_default()
            .insert(node_id.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, node_id: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut nodes) = self.routes.get_mut(channel) {
            nodes.remove(node_id);
        }
        self.routes.remove_if(channel, |_, nodes| nodes.is_empty());
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Bytes,
        info: Option<ClientInfo>,
        history: &HistoryOptions,
    ) -> Result<Published, StoreError> {
        self.check()?;

        // The route entry guard serializes append and fan-out per channel,
        // so nodes observe publications in offset order.
        let nodes = self.routes.entry(channel.to_string()).or_default();

        let history_writable = self.history_writable.load(Ordering::SeqCst);
        let published = if history.enabled() && history_writable {
            let (publication, position) = self.history.append(channel, payload, info, history);
            Published {
                publication,
                position: Some(position),
            }
        } else {
            Published {
                publication: Publication::new(channel, payload).with_info(info),
                position: None,
            }
        };

        self.fan_out(&nodes, &Push::Publication(published.publication.clone()));
        trace!(channel = %channel, nodes = nodes.len(), offset = published.publication.offset, "Fanned out publication");
        drop(nodes);

        if history.enabled() && !history_writable {
            return Err(StoreError::Unavailable(format!(
                "history write failed for channel {channel}"
            )));
        }
        Ok(published)
    }

    async fn broadcast(&self, push: Push) -> Result<(), StoreError> {
        self.check()?;
        let Some(channel) = push.channel() else {
            return Ok(());
        };
        if let Some(nodes) = self.routes.get(channel) {
            self.fan_out(&nodes, &push);
        }
        Ok(())
    }

    async fn history(
        &self,
        channel: &str,
        since: u64,
    ) -> Result<(Vec<Publication>, StreamPosition), StoreError> {
        self.check()?;
        Ok(self.history.read(channel, since))
    }

    async fn add_presence(&self, channel: &str, info: &ClientInfo) -> Result<(), StoreError> {
        self.check()?;
        self.presence
            .entry(channel.to_string())
            .or_default()
            .join(info);
        Ok(())
    }

    async fn remove_presence(&self, channel: &str, client_id: &str) -> Result<(), StoreError> {
        self.check()?;
        if let Some(mut set) = self.presence.get_mut(channel) {
            set.leave(client_id);
        }
        self.presence.remove_if(channel, |_, set| set.is_empty());
        Ok(())
    }

    async fn refresh_presence(&self, channel: &str, client_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self
            .presence
            .get_mut(channel)
            .map(|mut set| set.refresh(client_id))
            .unwrap_or(false))
    }

    async fn presence(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> Result<Vec<PresenceEntry>, StoreError> {
        self.check()?;
        Ok(self
            .presence
            .get(channel)
            .map(|set| set.snapshot(timeout))
            .unwrap_or_default())
    }

    async fn remove_expired(&self, presence_timeout: Duration) -> Result<usize, StoreError> {
        self.check()?;
        let mut removed = self.history.remove_expired();
        self.presence.retain(|channel, set| {
            let pruned = set.prune_stale(presence_timeout);
            if !pruned.is_empty() {
                debug!(channel = %channel, pruned = pruned.len(), "Pruned stale presence");
            }
            removed += pruned.len();
            !set.is_empty()
        });
        self.routes.retain(|_, nodes| !nodes.is_empty());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> ClientInfo {
        ClientInfo {
            user_id: "42".into(),
            client_id: id.into(),
            conn_info: None,
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_routed_nodes() {
        let store = MemoryStore::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        store.register_node("node-a", tx_a).await.unwrap();
        store.register_node("node-b", tx_b).await.unwrap();
        store.subscribe("news", "node-a").await.unwrap();

        let published = store
            .publish("news", Bytes::from_static(b"hi"), None, &HistoryOptions::default())
            .await
            .unwrap();
        assert_eq!(published.publication.offset, 1);
        assert_eq!(published.position.unwrap().offset, 1);

        match rx_a.try_recv().unwrap() {
            Push::Publication(p) => assert_eq!(p.offset, 1),
            other => panic!("unexpected push {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_history_has_no_offset() {
        let store = MemoryStore::default();
        let published = store
            .publish("news", Bytes::from_static(b"hi"), None, &HistoryOptions::NONE)
            .await
            .unwrap();
        assert_eq!(published.publication.offset, 0);
        assert!(published.position.is_none());
        assert!(store.history("news", 0).await.unwrap().0.is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_still_fans_out() {
        let store = MemoryStore::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.register_node("node-a", tx).await.unwrap();
        store.subscribe("news", "node-a").await.unwrap();
        store.set_history_writable(false);

        let result = store
            .publish("news", Bytes::from_static(b"hi"), None, &HistoryOptions::default())
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_connection_lost() {
        let store = MemoryStore::default();
        store.set_reachable(false);
        assert_eq!(store.handshake().await, Err(StoreError::ConnectionLost));
        assert_eq!(
            store.add_presence("news", &client("conn-1")).await,
            Err(StoreError::ConnectionLost)
        );

        store.set_reachable(true);
        assert!(store.handshake().await.is_ok());
    }

    #[tokio::test]
    async fn test_routes_are_removed_with_node() {
        let store = MemoryStore::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        store.register_node("node-a", tx).await.unwrap();
        store.subscribe("news", "node-a").await.unwrap();
        store.subscribe("news", "node-a").await.unwrap();
        assert_eq!(store.routed_nodes("news"), 1);

        store.unregister_node("node-a").await.unwrap();
        assert_eq!(store.routed_nodes("news"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_expiry() {
        let store = MemoryStore::default();
        let timeout = Duration::from_secs(10);
        store.add_presence("news", &client("conn-1")).await.unwrap();
        store.add_presence("news", &client("conn-1")).await.unwrap();
        store.add_presence("news", &client("conn-2")).await.unwrap();
        assert_eq!(store.presence("news", timeout).await.unwrap().len(), 2);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.refresh_presence("news", "conn-2").await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.remove_expired(timeout).await.unwrap(), 1);
        let live = store.presence("news", timeout).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].client_id, "conn-2");
    }
}
