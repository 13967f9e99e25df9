//! Cluster-wide presence.
//!
//! Presence entries live in the store of the shard owning the channel, so
//! every node sees the same set. Reads are snapshots and only eventually
//! consistent across nodes.

use crate::error::Result;
use crate::message::ClientInfo;
use crate::presence::PresenceEntry;
use crate::shard::ShardRing;
use std::time::Duration;
use tracing::{debug, warn};

/// Default staleness window.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(60);

/// Routes presence operations to the owning shard.
#[derive(Debug, Clone)]
pub struct PresenceManager {
    ring: ShardRing,
    ttl: Duration,
}

impl PresenceManager {
    /// Create a manager; entries not refreshed within `ttl` are stale.
    #[must_use]
    pub fn new(ring: ShardRing, ttl: Duration) -> Self {
        Self { ring, ttl }
    }

    /// Staleness window.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or refresh the entry of a client.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down or the store rejects the write.
    pub async fn join(&self, channel: &str, info: &ClientInfo) -> Result<()> {
        self.ring.get(channel).add_presence(channel, info).await?;
        debug!(channel = %channel, client = %info.client_id, "Presence joined");
        Ok(())
    }

    /// Remove the entry of a client. No-op if absent.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down or the store rejects the write.
    pub async fn leave(&self, channel: &str, client_id: &str) -> Result<()> {
        self.ring
            .get(channel)
            .remove_presence(channel, client_id)
            .await?;
        debug!(channel = %channel, client = %client_id, "Presence left");
        Ok(())
    }

    /// Keep the entry of a client alive.
    ///
    /// Returns `false` if the entry was already gone.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down or the store rejects the write.
    pub async fn refresh(&self, channel: &str, client_id: &str) -> Result<bool> {
        self.ring
            .get(channel)
            .refresh_presence(channel, client_id)
            .await
    }

    /// Snapshot of the live entries of a channel.
    ///
    /// # Errors
    ///
    /// Fails if the owning shard is down or the store rejects the read.
    pub async fn list(&self, channel: &str) -> Result<Vec<PresenceEntry>> {
        self.ring.get(channel).presence(channel, self.ttl).await
    }

    /// Sweep stale entries on every healthy shard.
    ///
    /// Returns the number of entries (presence and history) removed.
    pub async fn remove_stale(&self) -> usize {
        let mut removed = 0;
        for shard in self.ring.shards() {
            if !shard.is_up() {
                continue;
            }
            match shard.remove_expired(self.ttl).await {
                Ok(count) => removed += count,
                Err(e) => warn!(shard = %shard.name(), error = %e, "Expiry sweep failed"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::Shard;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn client(id: &str) -> ClientInfo {
        ClientInfo {
            user_id: "42".into(),
            client_id: id.into(),
            conn_info: None,
        }
    }

    async fn manager(ttl: Duration) -> PresenceManager {
        let shards = vec![
            Shard::new("s0", Arc::new(MemoryStore::default())),
            Shard::new("s1", Arc::new(MemoryStore::default())),
        ];
        for shard in &shards {
            shard.connect().await.unwrap();
        }
        PresenceManager::new(ShardRing::new(shards).unwrap(), ttl)
    }

    #[tokio::test]
    async fn test_join_is_upsert() {
        let presence = manager(DEFAULT_PRESENCE_TTL).await;
        presence.join("news", &client("conn-1")).await.unwrap();
        presence.join("news", &client("conn-1")).await.unwrap();
        presence.join("news", &client("conn-2")).await.unwrap();

        let mut ids: Vec<String> = presence
            .list("news")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["conn-1".to_string(), "conn-2".to_string()]);

        presence.leave("news", "conn-1").await.unwrap();
        presence.leave("news", "conn-1").await.unwrap();
        assert_eq!(presence.list("news").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins() {
        let presence = manager(DEFAULT_PRESENCE_TTL).await;
        let joins = (0..32).map(|i| {
            let presence = presence.clone();
            tokio::spawn(async move {
                presence
                    .join("news", &client(&format!("conn-{i}")))
                    .await
                    .unwrap();
            })
        });
        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(presence.list("news").await.unwrap().len(), 32);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefreshed_entries_are_swept() {
        let presence = manager(Duration::from_secs(10)).await;
        presence.join("news", &client("conn-1")).await.unwrap();
        presence.join("news", &client("conn-2")).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(presence.refresh("news", "conn-2").await.unwrap());
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(presence.remove_stale().await, 1);
        let live = presence.list("news").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].client_id, "conn-2");
        assert!(!presence.refresh("news", "conn-1").await.unwrap());
    }
}
