//! Presence tracking for Courier.
//!
//! A [`PresenceSet`] records which connections are currently subscribed to
//! one channel. Entries must be refreshed periodically; an entry not
//! refreshed within the staleness window is considered gone.

use crate::message::{now_millis, ClientInfo};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Presence of one connection in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    /// Connection ID.
    pub client_id: String,
    /// User the connection authenticated as.
    pub user_id: String,
    /// Connection info blob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Bytes>,
    /// When the connection joined, in milliseconds since the Unix epoch.
    pub joined_at: u64,
    /// Last liveness refresh.
    #[serde(skip)]
    pub refreshed_at: Instant,
}

impl PresenceEntry {
    /// Create an entry for a client.
    #[must_use]
    pub fn new(info: &ClientInfo) -> Self {
        Self {
            client_id: info.client_id.clone(),
            user_id: info.user_id.clone(),
            conn_info: info.conn_info.clone(),
            joined_at: now_millis(),
            refreshed_at: Instant::now(),
        }
    }

    /// Check if this entry missed its refresh window.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.refreshed_at) > timeout
    }
}

/// Presence tracker for one channel.
#[derive(Debug, Default)]
pub struct PresenceSet {
    /// Map of connection ID to presence entry.
    members: HashMap<String, PresenceEntry>,
}

impl PresenceSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of present members.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Check if a connection is present.
    #[must_use]
    pub fn is_present(&self, client_id: &str) -> bool {
        self.members.contains_key(client_id)
    }

    /// Insert or refresh a member.
    ///
    /// Returns `true` if this is a new member, `false` if updating existing.
    pub fn join(&mut self, info: &ClientInfo) -> bool {
        match self.members.get_mut(&info.client_id) {
            Some(entry) => {
                entry.user_id = info.user_id.clone();
                entry.conn_info = info.conn_info.clone();
                entry.refreshed_at = Instant::now();
                false
            }
            None => {
                self.members
                    .insert(info.client_id.clone(), PresenceEntry::new(info));
                debug!(client = %info.client_id, "Presence: member joined");
                true
            }
        }
    }

    /// Remove a member from presence.
    ///
    /// Returns the removed entry, if any.
    pub fn leave(&mut self, client_id: &str) -> Option<PresenceEntry> {
        let entry = self.members.remove(client_id);
        if entry.is_some() {
            debug!(client = %client_id, "Presence: member left");
        }
        entry
    }

    /// Refresh a member's liveness. Returns `false` if it is not present.
    pub fn refresh(&mut self, client_id: &str) -> bool {
        match self.members.get_mut(client_id) {
            Some(entry) => {
                entry.refreshed_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Members that are not stale.
    #[must_use]
    pub fn snapshot(&self, timeout: Duration) -> Vec<PresenceEntry> {
        let now = Instant::now();
        self.members
            .values()
            .filter(|entry| !entry.is_stale(timeout, now))
            .cloned()
            .collect()
    }

    /// Remove stale members.
    ///
    /// Returns the list of removed connection IDs.
    pub fn prune_stale(&mut self, timeout: Duration) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .members
            .iter()
            .filter(|(_, entry)| entry.is_stale(timeout, now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            self.members.remove(id);
            debug!(client = %id, "Presence: pruned stale member");
        }

        stale
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn client(id: &str) -> ClientInfo {
        ClientInfo {
            user_id: "42".into(),
            client_id: id.into(),
            conn_info: Some(Bytes::from_static(br#"{"name": "Alexander"}"#)),
        }
    }

    #[tokio::test]
    async fn test_presence_join_leave() {
        let mut presence = PresenceSet::new();

        assert!(presence.join(&client("conn-1")));
        assert!(!presence.join(&client("conn-1")));

        assert_eq!(presence.count(), 1);
        assert!(presence.is_present("conn-1"));
        assert_eq!(presence.snapshot(TIMEOUT).len(), 1);

        assert!(presence.leave("conn-1").is_some());
        assert!(presence.leave("conn-1").is_none());
        assert!(presence.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_refresh_and_prune() {
        let mut presence = PresenceSet::new();
        presence.join(&client("conn-1"));
        presence.join(&client("conn-2"));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(presence.refresh("conn-1"));
        assert!(!presence.refresh("conn-3"));

        tokio::time::advance(Duration::from_secs(40)).await;
        let live: Vec<String> = presence
            .snapshot(TIMEOUT)
            .into_iter()
            .map(|e| e.client_id)
            .collect();
        assert_eq!(live, vec!["conn-1".to_string()]);

        assert_eq!(presence.prune_stale(TIMEOUT), vec!["conn-2".to_string()]);
        assert_eq!(presence.count(), 1);
    }

    #[tokio::test]
    async fn test_presence_entry_serializes_without_instant() {
        let entry = PresenceEntry::new(&client("conn-1"));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["client_id"], "conn-1");
        assert!(value.get("refreshed_at").is_none());
    }
}
