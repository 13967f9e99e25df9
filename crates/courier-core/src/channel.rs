//! Local channel membership.
//!
//! A [`Channel`] holds the sessions of this node subscribed to a channel
//! together with the sink each session reads pushes from.

use crate::message::Push;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Maximum channel name length in bytes.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// A channel identifier. Names are compared exactly.
pub type ChannelId = String;

/// Outbound push queue of one session.
pub type PushSender = mpsc::UnboundedSender<Push>;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    Ok(())
}

/// Sessions of this node subscribed to one channel.
#[derive(Debug)]
pub struct Channel {
    name: ChannelId,
    subscribers: HashMap<String, PushSender>,
}

impl Channel {
    /// Create an empty channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self {
            name: name.into(),
            subscribers: HashMap::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of local subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a session is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, client_id: &str) -> bool {
        self.subscribers.contains_key(client_id)
    }

    /// Add a session. Returns `true` if it was not subscribed yet.
    pub fn subscribe(&mut self, client_id: impl Into<String>, sink: PushSender) -> bool {
        let client_id = client_id.into();
        let added = self.subscribers.insert(client_id.clone(), sink).is_none();
        debug!(channel = %self.name, client = %client_id, "Local subscriber added");
        added
    }

    /// Remove a session. Returns `true` if it was subscribed.
    pub fn unsubscribe(&mut self, client_id: &str) -> bool {
        let removed = self.subscribers.remove(client_id).is_some();
        if removed {
            debug!(channel = %self.name, client = %client_id, "Local subscriber removed");
        }
        removed
    }

    /// Deliver a push to every local subscriber.
    ///
    /// Returns the number of sessions the push was queued for.
    pub fn deliver(&self, push: &Push) -> usize {
        let delivered = self
            .subscribers
            .values()
            .filter(|sink| sink.send(push.clone()).is_ok())
            .count();
        trace!(channel = %self.name, delivered, "Delivered push");
        delivered
    }

    /// Check if the channel has no local subscribers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Publication;

    #[test]
    fn test_channel_subscribe_unsubscribe() {
        let mut channel = Channel::new("news");
        let (tx, _rx) = mpsc::unbounded_channel();

        assert!(channel.subscribe("conn-1", tx.clone()));
        assert!(!channel.subscribe("conn-1", tx.clone()));
        assert!(channel.subscribe("conn-2", tx));
        assert_eq!(channel.subscriber_count(), 2);

        assert!(channel.unsubscribe("conn-1"));
        assert!(!channel.unsubscribe("conn-1"));
        assert!(!channel.is_subscribed("conn-1"));
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("news").is_ok());
        assert!(validate_channel_name("$anything:goes*").is_ok());
        assert!(validate_channel_name("").is_err());

        let long_name = "a".repeat(MAX_CHANNEL_NAME_LENGTH + 1);
        assert!(validate_channel_name(&long_name).is_err());
    }

    #[test]
    fn test_channel_deliver_skips_closed_sinks() {
        let mut channel = Channel::new("news");
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        channel.subscribe("conn-1", tx1);
        channel.subscribe("conn-2", tx2);
        drop(rx2);

        let push = Push::Publication(Publication::new("news", b"hello".to_vec()));
        assert_eq!(channel.deliver(&push), 1);
        assert_eq!(rx1.try_recv().unwrap(), push);
    }
}
