//! Message types for Courier.
//!
//! Publications carry the payload and stream offset assigned at publish
//! time. Pushes are what a session's transport receives asynchronously.

use crate::error::Error;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Credentials attached to a connection before it is authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Opaque user identifier.
    pub user_id: String,
    /// Arbitrary connection info blob.
    pub info: Option<Bytes>,
}

impl Credentials {
    /// Create credentials for a user.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            info: None,
        }
    }

    /// Attach a connection info blob.
    #[must_use]
    pub fn with_info(mut self, info: impl Into<Bytes>) -> Self {
        self.info = Some(info.into());
        self
    }
}

/// Identity of the client a publication or presence entry originates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub user_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Bytes>,
}

/// Position in a channel stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    /// Offset of the last publication in the stream.
    pub offset: u64,
    /// Identifies one incarnation of the stream.
    pub epoch: String,
}

/// A message published into a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Target channel.
    pub channel: String,
    /// Stream offset; zero when the publication was not kept in history.
    pub offset: u64,
    /// Message payload.
    pub payload: Bytes,
    /// Publish time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Origin client, if published by one.
    pub info: Option<ClientInfo>,
}

impl Publication {
    /// Create a publication without a stream offset.
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            offset: 0,
            payload: payload.into(),
            timestamp: now_millis(),
            info: None,
        }
    }

    /// Attach the origin client.
    #[must_use]
    pub fn with_info(mut self, info: Option<ClientInfo>) -> Self {
        self.info = info;
        self
    }
}

/// Reason a session was disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub code: u32,
    pub reason: &'static str,
    /// Whether the client is expected to reconnect.
    pub reconnect: bool,
}

impl Disconnect {
    pub const CONNECTION_CLOSED: Disconnect = Disconnect {
        code: 3000,
        reason: "connection closed",
        reconnect: true,
    };
    pub const SHUTDOWN: Disconnect = Disconnect {
        code: 3001,
        reason: "server shutdown",
        reconnect: true,
    };
    pub const FORCE: Disconnect = Disconnect {
        code: 3002,
        reason: "force disconnect",
        reconnect: false,
    };
    pub const UNAUTHORIZED: Disconnect = Disconnect {
        code: 3500,
        reason: "unauthorized",
        reconnect: false,
    };
    pub const BAD_REQUEST: Disconnect = Disconnect {
        code: 3501,
        reason: "bad request",
        reconnect: false,
    };
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

/// Asynchronous message delivered to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    Publication(Publication),
    Join { channel: String, info: ClientInfo },
    Leave { channel: String, info: ClientInfo },
    Disconnect(Disconnect),
}

impl Push {
    /// Channel the push belongs to, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Push::Publication(p) => Some(&p.channel),
            Push::Join { channel, .. } | Push::Leave { channel, .. } => Some(channel),
            Push::Disconnect(_) => None,
        }
    }
}

/// Payload schema accepted from publishing clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Server-stamped on publish; client values are discarded.
    #[serde(default)]
    pub timestamp: i64,
    pub input: String,
}

impl ClientMessage {
    /// Validate a client payload and stamp the server time into it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadRequest`] if the payload is not a JSON object
    /// with a string `input` field.
    pub fn normalize(payload: &[u8]) -> Result<Bytes, Error> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| Error::BadRequest(e.to_string()))?;
        if !value.is_object() {
            return Err(Error::BadRequest("message must be a JSON object".into()));
        }
        let mut msg: ClientMessage =
            serde_json::from_value(value).map_err(|e| Error::BadRequest(e.to_string()))?;
        msg.timestamp = now_secs();
        serde_json::to_vec(&msg)
            .map(Bytes::from)
            .map_err(|e| Error::BadRequest(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_stamps_server_time() {
        let before = now_secs();
        let data = ClientMessage::normalize(br#"{"timestamp": 1, "input": "hello"}"#).unwrap();
        let msg: ClientMessage = serde_json::from_slice(&data).unwrap();

        assert_eq!(msg.input, "hello");
        assert!(msg.timestamp >= before);
    }

    #[test]
    fn test_normalize_rejects_bad_payloads() {
        assert!(matches!(
            ClientMessage::normalize(br#"{"input": 5}"#),
            Err(Error::BadRequest(_))
        ));
        assert!(ClientMessage::normalize(b"not json").is_err());
        assert!(ClientMessage::normalize(br#"["hello"]"#).is_err());
        assert!(ClientMessage::normalize(br#"{"timestamp": 1}"#).is_err());
    }

    #[test]
    fn test_normalize_rejects_arrays_in_field_order() {
        for payload in [&br#"[0, "hi"]"#[..], br#"[123, "hi"]"#, br#""hi""#] {
            assert!(matches!(
                ClientMessage::normalize(payload),
                Err(Error::BadRequest(_))
            ));
        }
    }

    #[test]
    fn test_publication_builder() {
        let info = ClientInfo {
            user_id: "42".into(),
            client_id: "conn-1".into(),
            conn_info: None,
        };
        let publication = Publication::new("news", b"hi".to_vec()).with_info(Some(info.clone()));

        assert_eq!(publication.offset, 0);
        assert_eq!(publication.info, Some(info));
        assert!(publication.timestamp > 0);
    }

    #[test]
    fn test_push_channel() {
        let push = Push::Publication(Publication::new("news", Bytes::new()));
        assert_eq!(push.channel(), Some("news"));
        assert_eq!(Push::Disconnect(Disconnect::SHUTDOWN).channel(), None);
    }
}
