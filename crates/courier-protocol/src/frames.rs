//! Frame types for the Courier protocol.
//!
//! Frames are the fundamental unit of communication between a client and a
//! gateway node. Requests carry an `id` that the matching reply echoes;
//! pushes (`publication`, `join`, `leave`, `disconnect`) carry none.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Subscribe = 0x03,
    Subscribed = 0x04,
    Unsubscribe = 0x05,
    Publish = 0x06,
    PublishOk = 0x07,
    Publication = 0x08,
    Join = 0x09,
    Leave = 0x0A,
    Presence = 0x0B,
    PresenceReply = 0x0C,
    Ack = 0x0D,
    Error = 0x0E,
    Ping = 0x0F,
    Pong = 0x10,
    Disconnect = 0x11,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Subscribe),
            0x04 => Ok(FrameType::Subscribed),
            0x05 => Ok(FrameType::Unsubscribe),
            0x06 => Ok(FrameType::Publish),
            0x07 => Ok(FrameType::PublishOk),
            0x08 => Ok(FrameType::Publication),
            0x09 => Ok(FrameType::Join),
            0x0A => Ok(FrameType::Leave),
            0x0B => Ok(FrameType::Presence),
            0x0C => Ok(FrameType::PresenceReply),
            0x0D => Ok(FrameType::Ack),
            0x0E => Ok(FrameType::Error),
            0x0F => Ok(FrameType::Ping),
            0x10 => Ok(FrameType::Pong),
            0x11 => Ok(FrameType::Disconnect),
            _ => Err("Invalid frame type"),
        }
    }
}

/// Position in a channel's history stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub offset: u64,
    pub epoch: String,
}

/// Identity of a client as seen by other subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientDetails {
    pub user: String,
    pub client: String,
    /// Connection info supplied at connect time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

/// A publication as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationData {
    pub offset: u64,
    /// Server time in milliseconds.
    pub timestamp: u64,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientDetails>,
}

/// One entry of a presence reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceData {
    pub client: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
    /// Join time in milliseconds.
    pub joined_at: u64,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial connection handshake.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// User to authenticate as; the server default applies when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        /// Arbitrary connection info shown to other subscribers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
    },

    /// Connection established response.
    #[serde(rename = "connected")]
    Connected {
        /// Unique client identifier.
        client_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Subscribe to a channel.
    #[serde(rename = "subscribe")]
    Subscribe {
        id: u64,
        channel: String,
        /// Last position seen, to recover missed publications.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<Position>,
    },

    /// Subscription established.
    #[serde(rename = "subscribed")]
    Subscribed {
        id: u64,
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        publications: Vec<PublicationData>,
        #[serde(default)]
        recovered: bool,
    },

    /// Unsubscribe from a channel.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { id: u64, channel: String },

    /// Publish a message to a channel.
    #[serde(rename = "publish")]
    Publish {
        id: u64,
        channel: String,
        /// JSON message payload.
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Publish accepted.
    #[serde(rename = "publish_ok")]
    PublishOk { id: u64, offset: u64, epoch: String },

    /// Publication pushed to a subscriber.
    #[serde(rename = "publication")]
    Publication {
        channel: String,
        publication: PublicationData,
    },

    /// A client joined a channel.
    #[serde(rename = "join")]
    Join { channel: String, info: ClientDetails },

    /// A client left a channel.
    #[serde(rename = "leave")]
    Leave { channel: String, info: ClientDetails },

    /// Query channel presence.
    #[serde(rename = "presence")]
    Presence { id: u64, channel: String },

    /// Presence query result.
    #[serde(rename = "presence_reply")]
    PresenceReply {
        id: u64,
        channel: String,
        clients: Vec<PresenceData>,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack { id: u64 },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Server is closing the connection.
    #[serde(rename = "disconnect")]
    Disconnect {
        code: u32,
        reason: String,
        reconnect: bool,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Subscribed { .. } => FrameType::Subscribed,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::PublishOk { .. } => FrameType::PublishOk,
            Frame::Publication { .. } => FrameType::Publication,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Presence { .. } => FrameType::Presence,
            Frame::PresenceReply { .. } => FrameType::PresenceReply,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Disconnect { .. } => FrameType::Disconnect,
        }
    }

    /// Request ID for frames that carry one.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Subscribe { id, .. }
            | Frame::Subscribed { id, .. }
            | Frame::Unsubscribe { id, .. }
            | Frame::Publish { id, .. }
            | Frame::PublishOk { id, .. }
            | Frame::Presence { id, .. }
            | Frame::PresenceReply { id, .. }
            | Frame::Ack { id }
            | Frame::Error { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, user: Option<String>) -> Self {
        Frame::Connect {
            version,
            user,
            info: None,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(client_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            client_id: client_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            channel: channel.into(),
            since: None,
        }
    }

    /// Create a new Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(id: u64, channel: impl Into<String>) -> Self {
        Frame::Unsubscribe {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(id: u64, channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Publish {
            id,
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type() {
        let subscribe = Frame::subscribe(1, "news");
        assert_eq!(subscribe.frame_type(), FrameType::Subscribe);

        let publish = Frame::publish(2, "news", br#"{"input":"hi"}"#.to_vec());
        assert_eq!(publish.frame_type(), FrameType::Publish);
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x06), Ok(FrameType::Publish));
        assert_eq!(u8::from(FrameType::Disconnect), 0x11);
        assert!(FrameType::try_from(0x00).is_err());
        assert!(FrameType::try_from(0x12).is_err());
    }

    #[test]
    fn test_request_id() {
        assert_eq!(Frame::subscribe(7, "news").request_id(), Some(7));
        assert_eq!(Frame::error(9, 103, "permission denied").request_id(), Some(9));
        assert_eq!(Frame::ping().request_id(), None);
        assert_eq!(
            Frame::Join {
                channel: "news".into(),
                info: ClientDetails {
                    user: "42".into(),
                    client: "conn_1".into(),
                    info: None,
                },
            }
            .request_id(),
            None
        );
    }
}
