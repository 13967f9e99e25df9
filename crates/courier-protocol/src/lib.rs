//! # courier-protocol
//!
//! Wire protocol spoken between Courier clients and gateway nodes.
//!
//! Frames are MessagePack maps tagged by `type`, each preceded by a 4-byte
//! big-endian length.
//!
//! ## Frame Types
//!
//! - `Connect` / `Connected` - Handshake and version negotiation
//! - `Subscribe` / `Subscribed` / `Unsubscribe` - Channel membership and recovery
//! - `Publish` / `PublishOk` - Send messages to channels
//! - `Publication` / `Join` / `Leave` / `Disconnect` - Server pushes
//! - `Presence` / `PresenceReply` - Who is in a channel
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! let frame = Frame::publish(1, "news", br#"{"input":"hello"}"#.to_vec());
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{ClientDetails, Frame, FrameType, Position, PresenceData, PublicationData};
pub use version::{negotiate, Version, PROTOCOL_VERSION};
