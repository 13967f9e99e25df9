//! # courier-core
//!
//! Sessions, history, presence and the sharded broker of the Courier
//! realtime gateway.
//!
//! This crate provides the building blocks a gateway node is made of:
//!
//! - **Session** - Per-connection state machine and client operations
//! - **Broker** - Routes publications across nodes through the owning shard
//! - **History** - Bounded per-channel publication log with offsets
//! - **Presence** - Cluster-wide record of who is subscribed where
//! - **Shard** - Health-tracked store connection with reconnect
//! - **Node** - Owns all of the above and runs the background loops
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Broker    │────▶│ ShardRing   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   ▲                   │
//!        ▼                   │                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Presence   │     │  Node loop  │◀────│    Store    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod broker;
pub mod channel;
pub mod error;
pub mod handler;
pub mod history;
pub mod message;
pub mod node;
pub mod presence;
pub mod presence_manager;
pub mod session;
pub mod shard;
pub mod store;

pub use broker::{Broker, PublishResult, Recovery};
pub use channel::{Channel, ChannelId};
pub use error::{Error, Result, StoreError};
pub use handler::{EventHandler, NoopHandler};
pub use history::{HistoryBuffer, HistoryOptions};
pub use message::{ClientInfo, ClientMessage, Credentials, Disconnect, Publication, Push, StreamPosition};
pub use node::{Node, NodeConfig};
pub use presence::PresenceEntry;
pub use presence_manager::PresenceManager;
pub use session::{
    ConnectReply, Session, SessionState, SubscribeOptions, SubscribeRequest, SubscribeResult,
};
pub use shard::{BackoffConfig, Shard, ShardHealth, ShardRing};
pub use store::{MemoryStore, Store};
