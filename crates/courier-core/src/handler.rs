//! Lifecycle callbacks.
//!
//! A node invokes its [`EventHandler`] synchronously from the session state
//! machine. Handlers returning an error reject the operation; the error is
//! reported to the originating session only.

use crate::error::Result;
use crate::message::Disconnect;
use crate::session::SubscribeOptions;
use bytes::Bytes;

#[derive(Debug, Clone, Copy)]
pub struct ConnectEvent<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub conn_info: Option<&'a Bytes>,
}

#[derive(Debug, Clone, Copy)]
pub struct SubscribeEvent<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub channel: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct UnsubscribeEvent<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub channel: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct PublishEvent<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub channel: &'a str,
    /// Payload after validation and timestamp stamping.
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceEvent<'a> {
    pub client_id: &'a str,
    pub user_id: &'a str,
    pub channel: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct DisconnectEvent<'a> {
    pub client_id: &'a str,
    /// Empty when the session never authenticated.
    pub user_id: &'a str,
    pub disconnect: Disconnect,
}

/// Typed lifecycle callbacks. Every method has a permissive default.
pub trait EventHandler: Send + Sync + 'static {
    /// Called after credentials were accepted.
    fn on_connect(&self, _event: &ConnectEvent<'_>) -> Result<()> {
        Ok(())
    }

    /// Called before a subscription is created; returns its options.
    fn on_subscribe(
        &self,
        _event: &SubscribeEvent<'_>,
        defaults: SubscribeOptions,
    ) -> Result<SubscribeOptions> {
        Ok(defaults)
    }

    fn on_unsubscribe(&self, _event: &UnsubscribeEvent<'_>) {}

    /// Called after payload validation, before the broker publish.
    fn on_publish(&self, _event: &PublishEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn on_presence(&self, _event: &PresenceEvent<'_>) -> Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _event: &DisconnectEvent<'_>) {}
}

/// Handler accepting everything with default options.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}
