//! Client sessions.
//!
//! A [`Session`] is the server side of one client connection. It moves
//! `Connecting → Connected → Disconnected` and owns the client's channel
//! subscriptions. The session lock is only held to validate and commit
//! local state; broker and presence calls run without it, so a slow shard
//! never blocks teardown of the session.

use crate::broker::PublishResult;
use crate::channel::{validate_channel_name, ChannelId, PushSender};
use crate::error::{Error, Result};
use crate::handler::{
    ConnectEvent, DisconnectEvent, PresenceEvent, PublishEvent, SubscribeEvent, UnsubscribeEvent,
};
use crate::message::{ClientInfo, ClientMessage, Credentials, Disconnect, Publication, Push, StreamPosition};
use crate::node::NodeShared;
use crate::presence::PresenceEntry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Per-subscription behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Track the client in channel presence.
    pub presence: bool,
    /// Announce join and leave to other subscribers.
    pub join_leave: bool,
    /// Allow history recovery on resubscribe.
    pub recover: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            presence: true,
            join_leave: true,
            recover: true,
        }
    }
}

/// Client parameters of a subscribe request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Last position the client saw, when resubscribing.
    pub since: Option<StreamPosition>,
}

/// Reply to a successful subscribe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeResult {
    /// Stream position, present when recovery is enabled.
    pub position: Option<StreamPosition>,
    /// Publications missed since the requested position.
    pub publications: Vec<Publication>,
    /// Whether every missed publication was recovered.
    pub recovered: bool,
}

/// Reply to a successful connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectReply {
    pub client_id: String,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    credentials: Option<Credentials>,
    subscriptions: HashMap<ChannelId, SubscribeOptions>,
}

impl SessionInner {
    fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        self.credentials.as_ref().map(|c| ClientInfo {
            user_id: c.user_id.clone(),
            client_id: client_id.to_string(),
            conn_info: c.info.clone(),
        })
    }

    fn connected_info(&self, client_id: &str) -> Result<ClientInfo> {
        if self.state != SessionState::Connected {
            return Err(Error::NotConnected);
        }
        self.client_info(client_id).ok_or(Error::NotConnected)
    }
}

/// Server side of one client connection.
pub struct Session {
    id: String,
    node: Arc<NodeShared>,
    outbox: PushSender,
    inner: Mutex<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(id: String, node: Arc<NodeShared>, outbox: PushSender) -> Self {
        Self {
            id,
            node,
            outbox,
            inner: Mutex::new(SessionInner {
                state: SessionState::Connecting,
                credentials: None,
                subscriptions: HashMap::new(),
            }),
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.lock().subscriptions.contains_key(channel)
    }

    /// Channels the session is subscribed to.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelId> {
        self.inner.lock().subscriptions.keys().cloned().collect()
    }

    /// Authenticate the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when credentials are missing or rejected; the
    /// session is then disconnected.
    pub fn connect(&self, credentials: Option<Credentials>) -> Result<ConnectReply> {
        let credentials = {
            let mut inner = self.inner.lock();
            match inner.state {
                SessionState::Connecting => {}
                SessionState::Connected => {
                    return Err(Error::BadRequest("already connected".into()))
                }
                SessionState::Disconnected => return Err(Error::NotConnected),
            }
            match credentials.filter(|c| !c.user_id.is_empty()) {
                Some(credentials) => credentials,
                None => {
                    inner.state = SessionState::Disconnected;
                    drop(inner);
                    self.reject_connect();
                    return Err(Error::Auth);
                }
            }
        };

        let event = ConnectEvent {
            client_id: &self.id,
            user_id: &credentials.user_id,
            conn_info: credentials.info.as_ref(),
        };
        if let Err(e) = self.node.handler.on_connect(&event) {
            self.inner.lock().state = SessionState::Disconnected;
            self.reject_connect();
            return Err(e);
        }

        let mut inner = self.inner.lock();
        if inner.state != SessionState::Connecting {
            return Err(Error::NotConnected);
        }
        info!(client = %self.id, user = %credentials.user_id, "Session connected");
        inner.credentials = Some(credentials);
        inner.state = SessionState::Connected;
        Ok(ConnectReply {
            client_id: self.id.clone(),
        })
    }

    fn reject_connect(&self) {
        warn!(client = %self.id, "Session authentication failed");
        self.node.sessions.remove(&self.id);
        let _ = self.outbox.send(Push::Disconnect(Disconnect::UNAUTHORIZED));
        self.node.handler.on_disconnect(&DisconnectEvent {
            client_id: &self.id,
            user_id: "",
            disconnect: Disconnect::UNAUTHORIZED,
        });
    }

    /// Subscribe to a channel. Subscribing twice is a successful no-op.
    ///
    /// # Errors
    ///
    /// Fails if the session is not connected, the channel name is invalid,
    /// the handler rejects the subscription, or the owning shard is down.
    pub async fn subscribe(
        &self,
        channel: &str,
        request: SubscribeRequest,
    ) -> Result<SubscribeResult> {
        validate_channel_name(channel).map_err(|e| Error::BadRequest(e.to_string()))?;

        let info = {
            let inner = self.inner.lock();
            let info = inner.connected_info(&self.id)?;
            if inner.subscriptions.contains_key(channel) {
                debug!(client = %self.id, channel = %channel, "Already subscribed");
                return Ok(SubscribeResult::default());
            }
            info
        };

        let options = self.node.handler.on_subscribe(
            &SubscribeEvent {
                client_id: &self.id,
                user_id: &info.user_id,
                channel,
            },
            self.node.config.subscribe_options,
        )?;

        self.node
            .broker
            .attach(channel, &self.id, self.outbox.clone())
            .await?;

        let result = match self.join_channel(channel, &info, options, &request).await {
            Ok(result) => result,
            Err(e) => {
                self.leave_channel(channel, &info, options).await;
                return Err(e);
            }
        };

        let committed = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Connected {
                inner.subscriptions.insert(channel.to_string(), options);
                true
            } else {
                false
            }
        };
        if !committed {
            // Torn down while subscribing; undo what was set up above.
            self.leave_channel(channel, &info, options).await;
            return Err(Error::NotConnected);
        }

        debug!(client = %self.id, channel = %channel, "Subscribed");
        Ok(result)
    }

    async fn join_channel(
        &self,
        channel: &str,
        info: &ClientInfo,
        options: SubscribeOptions,
        request: &SubscribeRequest,
    ) -> Result<SubscribeResult> {
        if options.presence {
            self.node.presence.join(channel, info).await?;
        }
        if options.join_leave {
            self.node.broker.publish_join(channel, info.clone()).await?;
        }
        if !options.recover {
            return Ok(SubscribeResult::default());
        }
        match &request.since {
            Some(since) => {
                let recovery = self.node.broker.recover(channel, since).await?;
                Ok(SubscribeResult {
                    position: Some(recovery.position),
                    publications: recovery.publications,
                    recovered: recovery.recovered,
                })
            }
            None => Ok(SubscribeResult {
                position: Some(self.node.broker.position(channel).await?),
                publications: Vec::new(),
                recovered: false,
            }),
        }
    }

    /// Reverse of a subscription. Failures are logged; stale presence is
    /// swept once its refresh window passes.
    async fn leave_channel(&self, channel: &str, info: &ClientInfo, options: SubscribeOptions) {
        if let Err(e) = self.node.broker.detach(channel, &self.id).await {
            warn!(client = %self.id, channel = %channel, error = %e, "Failed to detach from channel");
        }
        if options.presence {
            if let Err(e) = self.node.presence.leave(channel, &self.id).await {
                warn!(client = %self.id, channel = %channel, error = %e, "Failed to leave presence");
            }
        }
        if options.join_leave {
            if let Err(e) = self.node.broker.publish_leave(channel, info.clone()).await {
                warn!(client = %self.id, channel = %channel, error = %e, "Failed to announce leave");
            }
        }
    }

    /// Unsubscribe from a channel. No-op if not subscribed.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for handler vetoes.
    pub async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let (info, options) = {
            let mut inner = self.inner.lock();
            let Some(info) = inner.client_info(&self.id) else {
                return Ok(());
            };
            match inner.subscriptions.remove(channel) {
                Some(options) => (info, options),
                None => return Ok(()),
            }
        };

        self.leave_channel(channel, &info, options).await;
        self.node.handler.on_unsubscribe(&UnsubscribeEvent {
            client_id: &self.id,
            user_id: &info.user_id,
            channel,
        });
        debug!(client = %self.id, channel = %channel, "Unsubscribed");
        Ok(())
    }

    /// Publish a client message into a channel the session is subscribed to.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] when not subscribed, [`Error::BadRequest`]
    /// for payloads not matching the message schema, broker errors, and
    /// [`Error::PublishAborted`] when the session was torn down meanwhile.
    pub async fn publish(&self, channel: &str, data: &[u8]) -> Result<PublishResult> {
        let info = {
            let inner = self.inner.lock();
            let info = inner.connected_info(&self.id)?;
            if !inner.subscriptions.contains_key(channel) {
                return Err(Error::PermissionDenied);
            }
            info
        };

        let payload = ClientMessage::normalize(data)?;
        self.node.handler.on_publish(&PublishEvent {
            client_id: &self.id,
            user_id: &info.user_id,
            channel,
            data: &payload,
        })?;

        let result = self
            .node
            .broker
            .publish(channel, payload, Some(info), &self.node.config.history)
            .await;

        if self.state() == SessionState::Disconnected {
            warn!(client = %self.id, channel = %channel, "Publish finished after disconnect");
            return Err(Error::PublishAborted);
        }
        result
    }

    /// Presence of a channel. Empty when the session is not subscribed.
    ///
    /// # Errors
    ///
    /// Fails if the session is not connected, the handler rejects the
    /// query, or the owning shard is down.
    pub async fn presence(&self, channel: &str) -> Result<Vec<PresenceEntry>> {
        let (info, subscribed) = {
            let inner = self.inner.lock();
            let info = inner.connected_info(&self.id)?;
            (info, inner.subscriptions.contains_key(channel))
        };

        self.node.handler.on_presence(&PresenceEvent {
            client_id: &self.id,
            user_id: &info.user_id,
            channel,
        })?;

        if !subscribed {
            return Ok(Vec::new());
        }
        self.node.presence.list(channel).await
    }

    /// Refresh every presence entry held by the session.
    pub async fn refresh_presence(&self) {
        let (info, channels) = {
            let inner = self.inner.lock();
            let Ok(info) = inner.connected_info(&self.id) else {
                return;
            };
            let channels: Vec<ChannelId> = inner
                .subscriptions
                .iter()
                .filter(|(_, options)| options.presence)
                .map(|(channel, _)| channel.clone())
                .collect();
            (info, channels)
        };

        let mut rejoined = Vec::new();
        for channel in &channels {
            match self.node.presence.refresh(channel, &self.id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Entry was lost (swept or store restarted); put it back.
                    match self.node.presence.join(channel, &info).await {
                        Ok(()) => rejoined.push(channel.clone()),
                        Err(e) => {
                            debug!(client = %self.id, channel = %channel, error = %e, "Presence rejoin failed");
                        }
                    }
                }
                Err(e) => {
                    debug!(client = %self.id, channel = %channel, error = %e, "Presence refresh failed");
                }
            }
        }

        // An unsubscribe or teardown may have raced a rejoin.
        let orphaned: Vec<ChannelId> = {
            let inner = self.inner.lock();
            rejoined
                .into_iter()
                .filter(|channel| {
                    inner.state != SessionState::Connected
                        || !inner
                            .subscriptions
                            .get(channel)
                            .is_some_and(|options| options.presence)
                })
                .collect()
        };
        for channel in &orphaned {
            if let Err(e) = self.node.presence.leave(channel, &self.id).await {
                warn!(client = %self.id, channel = %channel, error = %e, "Failed to drop orphaned presence");
            }
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn disconnect(&self, disconnect: Disconnect) {
        let (info, subscriptions) = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disconnected {
                return;
            }
            inner.state = SessionState::Disconnected;
            (
                inner.client_info(&self.id),
                std::mem::take(&mut inner.subscriptions),
            )
        };

        if let Some(info) = &info {
            for (channel, options) in subscriptions {
                self.leave_channel(&channel, info, options).await;
            }
        }

        self.node.sessions.remove(&self.id);
        let _ = self.outbox.send(Push::Disconnect(disconnect));

        let user_id = info.as_ref().map(|i| i.user_id.as_str()).unwrap_or("");
        self.node.handler.on_disconnect(&DisconnectEvent {
            client_id: &self.id,
            user_id,
            disconnect,
        });
        info!(client = %self.id, user = %user_id, reason = %disconnect, "Session disconnected");
    }
}
