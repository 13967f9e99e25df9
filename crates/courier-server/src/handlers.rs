//! Connection handlers for the Courier server.
//!
//! This module handles the connection lifecycle and maps frames onto
//! session operations.

use crate::config::Config;
use crate::convert::{self, error_frame};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::{Bytes, BytesMut};
use courier_core::{Credentials, Disconnect, Error, Node, Push, Session, SubscribeRequest};
use courier_protocol::{codec, negotiate, Frame};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The gateway node.
    pub node: Arc<Node>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, node: Arc<Node>) -> Self {
        Self { node, config }
    }
}

/// Run the HTTP/WebSocket server until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(
    config: Config,
    node: Arc<Node>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), node));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let shards: Vec<_> = state
        .node
        .broker()
        .ring()
        .shards()
        .iter()
        .map(|shard| {
            serde_json::json!({
                "name": shard.name(),
                "up": shard.is_up(),
                "reconnecting": shard.is_reconnecting(),
            })
        })
        .collect();

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node": state.node.id(),
        "sessions": state.node.session_count(),
        "channels": state.node.broker().channel_count(),
        "shards": shards,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Whether the connection loop should keep running after a frame.
enum Flow {
    Continue,
    Close,
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();

    if state.node.session_count() >= state.config.limits.max_connections {
        warn!("Connection limit reached, refusing connection");
        metrics::record_error("connection_limit");
        let _ = send_frame(&mut sender, &convert::disconnect_frame(Disconnect::FORCE)).await;
        return;
    }

    let (session, mut pushes) = match state.node.accept() {
        Ok(accepted) => accepted,
        Err(e) => {
            debug!(error = %e, "Node refused connection");
            let _ = send_frame(&mut sender, &convert::disconnect_frame(Disconnect::SHUTDOWN)).await;
            return;
        }
    };
    debug!(client = %session.id(), "WebSocket connected");

    let heartbeat_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let mut heartbeat = tokio::time::interval(Duration::from_millis(
        state.config.heartbeat.interval_ms,
    ));
    let mut last_seen = Instant::now();
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(push) = pushes.recv() => {
                let closing = matches!(push, Push::Disconnect(_));
                if send_frame(&mut sender, &convert::push_frame(push)).await.is_err() || closing {
                    break;
                }
            }

            msg = receiver.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data,
                    // Treat text as binary
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(client = %session.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client = %session.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(client = %session.id(), "WebSocket stream ended");
                        break;
                    }
                };

                last_seen = Instant::now();
                let start = Instant::now();
                metrics::record_message(data.len(), "inbound");
                read_buffer.extend_from_slice(&data);
                let flow = drain_frames(&mut read_buffer, &session, &state, &mut sender).await;
                metrics::record_latency(start.elapsed().as_secs_f64());
                if matches!(flow, Flow::Close) {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > heartbeat_timeout {
                    debug!(client = %session.id(), "Heartbeat timeout");
                    break;
                }
            }
        }
    }

    session.disconnect(Disconnect::CONNECTION_CLOSED).await;
    metrics::set_active_channels(state.node.broker().channel_count());
    debug!(client = %session.id(), "WebSocket disconnected");
}

/// Handle every complete frame in the read buffer.
async fn drain_frames(
    read_buffer: &mut BytesMut,
    session: &Session,
    state: &AppState,
    sender: &mut WsSender,
) -> Flow {
    loop {
        match codec::decode_from(read_buffer) {
            Ok(Some(frame)) => match handle_frame(frame, session, state, sender).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => return Flow::Close,
                Err(e) => {
                    debug!(client = %session.id(), error = %e, "Failed to send frame");
                    return Flow::Close;
                }
            },
            Ok(None) => return Flow::Continue,
            Err(e) => {
                warn!(client = %session.id(), error = %e, "Malformed frame");
                metrics::record_error("protocol");
                let _ = send_frame(sender, &convert::disconnect_frame(Disconnect::BAD_REQUEST)).await;
                return Flow::Close;
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    session: &Session,
    state: &AppState,
    sender: &mut WsSender,
) -> Result<Flow> {
    match frame {
        Frame::Connect {
            version,
            user,
            info,
        } => {
            let Some(version) = negotiate(version) else {
                let error = Error::BadRequest(format!("unsupported protocol version {version}"));
                send_error(sender, 0, &error).await?;
                return Ok(Flow::Close);
            };

            let credentials = credentials(&state.config, user, info);
            match session.connect(credentials) {
                Ok(reply) => {
                    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
                    send_frame(
                        sender,
                        &Frame::connected(reply.client_id, version.major, heartbeat),
                    )
                    .await?;
                }
                // The disconnect push that follows closes the connection.
                Err(e) => send_error(sender, 0, &e).await?,
            }
        }

        Frame::Subscribe { id, channel, since } => {
            debug!(client = %session.id(), channel = %channel, "Subscribe request");

            let limit = state.config.limits.max_subscriptions_per_connection;
            if !session.is_subscribed(&channel) && session.channels().len() >= limit {
                let error = Error::BadRequest(format!("subscription limit {limit} reached"));
                send_error(sender, id, &error).await?;
                return Ok(Flow::Continue);
            }

            let request = SubscribeRequest {
                since: since.map(convert::stream_position),
            };
            match session.subscribe(&channel, request).await {
                Ok(result) => {
                    metrics::record_subscription();
                    metrics::set_active_channels(state.node.broker().channel_count());
                    let frame = Frame::Subscribed {
                        id,
                        channel,
                        position: result.position.map(convert::position),
                        publications: result
                            .publications
                            .into_iter()
                            .map(convert::publication_data)
                            .collect(),
                        recovered: result.recovered,
                    };
                    send_frame(sender, &frame).await?;
                }
                Err(e) => {
                    warn!(client = %session.id(), channel = %channel, error = %e, "Subscribe failed");
                    send_error(sender, id, &e).await?;
                }
            }
        }

        Frame::Unsubscribe { id, channel } => {
            debug!(client = %session.id(), channel = %channel, "Unsubscribe request");
            match session.unsubscribe(&channel).await {
                Ok(()) => {
                    metrics::set_active_channels(state.node.broker().channel_count());
                    send_frame(sender, &Frame::ack(id)).await?;
                }
                Err(e) => send_error(sender, id, &e).await?,
            }
        }

        Frame::Publish {
            id,
            channel,
            payload,
        } => {
            match session.publish(&channel, &payload).await {
                Ok(result) => {
                    metrics::record_publication();
                    let frame = Frame::PublishOk {
                        id,
                        offset: result.offset,
                        epoch: result.epoch,
                    };
                    send_frame(sender, &frame).await?;
                }
                Err(e) => {
                    debug!(client = %session.id(), channel = %channel, error = %e, "Publish rejected");
                    send_error(sender, id, &e).await?;
                }
            }
        }

        Frame::Presence { id, channel } => match session.presence(&channel).await {
            Ok(entries) => {
                let frame = Frame::PresenceReply {
                    id,
                    channel,
                    clients: entries.into_iter().map(convert::presence_data).collect(),
                };
                send_frame(sender, &frame).await?;
            }
            Err(e) => send_error(sender, id, &e).await?,
        },

        Frame::Ping { timestamp } => {
            session.refresh_presence().await;
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(client = %session.id(), frame_type = ?other.frame_type(), "Unexpected frame type");
            let error = Error::BadRequest("unexpected frame".into());
            send_error(sender, other.request_id().unwrap_or(0), &error).await?;
        }
    }

    Ok(Flow::Continue)
}

/// Credentials from the connect frame, falling back to the configured default.
fn credentials(
    config: &Config,
    user: Option<String>,
    info: Option<serde_json::Value>,
) -> Option<Credentials> {
    let (user, info) = match user {
        Some(user) => (user, info),
        None => (
            config.auth.default_user.clone()?,
            info.or_else(|| config.auth.default_info.clone()),
        ),
    };
    let mut credentials = Credentials::new(user);
    if let Some(info) = info.and_then(|v| serde_json::to_vec(&v).ok()) {
        credentials = credentials.with_info(Bytes::from(info));
    }
    Some(credentials)
}

async fn send_error(sender: &mut WsSender, id: u64, error: &Error) -> Result<()> {
    metrics::record_error_code(error.code());
    send_frame(sender, &error_frame(id, error)).await
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_fallback() {
        let mut config = Config::default();
        assert!(credentials(&config, None, None).is_none());

        config.auth.default_user = Some("42".into());
        config.auth.default_info = Some(serde_json::json!({"name": "Alexander"}));
        let creds = credentials(&config, None, None).unwrap();
        assert_eq!(creds.user_id, "42");
        let info: serde_json::Value = serde_json::from_slice(creds.info.as_ref().unwrap()).unwrap();
        assert_eq!(info, serde_json::json!({"name": "Alexander"}));

        // An explicit user never inherits the default info.
        let creds = credentials(&config, Some("7".into()), None).unwrap();
        assert_eq!(creds.user_id, "7");
        assert!(creds.info.is_none());
    }
}
