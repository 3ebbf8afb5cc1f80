//! Server side of the tunnel channel.
//!
//! Lifecycle per connection: OPENING (WebSocket accept) -> HANDSHAKING
//! (secret key check, optional CONTROL/REGISTER, subdomain assignment) ->
//! OPEN (envelope dispatch) -> CLOSED. One reader task and one writer task;
//! everything outbound goes through the session's queue so the writer is the
//! only socket writer.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use relay_core::{
    outbound_queue, ControlAction, CorrelationId, DecodeError, DisconnectReason, Envelope,
    ErrorCode, OutboundReceiver, Payload,
};

use crate::allocator::{AllocError, SubdomainAllocator};
use crate::config::ServerConfig;
use crate::forwarder::RequestForwarder;
use crate::registry::{CloseReason, SessionRegistry, TunnelSession};
use crate::shutdown::ShutdownSignal;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on allocate-then-register retries when losing the insert race.
const REGISTER_ATTEMPTS: usize = 8;

#[derive(Clone)]
pub struct ChannelState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub forwarder: Arc<RequestForwarder>,
    pub allocator: SubdomainAllocator,
}

pub fn control_app(state: ChannelState) -> Router {
    Router::new()
        .route("/ws", get(channel_handler))
        .with_state(state)
}

/// Serve tunnel client connections until the shutdown signal fires.
pub async fn run_control_server(
    addr: &str,
    state: ChannelState,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("control server listening on {}", addr);
    axum::serve(listener, control_app(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

async fn channel_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<ChannelState>,
) -> impl IntoResponse {
    let authorized = headers
        .get("x-relay-secret-key")
        .and_then(|value| value.to_str().ok())
        .map(|key| state.config.secret_keys.iter().any(|s| s == key))
        .unwrap_or(false);
    ws.on_upgrade(move |socket| handle_channel(socket, state, authorized))
}

async fn handle_channel(socket: WebSocket, state: ChannelState, authorized: bool) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    if !authorized {
        warn!("handshake rejected: bad or missing secret key");
        close_socket(&mut ws_tx, CloseReason::PolicyViolation, "invalid secret key").await;
        return;
    }

    let requested = match await_register(&mut ws_rx).await {
        Ok(requested) => requested,
        Err(HandshakeError::InvalidSubdomain(name)) => {
            warn!(requested = %name, "handshake rejected: invalid subdomain request");
            close_socket(
                &mut ws_tx,
                CloseReason::PolicyViolation,
                "invalid subdomain request",
            )
            .await;
            return;
        }
        Err(HandshakeError::ConnectionClosed) => {
            debug!("client went away during handshake");
            return;
        }
    };

    let (session, outbound) = match establish_session(&state, requested) {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "subdomain allocation failed");
            close_socket(&mut ws_tx, CloseReason::Internal, "allocation failed").await;
            return;
        }
    };
    let subdomain = session.subdomain.clone();
    let public_url = state.config.public_url(&subdomain);

    // REGISTERED is queued, not written directly: the writer task below is
    // the only socket writer from here on.
    session.publish(Envelope::registered(subdomain.clone(), public_url.clone()));
    info!(subdomain = %subdomain, public_url = %public_url, "tunnel registered");

    let writer = tokio::spawn(write_loop(ws_tx, outbound, session.close_signal()));
    let heartbeat = tokio::spawn(heartbeat_loop(
        session.clone(),
        state.config.heartbeat_interval(),
        state.config.heartbeat_max_missed,
    ));

    // OPEN: dispatch inbound envelopes until the channel dies. Clean exits
    // close 1000; corrupted framing closes 1008.
    let mut close_reason = CloseReason::Normal;
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if dispatch_frame(&state, &session, &text) == Flow::Closed {
                    break;
                }
            }
            Ok(WsMessage::Close(_)) => {
                info!(subdomain = %subdomain, "channel closed by client");
                break;
            }
            // Transport-level ping/pong is handled by the WebSocket stack.
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
            Ok(_) => {
                warn!(subdomain = %subdomain, "dropping non-text frame");
            }
            Err(err) => {
                warn!(subdomain = %subdomain, error = %err, "channel framing error");
                close_reason = CloseReason::PolicyViolation;
                break;
            }
        }
    }

    heartbeat.abort();
    state.registry.unregister(&subdomain, close_reason);
    // The unregister close signal lets the writer flush and close; give it a
    // moment before forcing the issue.
    let mut writer = writer;
    if tokio::time::timeout(Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!(subdomain = %subdomain, "channel closed");
}

enum HandshakeError {
    InvalidSubdomain(String),
    ConnectionClosed,
}

/// HANDSHAKING: wait (bounded) for an optional CONTROL/REGISTER naming a
/// desired subdomain. Silence or an unexpected frame falls back to random
/// allocation.
async fn await_register(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<Option<String>, HandshakeError> {
    let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_rx.next()).await {
        Err(_) => return Ok(None),
        Ok(None) => return Err(HandshakeError::ConnectionClosed),
        Ok(Some(Err(_))) => return Err(HandshakeError::ConnectionClosed),
        Ok(Some(Ok(frame))) => frame,
    };

    match frame {
        WsMessage::Text(text) => match Envelope::decode(&text) {
            Ok(envelope) => match envelope.payload {
                Payload::Control(control) if control.action == ControlAction::Register => {
                    match control.subdomain {
                        Some(name) if !is_valid_subdomain(&name) => {
                            Err(HandshakeError::InvalidSubdomain(name))
                        }
                        other => Ok(other),
                    }
                }
                _ => {
                    debug!("first frame is not REGISTER, allocating randomly");
                    Ok(None)
                }
            },
            Err(err) => {
                warn!(error = %err, "undecodable frame during handshake");
                Ok(None)
            }
        },
        WsMessage::Close(_) => Err(HandshakeError::ConnectionClosed),
        _ => Ok(None),
    }
}

/// A requested name must be a plain lowercase alphanumeric DNS label.
fn is_valid_subdomain(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Pick a subdomain and atomically claim it. A requested name that is taken
/// falls back to random allocation rather than failing the handshake.
fn establish_session(
    state: &ChannelState,
    requested: Option<String>,
) -> Result<(Arc<TunnelSession>, OutboundReceiver), AllocError> {
    let mut candidate = requested.filter(|name| !state.registry.has(name));
    for _ in 0..REGISTER_ATTEMPTS {
        let name = match candidate.take() {
            Some(name) => name,
            None => state.allocator.allocate(|s| state.registry.has(s))?,
        };
        let (queue, outbound) = outbound_queue();
        let session = Arc::new(TunnelSession::new(name, queue));
        if state.registry.register(session.clone()) {
            return Ok((session, outbound));
        }
    }
    Err(AllocError::Exhausted(REGISTER_ATTEMPTS))
}

/// Single writer: drains the outbound queue and performs the closing
/// handshake once the session is told to close.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut outbound: OutboundReceiver,
    mut close_signal: tokio::sync::watch::Receiver<Option<CloseReason>>,
) {
    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                match maybe {
                    Some(envelope) => match envelope.encode() {
                        Ok(text) => {
                            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "failed to encode outbound envelope");
                        }
                    },
                    None => return,
                }
            }
            changed = close_signal.changed() => {
                let reason = match changed {
                    Ok(()) => (*close_signal.borrow()).unwrap_or(CloseReason::Normal),
                    Err(_) => CloseReason::Normal,
                };
                // Flush whatever is already queued (a final DISCONNECT, late
                // responses) before the close frame.
                while let Some(envelope) = outbound.try_recv() {
                    if let Ok(text) = envelope.encode() {
                        if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                            return;
                        }
                    }
                }
                let _ = ws_tx
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: reason.ws_code(),
                        reason: reason.as_str().into(),
                    })))
                    .await;
                return;
            }
        }
    }
}

/// Application-level liveness: PING every interval, close after the
/// configured number of unanswered PINGs.
async fn heartbeat_loop(session: Arc<TunnelSession>, interval: Duration, max_missed: u32) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if session.missed_pongs() >= max_missed {
            warn!(
                subdomain = %session.subdomain,
                missed = session.missed_pongs(),
                "heartbeat failed, closing channel"
            );
            session.publish(Envelope::disconnect(DisconnectReason::Error));
            session.close(CloseReason::Internal);
            return;
        }
        if !session.publish(Envelope::ping()) {
            return;
        }
        session.note_ping_sent();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Closed,
}

/// OPEN-state dispatch of one inbound text frame.
fn dispatch_frame(state: &ChannelState, session: &Arc<TunnelSession>, text: &str) -> Flow {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(DecodeError::UnknownType(kind)) => {
            warn!(subdomain = %session.subdomain, kind = %kind, "unknown envelope type");
            session.publish(Envelope::error(
                CorrelationId::new(),
                ErrorCode::InvalidRequest,
                format!("unknown envelope type `{}`", kind),
            ));
            return Flow::Continue;
        }
        Err(err) => {
            warn!(subdomain = %session.subdomain, error = %err, "dropping malformed frame");
            return Flow::Continue;
        }
    };

    let id = envelope.correlation_id;
    match envelope.payload {
        Payload::Response(response) => state.forwarder.on_response(id, response),
        Payload::Error(error) => state.forwarder.on_error(id, error),
        Payload::Control(control) => match control.action {
            ControlAction::Ping => {
                session.publish(Envelope::pong(id));
            }
            ControlAction::Pong | ControlAction::Heartbeat => session.mark_pong(),
            ControlAction::Unregister | ControlAction::Disconnect => {
                info!(subdomain = %session.subdomain, "client unregistered");
                state
                    .registry
                    .unregister(&session.subdomain, CloseReason::Normal);
                return Flow::Closed;
            }
            ControlAction::Register | ControlAction::Registered => {
                session.publish(Envelope::error(
                    id,
                    ErrorCode::InvalidRequest,
                    "unexpected control action on an open channel",
                ));
            }
        },
        Payload::Request(_) => {
            session.publish(Envelope::error(
                id,
                ErrorCode::InvalidRequest,
                "REQUEST envelopes originate from the server",
            ));
        }
    }
    Flow::Continue
}

async fn close_socket(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    reason: CloseReason,
    detail: &'static str,
) {
    let _ = ws_tx
        .send(WsMessage::Close(Some(CloseFrame {
            code: reason.ws_code(),
            reason: detail.into(),
        })))
        .await;
}
