//! Client side of the tunnel channel.
//!
//! Connects to the server's `/ws` endpoint with the secret-key header,
//! registers, then dispatches REQUEST envelopes to the local origin proxy and
//! ships RESPONSE envelopes back through the single-writer queue.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_tungstenite::{
    connect_async,
    tungstenite::handshake::client::generate_key,
    tungstenite::protocol::Message as WsMessage,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use relay_core::{
    outbound_queue, ControlAction, CorrelationId, DecodeError, DisconnectReason, Envelope,
    ErrorCode, OutboundQueue, OutboundReceiver, Payload,
};

use crate::config::ClientConfig;
use crate::origin::OriginProxy;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// How an OPEN session ended. Anything but `Interrupted` feeds the
/// reconnection controller.
#[derive(Debug)]
pub enum SessionEnd {
    /// Local Ctrl+C; the process exits cleanly.
    Interrupted,
    /// The server sent CONTROL/DISCONNECT.
    Disconnected(Option<DisconnectReason>),
    /// The socket died or closed without a DISCONNECT.
    ConnectionLost,
}

/// Failures before the channel reached OPEN.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("server rejected the secret key")]
    AuthRejected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Run one channel from connect to close.
pub async fn run_channel(
    config: &ClientConfig,
    proxy: Arc<OriginProxy>,
) -> Result<SessionEnd, ChannelError> {
    let url = config.ws_url();
    info!("connecting to {}", url);

    let request = build_ws_request(config)?;
    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| ChannelError::Connect(e.to_string()))?;
    let (ws_tx, mut ws_rx) = socket.split();

    let (queue, outbound) = outbound_queue();
    let writer = tokio::spawn(write_loop(ws_tx, outbound));

    // HANDSHAKING: announce the desired subdomain (if any) and wait for the
    // server's REGISTERED.
    queue.publish(Envelope::register(config.subdomain.clone()));
    let registration = match await_registered(&mut ws_rx).await {
        Ok(registration) => registration,
        Err(err) => {
            writer.abort();
            return Err(err);
        }
    };
    info!(
        subdomain = %registration.subdomain,
        "tunnel ready at {}",
        registration.public_url
    );
    info!("forwarding to {}", proxy.authority());

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency));

    // OPEN: dispatch inbound envelopes until the channel dies or the user
    // interrupts.
    let end = loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(end) = dispatch_frame(&queue, &proxy, &semaphore, &text) {
                        break end;
                    }
                }
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "server closed the channel");
                    break SessionEnd::ConnectionLost;
                }
                Some(Ok(_)) => {
                    warn!("dropping non-text frame");
                }
                Some(Err(err)) => {
                    error!(error = %err, "channel read error");
                    break SessionEnd::ConnectionLost;
                }
                None => break SessionEnd::ConnectionLost,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("closing tunnel");
                queue.publish(Envelope::unregister());
                // Let the writer flush the UNREGISTER before tearing down.
                tokio::time::sleep(Duration::from_millis(100)).await;
                break SessionEnd::Interrupted;
            }
        }
    };

    writer.abort();
    Ok(end)
}

fn build_ws_request(config: &ClientConfig) -> Result<http::Request<()>, ChannelError> {
    let mut builder = http::Request::builder()
        .uri(config.ws_url())
        .header("Host", config.server_authority())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    if let Some(key) = &config.secret_key {
        builder = builder.header("X-Relay-Secret-Key", key.as_str());
    }
    builder
        .body(())
        .map_err(|e| ChannelError::Connect(e.to_string()))
}

struct Registration {
    subdomain: String,
    public_url: String,
}

/// Wait for CONTROL/REGISTERED, translating an early close into the matching
/// handshake error.
async fn await_registered(
    ws_rx: &mut SplitStream<WsStream>,
) -> Result<Registration, ChannelError> {
    let deadline = tokio::time::Instant::now() + REGISTRATION_TIMEOUT;
    loop {
        let frame = tokio::time::timeout_at(deadline, ws_rx.next())
            .await
            .map_err(|_| ChannelError::Handshake("timed out waiting for registration".into()))?;

        match frame {
            Some(Ok(WsMessage::Text(text))) => match Envelope::decode(&text) {
                Ok(envelope) => match envelope.payload {
                    Payload::Control(control)
                        if control.action == ControlAction::Registered =>
                    {
                        let Some(subdomain) = control.subdomain else {
                            return Err(ChannelError::Handshake(
                                "REGISTERED without a subdomain".into(),
                            ));
                        };
                        return Ok(Registration {
                            public_url: control.public_url.unwrap_or_default(),
                            subdomain,
                        });
                    }
                    Payload::Error(err) => {
                        return Err(ChannelError::Handshake(format!(
                            "{}: {}",
                            err.code, err.message
                        )));
                    }
                    other => {
                        debug!(?other, "ignoring pre-registration envelope");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "undecodable frame during registration");
                }
            },
            Some(Ok(WsMessage::Close(frame))) => {
                let code = frame.as_ref().map(|f| u16::from(f.code));
                return Err(match code {
                    Some(1008) => ChannelError::AuthRejected,
                    Some(1011) => {
                        ChannelError::Handshake("server could not allocate a subdomain".into())
                    }
                    _ => ChannelError::Handshake("channel closed during registration".into()),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(ChannelError::Connect(err.to_string())),
            None => {
                return Err(ChannelError::Handshake(
                    "connection closed during registration".into(),
                ))
            }
        }
    }
}

/// Single writer: everything outbound funnels through the queue.
async fn write_loop(mut ws_tx: SplitSink<WsStream, WsMessage>, mut outbound: OutboundReceiver) {
    while let Some(envelope) = outbound.recv().await {
        match envelope.encode() {
            Ok(text) => {
                if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                error!(error = %err, "failed to encode outbound envelope");
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// OPEN-state dispatch of one inbound text frame. Returns the session end
/// when the frame terminates the channel.
fn dispatch_frame(
    queue: &OutboundQueue,
    proxy: &Arc<OriginProxy>,
    semaphore: &Arc<Semaphore>,
    text: &str,
) -> Option<SessionEnd> {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(DecodeError::UnknownType(kind)) => {
            warn!(kind = %kind, "unknown envelope type");
            queue.publish(Envelope::error(
                CorrelationId::new(),
                ErrorCode::InvalidRequest,
                format!("unknown envelope type `{}`", kind),
            ));
            return None;
        }
        Err(err) => {
            warn!(error = %err, "dropping malformed frame");
            return None;
        }
    };

    let id = envelope.correlation_id;
    match envelope.payload {
        Payload::Request(request) => {
            let queue = queue.clone();
            let proxy = proxy.clone();
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                // Bounded worker pool; the proxy never fails, it answers.
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let response = proxy.handle(request).await;
                queue.publish(Envelope::response(id, response));
            });
            None
        }
        Payload::Control(control) => match control.action {
            ControlAction::Ping => {
                queue.publish(Envelope::pong(id));
                None
            }
            ControlAction::Pong | ControlAction::Heartbeat => None,
            ControlAction::Disconnect => Some(SessionEnd::Disconnected(control.reason)),
            ControlAction::Registered => {
                debug!("duplicate REGISTERED ignored");
                None
            }
            ControlAction::Register | ControlAction::Unregister => {
                queue.publish(Envelope::error(
                    id,
                    ErrorCode::InvalidRequest,
                    "unexpected control action on an open channel",
                ));
                None
            }
        },
        Payload::Error(err) => {
            warn!(correlation_id = %id, code = %err.code, message = %err.message, "server reported an error");
            None
        }
        Payload::Response(_) => {
            queue.publish(Envelope::error(
                id,
                ErrorCode::InvalidRequest,
                "RESPONSE envelopes originate from the client",
            ));
            None
        }
    }
}
