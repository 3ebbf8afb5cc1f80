//! Local origin proxy.
//!
//! Re-issues each inbound REQUEST against the configured local origin and
//! turns the outcome into a RESPONSE payload. Failures never cross the
//! channel as transport errors: unreachable origins become 502, internal
//! conversion problems become 500.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

use relay_core::headers::is_hop_by_hop;
use relay_core::{RequestPayload, ResponsePayload};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies above this are refused rather than shipped over the
/// channel; the producer enforces the same 10 MiB cap as the server side.
const MAX_RESPONSE_BODY: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
enum OriginError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("response body exceeds {MAX_RESPONSE_BODY} bytes")]
    BodyTooLarge,
    #[error("could not build origin request: {0}")]
    BadRequest(String),
}

impl OriginError {
    fn status(&self) -> u16 {
        match self {
            OriginError::Connect(_) | OriginError::Transport(_) | OriginError::BodyTooLarge => 502,
            OriginError::BadRequest(_) => 500,
        }
    }
}

pub struct OriginProxy {
    authority: String,
    connect_timeout: Duration,
    exchange_timeout: Duration,
}

impl OriginProxy {
    pub fn new(authority: String) -> Self {
        Self {
            authority,
            connect_timeout: DEFAULT_TIMEOUT,
            exchange_timeout: DEFAULT_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_timeouts(authority: String, connect: Duration, exchange: Duration) -> Self {
        Self {
            authority,
            connect_timeout: connect,
            exchange_timeout: exchange,
        }
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Issue the request against the local origin. Infallible by design: any
    /// failure is folded into the RESPONSE payload.
    pub async fn handle(&self, request: RequestPayload) -> ResponsePayload {
        let method = request.method.clone();
        let path = request.path.clone();
        match self.forward(&request).await {
            Ok(response) => {
                debug!(method = %method, path = %path, status = response.status_code, "origin answered");
                response
            }
            Err(err) => {
                error!(method = %method, path = %path, error = %err, "origin request failed");
                text_response(err.status(), &format!("local origin error: {}", err))
            }
        }
    }

    async fn forward(&self, request: &RequestPayload) -> Result<ResponsePayload, OriginError> {
        let origin_request = self.build_request(request)?;

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.authority))
            .await
            .map_err(|_| OriginError::Connect("connect timed out".to_string()))?
            .map_err(|e| OriginError::Connect(e.to_string()))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OriginError::Transport(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "origin connection error");
            }
        });

        let response = timeout(self.exchange_timeout, sender.send_request(origin_request))
            .await
            .map_err(|_| OriginError::Transport("response timed out".to_string()))?
            .map_err(|e| OriginError::Transport(e.to_string()))?;

        let status_code = response.status().as_u16();
        let headers = aggregate_headers(response.headers());

        let body = timeout(self.exchange_timeout, response.into_body().collect())
            .await
            .map_err(|_| OriginError::Transport("body read timed out".to_string()))?
            .map_err(|e| OriginError::Transport(e.to_string()))?
            .to_bytes();
        if body.len() > MAX_RESPONSE_BODY {
            return Err(OriginError::BodyTooLarge);
        }

        Ok(ResponsePayload {
            status_code,
            headers,
            body: if body.is_empty() {
                None
            } else {
                Some(body.to_vec())
            },
        })
    }

    fn build_request(&self, request: &RequestPayload) -> Result<Request<Full<Bytes>>, OriginError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| OriginError::BadRequest(e.to_string()))?;

        let mut uri = request.path.clone();
        if let Some(query) = &request.query {
            if !query.is_empty() {
                uri.push('?');
                let joined: Vec<String> = query
                    .iter()
                    .map(|(name, value)| {
                        if value.is_empty() {
                            name.clone()
                        } else {
                            format!("{}={}", name, value)
                        }
                    })
                    .collect();
                uri.push_str(&joined.join("&"));
            }
        }

        let mut builder = Request::builder().method(method).uri(&uri);
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = builder.header("host", &self.authority);

        let body = request.body.clone().unwrap_or_default();
        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| OriginError::BadRequest(e.to_string()))
    }
}

/// Join repeated response headers with `", "`, lowercase names.
fn aggregate_headers(headers: &hyper::header::HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

fn text_response(status_code: u16, message: &str) -> ResponsePayload {
    ResponsePayload {
        status_code,
        headers: BTreeMap::from([(
            "content-type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )]),
        body: Some(message.as_bytes().to_vec()),
    }
}

/// Startup probe: a bounded TCP connect against the origin, so a missing
/// local service is visible before the tunnel opens.
pub async fn preflight(authority: &str, limit: Duration) -> Result<Duration, String> {
    let started = std::time::Instant::now();
    match timeout(limit, TcpStream::connect(authority)).await {
        Ok(Ok(_stream)) => {
            let latency = started.elapsed();
            info!(authority, ?latency, "local origin reachable");
            Ok(latency)
        }
        Ok(Err(err)) => Err(format!("connect failed: {}", err)),
        Err(_) => Err("connect timed out".to_string()),
    }
}
