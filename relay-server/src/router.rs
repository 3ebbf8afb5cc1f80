//! Public request router.
//!
//! Terminates inbound HTTP on the wildcard host, translates each request into
//! a REQUEST envelope and suspends the public response on the forwarder's
//! result future.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Host, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode},
    routing::any,
    Router,
};
use futures_util::StreamExt;
use tracing::{debug, warn};

use relay_core::headers::{is_hop_by_hop, wants_websocket_upgrade};
use relay_core::{RequestPayload, ResponsePayload};

use crate::config::ServerConfig;
use crate::forwarder::RequestForwarder;
use crate::registry::SessionRegistry;
use crate::shutdown::ShutdownSignal;

#[derive(Clone)]
pub struct RouterState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub forwarder: Arc<RequestForwarder>,
    pub shutdown: ShutdownSignal,
}

pub fn public_app(state: RouterState) -> Router {
    Router::new()
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state)
}

/// Serve public traffic until the shutdown signal fires.
pub async fn run_public_server(
    addr: &str,
    state: RouterState,
    shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("public server listening on {}", addr);
    axum::serve(listener, public_app(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;
    Ok(())
}

async fn proxy_handler(
    State(state): State<RouterState>,
    Host(host): Host,
    request: Request<Body>,
) -> Response<Body> {
    if state.shutdown.is_shutting_down() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "server shutting down");
    }

    let Some(subdomain) = extract_subdomain(&host, &state.config.domain) else {
        debug!(host = %host, "no tunnel label in host");
        return error_response(StatusCode::NOT_FOUND, "unknown host");
    };

    let Some(session) = state.registry.lookup(&subdomain) else {
        debug!(subdomain = %subdomain, "no tunnel for subdomain");
        return error_response(StatusCode::NOT_FOUND, "tunnel not connected");
    };

    let payload = match convert_request(request, state.config.max_body_size).await {
        Ok(payload) => payload,
        Err(ConvertError::BodyTooLarge) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body exceeds the configured limit",
            );
        }
        Err(ConvertError::Body(message)) => {
            return error_response(StatusCode::BAD_REQUEST, &message);
        }
    };

    match state
        .forwarder
        .forward(&session, payload, state.config.request_timeout())
        .await
    {
        Ok(response) => build_response(response),
        Err(err) => {
            warn!(subdomain = %subdomain, error = %err, "tunnel request failed");
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &err.to_string())
        }
    }
}

/// The leftmost DNS label of a host that is exactly `<label>.<domain>`.
/// Anything else, including the apex and nested labels, routes nowhere.
fn extract_subdomain(host: &str, domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{}", domain);
    let host_lower = host.to_ascii_lowercase();
    let label = host_lower.strip_suffix(&suffix.to_ascii_lowercase())?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label.to_string())
}

enum ConvertError {
    BodyTooLarge,
    Body(String),
}

async fn convert_request(
    request: Request<Body>,
    max_body: usize,
) -> Result<RequestPayload, ConvertError> {
    let (parts, body) = request.into_parts();

    let websocket_upgrade = wants_websocket_upgrade(
        parts
            .headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );

    let method = parts.method.as_str().to_ascii_uppercase();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(parse_query);
    let headers = collect_headers(&parts.headers);

    // Streaming count: reject as soon as the limit is crossed, without
    // buffering the remainder.
    let mut stream = body.into_data_stream();
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ConvertError::Body(format!("failed to read body: {}", e)))?;
        if buf.len() + chunk.len() > max_body {
            return Err(ConvertError::BodyTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(RequestPayload {
        method,
        path,
        query,
        headers,
        body: if buf.is_empty() { None } else { Some(buf) },
        websocket_upgrade,
    })
}

/// Raw query pairs in original order; names and values are not decoded so the
/// client can reattach them verbatim.
fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Lowercase header names, join repeated headers with `", "`, drop the
/// hop-by-hop set.
fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        map.entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    map
}

fn build_response(payload: ResponsePayload) -> Response<Body> {
    // The wire allows any u16 and the http crate any 100..999; only the HTTP
    // status range proper may reach the public client.
    if !(100..=599).contains(&payload.status_code) {
        return error_response(StatusCode::BAD_GATEWAY, "malformed status from tunnel");
    }
    let Ok(status) = StatusCode::from_u16(payload.status_code) else {
        return error_response(StatusCode::BAD_GATEWAY, "malformed status from tunnel");
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in payload.headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from(payload.body.unwrap_or_default()))
        .unwrap_or_else(|_| {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
        })
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownMode;
    use crate::forwarder::PendingTable;
    use crate::registry::TunnelSession;
    use relay_core::{outbound_queue, OutboundReceiver, Payload};

    fn config() -> ServerConfig {
        ServerConfig {
            domain: "tun.example.com".to_string(),
            secret_keys: vec!["k".to_string()],
            control_port: 8080,
            http_port: 8000,
            request_timeout: 5,
            max_body_size: 64,
            subdomain_length: 12,
            shutdown_mode: ShutdownMode::Graceful,
            graceful_shutdown_timeout: 30,
            heartbeat_interval: 30,
            heartbeat_max_missed: 2,
            debug: false,
        }
    }

    fn state_with_session(subdomain: &str) -> (RouterState, OutboundReceiver) {
        let pendings = Arc::new(PendingTable::new());
        let registry = Arc::new(SessionRegistry::new(pendings.clone()));
        let forwarder = Arc::new(RequestForwarder::new(pendings, registry.clone()));
        let (queue, outbound) = outbound_queue();
        registry.register(Arc::new(TunnelSession::new(subdomain, queue)));
        let state = RouterState {
            config: Arc::new(config()),
            registry,
            forwarder,
            shutdown: ShutdownSignal::new(),
        };
        (state, outbound)
    }

    #[test]
    fn extract_subdomain_requires_exact_single_label() {
        let domain = "tun.example.com";
        assert_eq!(
            extract_subdomain("abc123.tun.example.com", domain),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_subdomain("abc123.tun.example.com:8000", domain),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_subdomain("ABC123.TUN.EXAMPLE.COM", domain),
            Some("abc123".to_string())
        );
        assert_eq!(extract_subdomain("tun.example.com", domain), None);
        assert_eq!(extract_subdomain("a.b.tun.example.com", domain), None);
        assert_eq!(extract_subdomain("abc123.other.com", domain), None);
        assert_eq!(extract_subdomain("xtun.example.com", domain), None);
    }

    #[test]
    fn parse_query_keeps_order_and_raw_values() {
        assert_eq!(
            parse_query("b=2&a=1&flag&x=%20y"),
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("flag".to_string(), String::new()),
                ("x".to_string(), "%20y".to_string()),
            ]
        );
    }

    #[test]
    fn collect_headers_joins_and_strips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("host", HeaderValue::from_static("abc.tun.example.com"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-custom", HeaderValue::from_static("1"));

        let map = collect_headers(&headers);
        assert_eq!(map.get("accept").unwrap(), "text/html, application/json");
        assert_eq!(map.get("x-custom").unwrap(), "1");
        assert!(!map.contains_key("host"));
        assert!(!map.contains_key("connection"));
    }

    #[tokio::test]
    async fn proxy_round_trip() {
        let (state, mut outbound) = state_with_session("abc123abc123");

        // Tunnel side: answer the forwarded request with 200 "world".
        let forwarder = state.forwarder.clone();
        let responder = tokio::spawn(async move {
            let envelope = outbound.recv().await.expect("request envelope");
            let Payload::Request(request) = &envelope.payload else {
                panic!("expected REQUEST, got {:?}", envelope.payload);
            };
            assert_eq!(request.method, "GET");
            assert_eq!(request.path, "/hello");
            assert_eq!(request.body, None);
            forwarder.on_response(
                envelope.correlation_id,
                ResponsePayload {
                    status_code: 200,
                    headers: BTreeMap::from([(
                        "content-type".to_string(),
                        "text/plain".to_string(),
                    )]),
                    body: Some(b"world".to_vec()),
                },
            );
        });

        let request = Request::builder()
            .method("GET")
            .uri("/hello")
            .body(Body::empty())
            .unwrap();
        let response = proxy_handler(
            State(state),
            Host("abc123abc123.tun.example.com".to_string()),
            request,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"world");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_subdomain_is_404() {
        let (state, _outbound) = state_with_session("abc123abc123");
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = proxy_handler(
            State(state),
            Host("nosuchtunnel.tun.example.com".to_string()),
            request,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_body_is_413_without_forwarding() {
        let (state, mut outbound) = state_with_session("abc123abc123");
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from(vec![0u8; 65]))
            .unwrap();
        let response = proxy_handler(
            State(state),
            Host("abc123abc123.tun.example.com".to_string()),
            request,
        )
        .await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(outbound.try_recv().is_none(), "nothing must be forwarded");
    }

    #[tokio::test]
    async fn unanswered_request_times_out_as_504() {
        let (state, _outbound) = state_with_session("abc123abc123");
        let mut state = state;
        let mut config = config();
        config.request_timeout = 0;
        state.config = Arc::new(config);

        let request = Request::builder().uri("/slow").body(Body::empty()).unwrap();
        let response = proxy_handler(
            State(state),
            Host("abc123abc123.tun.example.com".to_string()),
            request,
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn out_of_range_status_codes_become_502() {
        // 600..=999 parse as valid http::StatusCode values but are outside
        // the declared 100..599 range; anything above 999 never parses.
        for status_code in [0, 99, 600, 700, 999, 1000, u16::MAX] {
            let response = build_response(ResponsePayload {
                status_code,
                headers: BTreeMap::new(),
                body: None,
            });
            assert_eq!(
                response.status(),
                StatusCode::BAD_GATEWAY,
                "status {status_code} must be rejected as malformed"
            );
        }

        let response = build_response(ResponsePayload {
            status_code: 100,
            headers: BTreeMap::new(),
            body: None,
        });
        assert_eq!(response.status(), StatusCode::CONTINUE);
        let response = build_response(ResponsePayload {
            status_code: 599,
            headers: BTreeMap::new(),
            body: None,
        });
        assert_eq!(response.status().as_u16(), 599);
    }

    #[tokio::test]
    async fn websocket_upgrade_flag_is_set() {
        let (state, mut outbound) = state_with_session("abc123abc123");
        let forwarder = state.forwarder.clone();
        let responder = tokio::spawn(async move {
            let envelope = outbound.recv().await.unwrap();
            let Payload::Request(request) = &envelope.payload else {
                panic!("expected REQUEST");
            };
            assert!(request.websocket_upgrade);
            // Hop-by-hop upgrade headers must not cross the boundary.
            assert!(!request.headers.contains_key("upgrade"));
            assert!(!request.headers.contains_key("connection"));
            forwarder.on_response(
                envelope.correlation_id,
                ResponsePayload {
                    status_code: 101,
                    headers: BTreeMap::new(),
                    body: None,
                },
            );
        });

        let request = Request::builder()
            .uri("/socket")
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .body(Body::empty())
            .unwrap();
        let response = proxy_handler(
            State(state),
            Host("abc123abc123.tun.example.com".to_string()),
            request,
        )
        .await;
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        responder.await.unwrap();
    }
}
