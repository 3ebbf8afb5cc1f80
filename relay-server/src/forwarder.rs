//! Request forwarding and the pending table.
//!
//! Every forwarded request gets a fresh correlation id and a one-shot result
//! slot. Removal from the table and completion of the slot are one atomic
//! step, so a pending completes at most once no matter how a response, an
//! error, a timeout and a disconnect race each other.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use relay_core::{CorrelationId, Envelope, ErrorPayload, RequestPayload, ResponsePayload};

use crate::registry::{SessionRegistry, TunnelSession};

/// Terminal outcome of a forwarded request, observable by the router.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    #[error("timed out waiting for the tunnel response")]
    Timeout,
    #[error("tunnel disconnected")]
    Disconnected,
    #[error("server shutting down")]
    Shutdown,
    #[error("tunnel reported {}: {}", .0.code, .0.message)]
    Remote(ErrorPayload),
}

impl ForwardError {
    /// Public status code per the error mapping. A tunnel lost mid-wait is
    /// 503; an ERROR envelope from the client maps through its code.
    pub fn http_status(&self) -> u16 {
        match self {
            ForwardError::Timeout => 504,
            ForwardError::Disconnected => 503,
            ForwardError::Shutdown => 500,
            ForwardError::Remote(payload) => payload.code.http_status(),
        }
    }
}

pub type ForwardResult = Result<ResponsePayload, ForwardError>;

struct Pending {
    slot: oneshot::Sender<ForwardResult>,
    subdomain: String,
}

/// Sole owner of the correlation-id -> pending mapping.
pub struct PendingTable {
    entries: DashMap<CorrelationId, Pending>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub(crate) fn insert(
        &self,
        id: CorrelationId,
        subdomain: String,
    ) -> oneshot::Receiver<ForwardResult> {
        let (slot, rx) = oneshot::channel();
        self.entries.insert(id, Pending { slot, subdomain });
        rx
    }

    /// Remove-and-complete with a response. False when the id is unknown or
    /// already completed.
    pub fn complete(&self, id: CorrelationId, response: ResponsePayload) -> bool {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                debug!(correlation_id = %id, subdomain = %pending.subdomain, "pending completed");
                let _ = pending.slot.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Remove-and-complete with an error. Same at-most-once contract.
    pub fn fail(&self, id: CorrelationId, error: ForwardError) -> bool {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                debug!(correlation_id = %id, subdomain = %pending.subdomain, error = %error, "pending failed");
                let _ = pending.slot.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Complete every pending with the same error (immediate shutdown).
    pub fn fail_all(&self, error: ForwardError) {
        let ids: Vec<CorrelationId> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.fail(id, error.clone());
        }
    }

    /// Remove without completing; used when the owning forward gives up
    /// before anything was sent.
    fn take(&self, id: CorrelationId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Translates public requests into REQUEST envelopes and resolves their
/// replies through the pending table.
pub struct RequestForwarder {
    pendings: Arc<PendingTable>,
    registry: Arc<SessionRegistry>,
}

impl RequestForwarder {
    pub fn new(pendings: Arc<PendingTable>, registry: Arc<SessionRegistry>) -> Self {
        Self { pendings, registry }
    }

    pub fn pending_count(&self) -> usize {
        self.pendings.len()
    }

    /// Send a request down the session's channel and await its outcome.
    ///
    /// The pending is registered before the envelope is published, so a reply
    /// can never arrive for an id the table does not know. The session is
    /// re-checked after tracking to close the race against a concurrent
    /// unregister, which drains the in-flight set it may not have seen us in.
    pub async fn forward(
        &self,
        session: &TunnelSession,
        request: RequestPayload,
        timeout: Duration,
    ) -> ForwardResult {
        let id = CorrelationId::new();
        let mut rx = self.pendings.insert(id, session.subdomain.clone());

        if !self.registry.track(&session.subdomain, id) || !self.registry.has(&session.subdomain) {
            self.pendings.take(id);
            self.registry.untrack(&session.subdomain, id);
            return Err(ForwardError::Disconnected);
        }

        let envelope = Envelope::request(id, request);
        debug!(correlation_id = %id, subdomain = %session.subdomain, "forwarding request");
        if !session.publish(envelope) {
            self.registry.untrack(&session.subdomain, id);
            self.pendings.take(id);
            return Err(ForwardError::Disconnected);
        }

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without completion: the table itself went away.
            Ok(Err(_)) => Err(ForwardError::Shutdown),
            Err(_elapsed) => {
                if self.pendings.take(id) {
                    warn!(correlation_id = %id, subdomain = %session.subdomain, "request timed out");
                    Err(ForwardError::Timeout)
                } else {
                    // A completion won the race against the timer; the result
                    // is already in the slot.
                    rx.try_recv().unwrap_or(Err(ForwardError::Timeout))
                }
            }
        };
        self.registry.untrack(&session.subdomain, id);
        outcome
    }

    /// RESPONSE envelope arrived for `id`. Late or unknown replies are
    /// dropped.
    pub fn on_response(&self, id: CorrelationId, response: ResponsePayload) {
        if !self.pendings.complete(id, response) {
            debug!(correlation_id = %id, "dropping late or unknown response");
        }
    }

    /// ERROR envelope arrived for `id`.
    pub fn on_error(&self, id: CorrelationId, error: ErrorPayload) {
        if !self.pendings.fail(id, ForwardError::Remote(error)) {
            debug!(correlation_id = %id, "dropping late or unknown error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CloseReason;
    use relay_core::{outbound_queue, ErrorCode, Payload};
    use std::collections::BTreeMap;

    fn request() -> RequestPayload {
        RequestPayload {
            method: "GET".to_string(),
            path: "/hello".to_string(),
            query: None,
            headers: BTreeMap::new(),
            body: None,
            websocket_upgrade: false,
        }
    }

    fn response() -> ResponsePayload {
        ResponsePayload {
            status_code: 200,
            headers: BTreeMap::new(),
            body: Some(b"world".to_vec()),
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        forwarder: Arc<RequestForwarder>,
        session: Arc<TunnelSession>,
        outbound: relay_core::OutboundReceiver,
    }

    fn fixture(subdomain: &str) -> Fixture {
        let pendings = Arc::new(PendingTable::new());
        let registry = Arc::new(SessionRegistry::new(pendings.clone()));
        let forwarder = Arc::new(RequestForwarder::new(pendings, registry.clone()));
        let (queue, outbound) = outbound_queue();
        let session = Arc::new(TunnelSession::new(subdomain, queue));
        assert!(registry.register(session.clone()));
        Fixture {
            registry,
            forwarder,
            session,
            outbound,
        }
    }

    #[tokio::test]
    async fn forward_completes_with_matching_response() {
        let mut fx = fixture("abc123abc123");
        let forwarder = fx.forwarder.clone();
        let session = fx.session.clone();
        let task = tokio::spawn(async move {
            forwarder
                .forward(&session, request(), Duration::from_secs(5))
                .await
        });

        let envelope = fx.outbound.recv().await.expect("request envelope");
        assert!(matches!(envelope.payload, Payload::Request(_)));
        fx.forwarder.on_response(envelope.correlation_id, response());

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.status_code, 200);
        assert_eq!(result.body, Some(b"world".to_vec()));
        assert_eq!(fx.forwarder.pending_count(), 0);
        assert_eq!(fx.registry.list()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn forward_times_out_and_drops_late_response() {
        let mut fx = fixture("abc123abc123");
        let result = fx
            .forwarder
            .forward(&fx.session, request(), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(ForwardError::Timeout)));

        // The envelope was sent; a reply arriving now is dropped silently.
        let envelope = fx.outbound.recv().await.unwrap();
        fx.forwarder.on_response(envelope.correlation_id, response());
        assert_eq!(fx.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn unregister_fails_inflight_with_disconnect() {
        let mut fx = fixture("abc123abc123");
        let forwarder = fx.forwarder.clone();
        let session = fx.session.clone();
        let task = tokio::spawn(async move {
            forwarder
                .forward(&session, request(), Duration::from_secs(30))
                .await
        });

        // Make sure the request is in flight before pulling the session.
        let envelope = fx.outbound.recv().await.unwrap();
        fx.registry.unregister("abc123abc123", CloseReason::Normal);

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ForwardError::Disconnected)));

        // A response racing in after the disconnect is dropped.
        fx.forwarder.on_response(envelope.correlation_id, response());
        assert_eq!(fx.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn forward_to_unregistered_session_is_disconnected() {
        let fx = fixture("abc123abc123");
        fx.registry.unregister("abc123abc123", CloseReason::Normal);
        let result = fx
            .forwarder
            .forward(&fx.session, request(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(ForwardError::Disconnected)));
        assert_eq!(fx.forwarder.pending_count(), 0);
    }

    #[tokio::test]
    async fn completion_is_at_most_once() {
        let table = Arc::new(PendingTable::new());
        let id = CorrelationId::new();
        let rx = table.insert(id, "abc123abc123".to_string());

        let a = table.clone();
        let b = table.clone();
        let first = tokio::spawn(async move { a.complete(id, response()) });
        let second = tokio::spawn(async move { b.fail(id, ForwardError::Timeout) });
        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert!(first ^ second, "exactly one completion must win");
        // Whatever won, the slot has exactly one value.
        assert!(rx.await.is_ok());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn remote_error_maps_through_its_code() {
        let mut fx = fixture("abc123abc123");
        let forwarder = fx.forwarder.clone();
        let session = fx.session.clone();
        let task = tokio::spawn(async move {
            forwarder
                .forward(&session, request(), Duration::from_secs(5))
                .await
        });

        let envelope = fx.outbound.recv().await.unwrap();
        fx.forwarder.on_error(
            envelope.correlation_id,
            ErrorPayload {
                code: ErrorCode::RateLimited,
                message: "slow down".to_string(),
            },
        );

        let result = task.await.unwrap();
        match result {
            Err(err @ ForwardError::Remote(_)) => assert_eq!(err.http_status(), 429),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fail_all_completes_everything_with_shutdown() {
        let table = Arc::new(PendingTable::new());
        let rx1 = table.insert(CorrelationId::new(), "a".to_string());
        let rx2 = table.insert(CorrelationId::new(), "b".to_string());
        table.fail_all(ForwardError::Shutdown);
        assert!(matches!(rx1.await.unwrap(), Err(ForwardError::Shutdown)));
        assert!(matches!(rx2.await.unwrap(), Err(ForwardError::Shutdown)));
        assert!(table.is_empty());
    }
}
