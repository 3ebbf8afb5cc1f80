//! Tunnel session registry.
//!
//! Sole owner of the subdomain -> session mapping and of the per-session set
//! of in-flight correlation ids. Map operations are atomic; completions and
//! channel closes always happen after the protected section.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use relay_core::{CorrelationId, Envelope, OutboundQueue};

use crate::forwarder::{ForwardError, PendingTable};

/// Why a channel is being closed; mapped to a WebSocket close code by the
/// channel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Clean teardown (client UNREGISTER or channel EOF).
    Normal,
    /// Server shutting down.
    GoingAway,
    /// Handshake or framing violation.
    PolicyViolation,
    /// Server-side failure, including heartbeat death.
    Internal,
}

impl CloseReason {
    pub fn ws_code(&self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::PolicyViolation => 1008,
            CloseReason::Internal => 1011,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal closure",
            CloseReason::GoingAway => "server shutting down",
            CloseReason::PolicyViolation => "policy violation",
            CloseReason::Internal => "internal error",
        }
    }
}

/// One live tunnel, owned by the registry from REGISTERED until channel close
/// or UNREGISTER.
pub struct TunnelSession {
    pub subdomain: String,
    pub created_at: DateTime<Utc>,
    queue: OutboundQueue,
    close_tx: watch::Sender<Option<CloseReason>>,
    missed_pongs: AtomicU32,
    last_pong: Mutex<Option<DateTime<Utc>>>,
}

impl TunnelSession {
    pub fn new(subdomain: impl Into<String>, queue: OutboundQueue) -> Self {
        let (close_tx, _) = watch::channel(None);
        Self {
            subdomain: subdomain.into(),
            created_at: Utc::now(),
            queue,
            close_tx,
            missed_pongs: AtomicU32::new(0),
            last_pong: Mutex::new(None),
        }
    }

    /// Post an envelope to the channel's outbound queue. Never blocks; false
    /// once the writer task has gone away.
    pub fn publish(&self, envelope: Envelope) -> bool {
        self.queue.publish(envelope)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Ask the channel endpoint to close the socket. Idempotent; the first
    /// reason wins.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// Subscription used by the channel's writer task.
    pub fn close_signal(&self) -> watch::Receiver<Option<CloseReason>> {
        self.close_tx.subscribe()
    }

    /// Record an outgoing PING; returns how many are now unanswered.
    pub fn note_ping_sent(&self) -> u32 {
        self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record PONG (or HEARTBEAT) receipt.
    pub fn mark_pong(&self) {
        self.missed_pongs.store(0, Ordering::SeqCst);
        if let Ok(mut last) = self.last_pong.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn missed_pongs(&self) -> u32 {
        self.missed_pongs.load(Ordering::SeqCst)
    }

    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.last_pong.lock().ok().and_then(|g| *g)
    }
}

/// Snapshot row returned by [`SessionRegistry::list`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub subdomain: String,
    pub created_at: DateTime<Utc>,
    pub in_flight: usize,
    pub queue_depth: usize,
}

/// Registry of all active tunnels.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<TunnelSession>>,
    inflight: DashMap<String, HashSet<CorrelationId>>,
    pendings: Arc<PendingTable>,
}

impl SessionRegistry {
    pub fn new(pendings: Arc<PendingTable>) -> Self {
        Self {
            sessions: DashMap::new(),
            inflight: DashMap::new(),
            pendings,
        }
    }

    /// Atomic insert-if-absent; false when the subdomain is already taken.
    pub fn register(&self, session: Arc<TunnelSession>) -> bool {
        match self.sessions.entry(session.subdomain.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.inflight
                    .insert(session.subdomain.clone(), HashSet::new());
                info!(subdomain = %session.subdomain, "session registered");
                slot.insert(session);
                true
            }
        }
    }

    /// Atomic remove. On success every tracked pending completes as
    /// disconnected and the channel is told to close with `reason`.
    pub fn unregister(&self, subdomain: &str, reason: CloseReason) -> bool {
        let Some((_, session)) = self.sessions.remove(subdomain) else {
            return false;
        };
        let drained: Vec<CorrelationId> = self
            .inflight
            .remove(subdomain)
            .map(|(_, ids)| ids.into_iter().collect())
            .unwrap_or_default();

        for id in &drained {
            self.pendings.fail(*id, ForwardError::Disconnected);
        }
        session.close(reason);
        info!(
            subdomain,
            in_flight = drained.len(),
            queue_depth = session.queue_depth(),
            "session unregistered"
        );
        true
    }

    pub fn lookup(&self, subdomain: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.get(subdomain).map(|s| s.clone())
    }

    pub fn has(&self, subdomain: &str) -> bool {
        self.sessions.contains_key(subdomain)
    }

    pub fn size(&self) -> usize {
        self.sessions.len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionInfo {
                    subdomain: session.subdomain.clone(),
                    created_at: session.created_at,
                    in_flight: self
                        .inflight
                        .get(&session.subdomain)
                        .map(|ids| ids.len())
                        .unwrap_or(0),
                    queue_depth: session.queue_depth(),
                }
            })
            .collect()
    }

    /// Add a correlation id to the session's in-flight set. False when the
    /// session is already gone, in which case the caller must fail the
    /// pending itself.
    pub fn track(&self, subdomain: &str, id: CorrelationId) -> bool {
        match self.inflight.get_mut(subdomain) {
            Some(mut ids) => {
                ids.insert(id);
                true
            }
            None => false,
        }
    }

    /// Drop a correlation id from the in-flight set; no-op if the session is
    /// gone.
    pub fn untrack(&self, subdomain: &str, id: CorrelationId) {
        if let Some(mut ids) = self.inflight.get_mut(subdomain) {
            ids.remove(&id);
        } else {
            debug!(subdomain, correlation_id = %id, "untrack on absent session");
        }
    }

    /// Tear everything down: close every channel as going-away, complete
    /// every pending with a server error, clear both indices.
    pub fn shutdown(&self) {
        let subdomains: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for subdomain in subdomains {
            let Some((_, session)) = self.sessions.remove(&subdomain) else {
                continue;
            };
            let drained: Vec<CorrelationId> = self
                .inflight
                .remove(&subdomain)
                .map(|(_, ids)| ids.into_iter().collect())
                .unwrap_or_default();
            for id in &drained {
                self.pendings.fail(*id, ForwardError::Shutdown);
            }
            session.close(CloseReason::GoingAway);
        }
        self.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::outbound_queue;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(PendingTable::new()))
    }

    fn session(subdomain: &str) -> Arc<TunnelSession> {
        let (queue, _rx) = outbound_queue();
        Arc::new(TunnelSession::new(subdomain, queue))
    }

    #[test]
    fn register_is_insert_if_absent() {
        let registry = registry();
        assert!(registry.register(session("abc123abc123")));
        assert!(!registry.register(session("abc123abc123")));
        assert_eq!(registry.size(), 1);
        assert!(registry.has("abc123abc123"));
        assert!(!registry.has("zzz999zzz999"));
    }

    #[tokio::test]
    async fn concurrent_register_admits_exactly_one() {
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.register(session("samesamesame"))
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn unregister_removes_and_signals_close() {
        let registry = registry();
        let s = session("abc123abc123");
        let mut close = s.close_signal();
        registry.register(s);

        assert!(registry.unregister("abc123abc123", CloseReason::Normal));
        assert!(!registry.has("abc123abc123"));
        assert_eq!(*close.borrow_and_update(), Some(CloseReason::Normal));
        // Second unregister is a no-op.
        assert!(!registry.unregister("abc123abc123", CloseReason::Normal));
    }

    #[test]
    fn track_untrack_are_noops_for_absent_sessions() {
        let registry = registry();
        assert!(!registry.track("ghost", CorrelationId::new()));
        registry.untrack("ghost", CorrelationId::new());

        registry.register(session("abc123abc123"));
        let id = CorrelationId::new();
        assert!(registry.track("abc123abc123", id));
        assert_eq!(registry.list()[0].in_flight, 1);
        registry.untrack("abc123abc123", id);
        assert_eq!(registry.list()[0].in_flight, 0);
    }

    #[test]
    fn close_keeps_first_reason() {
        let s = session("abc123abc123");
        let mut signal = s.close_signal();
        s.close(CloseReason::Internal);
        s.close(CloseReason::Normal);
        assert_eq!(*signal.borrow_and_update(), Some(CloseReason::Internal));
    }

    #[test]
    fn heartbeat_bookkeeping() {
        let s = session("abc123abc123");
        assert_eq!(s.missed_pongs(), 0);
        assert_eq!(s.note_ping_sent(), 1);
        assert_eq!(s.note_ping_sent(), 2);
        s.mark_pong();
        assert_eq!(s.missed_pongs(), 0);
        assert!(s.last_pong().is_some());
    }

    #[test]
    fn shutdown_clears_everything() {
        let registry = registry();
        registry.register(session("aaaaaaaaaaaa"));
        registry.register(session("bbbbbbbbbbbb"));
        registry.shutdown();
        assert_eq!(registry.size(), 0);
        assert!(registry.list().is_empty());
    }
}
