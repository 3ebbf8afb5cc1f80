//! Per-channel outbound queue drained by a single writer task.
//!
//! Publishing never blocks; ordering is preserved by the single-writer
//! discipline. The queue is unbounded in v1 but its depth is observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// Sending half, cloneable and shared by anything that posts to the channel.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    depth: Arc<AtomicUsize>,
}

/// Receiving half, owned by the channel's writer task.
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<Envelope>,
    depth: Arc<AtomicUsize>,
}

/// Create a fresh queue pair.
pub fn outbound_queue() -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        OutboundQueue {
            tx,
            depth: depth.clone(),
        },
        OutboundReceiver { rx, depth },
    )
}

impl OutboundQueue {
    /// Post an envelope. Returns false when the writer has gone away.
    pub fn publish(&self, envelope: Envelope) -> bool {
        if self.tx.send(envelope).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Number of envelopes posted but not yet picked up by the writer.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl OutboundReceiver {
    /// Await the next envelope; `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await;
        if envelope.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        envelope
    }

    /// Drain whatever is already queued without waiting. Used by the writer to
    /// flush a final DISCONNECT before closing the socket.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        match self.rx.try_recv() {
            Ok(envelope) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Some(envelope)
            }
            Err(_) => None,
        }
    }
}
