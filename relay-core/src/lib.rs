//! Shared types for the relay tunnel.
//!
//! This crate holds what both sides of the channel agree on: the envelope
//! codec, the error kinds and their HTTP mapping, the hop-by-hop header
//! policy, and the single-writer outbound queue.

pub mod envelope;
pub mod error;
pub mod headers;
pub mod queue;

pub use envelope::{
    ControlAction, ControlPayload, CorrelationId, DecodeError, DisconnectReason, Envelope,
    EnvelopeType, ErrorPayload, Payload, RequestPayload, ResponsePayload,
};
pub use error::ErrorCode;
pub use queue::{outbound_queue, OutboundQueue, OutboundReceiver};
