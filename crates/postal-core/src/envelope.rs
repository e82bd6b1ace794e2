//! Upstream envelope: the persisted wrapper around one outbound message
//!
//! An envelope carries the retry/lifecycle metadata the store needs for
//! at-least-once delivery. It is in exactly one of two live states —
//! pending or in flight — and leaves the store on terminal success
//! (acknowledged) or terminal expiration.

use serde::{Deserialize, Serialize};

use crate::message::SealedMessage;
use crate::types::{CourierId, EnvelopeId, SendPriority, Timestamp};

// ----------------------------------------------------------------------------
// Envelope State
// ----------------------------------------------------------------------------

/// Live state of an envelope, derived from its in-flight deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Eligible for the next send cycle
    Pending,
    /// Handed to a courier, awaiting acknowledge or deadline
    InFlight,
}

// ----------------------------------------------------------------------------
// Upstream Envelope
// ----------------------------------------------------------------------------

/// A persisted outbound message with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamEnvelope {
    /// Unique id, generated at enqueue time
    pub id: EnvelopeId,
    /// The sealed message to deliver
    pub message: SealedMessage,
    /// When the envelope was enqueued
    pub created_at: Timestamp,
    /// Priority tier governing batch ordering
    pub priority: SendPriority,
    /// Absolute expiry; past this the envelope is dropped without sending
    pub ttl: Option<Timestamp>,
    /// Number of completed send attempts
    pub attempt_count: u32,
    /// Deadline recorded when handed to a courier; `None` while pending
    pub in_flight_deadline: Option<Timestamp>,
    /// Assigned courier, `None` until a producer or sender picks one
    pub courier_id: Option<CourierId>,
    /// Whether the backend must acknowledge receipt downstream
    pub requires_delivery_ack: bool,
    /// Monotonic sequence for FIFO ordering within a priority tier
    pub sequence: u64,
}

impl UpstreamEnvelope {
    /// Derive the live state from the in-flight deadline
    pub fn state(&self) -> EnvelopeState {
        if self.in_flight_deadline.is_some() {
            EnvelopeState::InFlight
        } else {
            EnvelopeState::Pending
        }
    }

    /// Whether the envelope's time-to-live has passed
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.ttl, Some(expiry) if now >= expiry)
    }

    /// Whether an in-flight envelope's deadline has passed
    pub fn is_flight_timed_out(&self, now: Timestamp) -> bool {
        matches!(self.in_flight_deadline, Some(deadline) if now >= deadline)
    }

    /// Transition pending → in flight, recording the deadline
    pub fn mark_in_flight(&mut self, deadline: Timestamp) {
        self.in_flight_deadline = Some(deadline);
    }

    /// Transition in flight → pending, counting the failed attempt
    pub fn release(&mut self) {
        self.in_flight_deadline = None;
        self.attempt_count = self.attempt_count.saturating_add(1);
    }

    /// Whether the next attempt would exceed the configured maximum
    pub fn attempts_exhausted(&self, max_attempts: u32) -> bool {
        self.attempt_count.saturating_add(1) >= max_attempts
    }
}

// ----------------------------------------------------------------------------
// Send Options
// ----------------------------------------------------------------------------

/// Per-message options applied at enqueue time
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: SendPriority,
    /// Relative time-to-live, converted to an absolute expiry at enqueue
    pub ttl: Option<core::time::Duration>,
    /// Preferred courier; the lounge falls back to the default if absent
    pub courier_id: Option<CourierId>,
    pub requires_delivery_ack: bool,
}

impl SendOptions {
    pub fn with_priority(priority: SendPriority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::types::MessageType;

    fn test_envelope() -> UpstreamEnvelope {
        let message = Message::new(MessageType::new(10), serde_json::Map::new()).seal(Vec::new());
        UpstreamEnvelope {
            id: EnvelopeId::generate(),
            message,
            created_at: Timestamp::new(1_000),
            priority: SendPriority::Buffer,
            ttl: None,
            attempt_count: 0,
            in_flight_deadline: None,
            courier_id: None,
            requires_delivery_ack: false,
            sequence: 0,
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut envelope = test_envelope();
        assert_eq!(envelope.state(), EnvelopeState::Pending);

        envelope.mark_in_flight(Timestamp::new(2_000));
        assert_eq!(envelope.state(), EnvelopeState::InFlight);
        assert!(!envelope.is_flight_timed_out(Timestamp::new(1_500)));
        assert!(envelope.is_flight_timed_out(Timestamp::new(2_000)));

        envelope.release();
        assert_eq!(envelope.state(), EnvelopeState::Pending);
        assert_eq!(envelope.attempt_count, 1);
    }

    #[test]
    fn test_expiry() {
        let mut envelope = test_envelope();
        assert!(!envelope.is_expired(Timestamp::new(u64::MAX)));

        envelope.ttl = Some(Timestamp::new(5_000));
        assert!(!envelope.is_expired(Timestamp::new(4_999)));
        assert!(envelope.is_expired(Timestamp::new(5_000)));
    }

    #[test]
    fn test_attempts_exhausted() {
        let mut envelope = test_envelope();
        assert!(!envelope.attempts_exhausted(2));

        envelope.release();
        assert!(envelope.attempts_exhausted(2));
        assert!(!envelope.attempts_exhausted(5));
    }

    #[test]
    fn test_envelope_persistence_round_trip() {
        let mut envelope = test_envelope();
        envelope.mark_in_flight(Timestamp::new(9_000));

        let encoded = serde_json::to_string(&envelope).unwrap();
        let decoded: UpstreamEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, envelope.id);
        assert_eq!(decoded.state(), EnvelopeState::InFlight);
        assert_eq!(decoded.priority, SendPriority::Buffer);
    }
}
