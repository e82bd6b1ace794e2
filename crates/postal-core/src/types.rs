//! Core types for the postal delivery pipeline
//!
//! This module defines the fundamental identifier and time types used
//! throughout the pipeline, using newtype patterns for type safety.

use core::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Message Type
// ----------------------------------------------------------------------------

/// Integer discriminator identifying the decoder/encoder for a message
///
/// Message types form a flat, process-wide namespace partitioned into
/// reserved ranges per functional area (see [`crate::registry`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(i32);

impl MessageType {
    /// Create a new message type from its raw integer value
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    /// Get the raw integer value
    pub const fn value(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for MessageType {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

// ----------------------------------------------------------------------------
// Envelope Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a persisted upstream envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(Uuid);

impl EnvelopeId {
    /// Generate a fresh envelope id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (e.g. loaded from persistence)
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Courier Identifier
// ----------------------------------------------------------------------------

/// Identifier for a registered transport ("courier")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourierId(String);

impl CourierId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CourierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CourierId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ----------------------------------------------------------------------------
// Send Priority
// ----------------------------------------------------------------------------

/// How soon the upstream sender should batch a message
///
/// The relative ordering is the contract: within one send cycle, `Immediate`
/// messages are always selected before `Buffer`, and `Buffer` before
/// `Whenever`. Absolute latency is owned by the external task scheduler.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum SendPriority {
    /// Deliver as soon as a cycle runs
    Immediate,
    /// Deliver with the next regular batch
    #[default]
    Buffer,
    /// Deliver opportunistically, after everything else
    Whenever,
}

impl SendPriority {
    /// Rank used for ordering in the store: lower rank is selected first
    pub const fn rank(&self) -> u8 {
        match self {
            SendPriority::Immediate => 0,
            SendPriority::Buffer => 1,
            SendPriority::Whenever => 2,
        }
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Add a duration to this timestamp
    pub fn add_duration(&self, duration: core::time::Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Trait for obtaining the current time
///
/// Store sweeps (in-flight timeouts, expirations) are driven entirely by a
/// `TimeSource`, so tests can use [`ManualTimeSource`] instead of sleeping.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of [`TimeSource`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced time source for deterministic tests
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    millis: std::sync::atomic::AtomicU64,
}

impl ManualTimeSource {
    /// Create a manual time source starting at the given instant
    pub fn starting_at(timestamp: Timestamp) -> Self {
        Self {
            millis: std::sync::atomic::AtomicU64::new(timestamp.as_millis()),
        }
    }

    /// Advance the clock by a duration
    pub fn advance(&self, duration: core::time::Duration) {
        self.millis.fetch_add(
            duration.as_millis() as u64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    /// Set the clock to an absolute instant
    pub fn set(&self, timestamp: Timestamp) {
        self.millis
            .store(timestamp.as_millis(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(std::sync::atomic::Ordering::SeqCst))
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn test_priority_rank_ordering() {
        assert!(SendPriority::Immediate.rank() < SendPriority::Buffer.rank());
        assert!(SendPriority::Buffer.rank() < SendPriority::Whenever.rank());
        assert_eq!(SendPriority::default(), SendPriority::Buffer);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let base = Timestamp::new(1_000);
        let later = base.add_duration(Duration::from_secs(2));
        assert_eq!(later.as_millis(), 3_000);
        assert_eq!(later.duration_since(base), Duration::from_secs(2));
        // Saturating: earlier - later yields zero
        assert_eq!(base.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::starting_at(Timestamp::new(500));
        assert_eq!(clock.now().as_millis(), 500);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now().as_millis(), 750);

        clock.set(Timestamp::new(10));
        assert_eq!(clock.now().as_millis(), 10);
    }

    #[test]
    fn test_envelope_id_uniqueness() {
        let a = EnvelopeId::generate();
        let b = EnvelopeId::generate();
        assert_ne!(a, b);
    }
}
