//! Configuration for the postal delivery pipeline
//!
//! Plain config structs with sensible defaults plus a `testing()` preset
//! that shrinks buffers and timeouts for fast deterministic tests.

use core::time::Duration;

// ----------------------------------------------------------------------------
// Store Configuration
// ----------------------------------------------------------------------------

/// Configuration for the message store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of envelopes held at once; `enqueue` fails beyond this
    pub max_pending: usize,
    /// How long an envelope may stay in flight before the next sweep
    /// releases it back to pending
    pub in_flight_timeout: Duration,
    /// Default time-to-live applied when the producer sets none
    pub default_ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_pending: 10_000,
            in_flight_timeout: Duration::from_secs(120),
            default_ttl: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Sender Configuration
// ----------------------------------------------------------------------------

/// Configuration for the upstream sender
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum delivery attempts before a final-attempt cycle drops an
    /// envelope permanently
    pub max_send_attempts: u32,
    /// Maximum number of envelopes per parcel
    pub parcel_max_messages: usize,
    /// Maximum serialized payload bytes per parcel
    pub parcel_max_bytes: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 5,
            parcel_max_messages: 100,
            parcel_max_bytes: 512 * 1024,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the serial store command queue
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bound of the store command channel
    pub command_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 100,
        }
    }
}

// ----------------------------------------------------------------------------
// Combined Configuration
// ----------------------------------------------------------------------------

/// Combined configuration for the pipeline
#[derive(Debug, Clone, Default)]
pub struct PostalConfig {
    pub store: StoreConfig,
    pub sender: SenderConfig,
    pub channel: ChannelConfig,
}

impl PostalConfig {
    /// Preset with small limits and short timeouts for tests
    pub fn testing() -> Self {
        Self {
            store: StoreConfig {
                max_pending: 100,
                in_flight_timeout: Duration::from_millis(200),
                default_ttl: None,
            },
            sender: SenderConfig {
                max_send_attempts: 2,
                parcel_max_messages: 10,
                parcel_max_bytes: 16 * 1024,
            },
            channel: ChannelConfig {
                command_buffer_size: 16,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
