//! Error types for the postal delivery pipeline
//!
//! Each concern carries its own error enum; [`PostalError`] unifies them at
//! the crate boundary. Transport failures never leak past the courier
//! boundary as raw I/O errors — the upstream sender converts them to the
//! tri-state task outcome.

use crate::types::{CourierId, MessageType};

// ----------------------------------------------------------------------------
// Store Errors
// ----------------------------------------------------------------------------

/// Errors from the message store and its persistence backend
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Persistence backend I/O error: {0}")]
    Backend(#[from] std::io::Error),
    #[error("Persisted envelope could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Store at maximum capacity ({capacity} envelopes)")]
    CapacityExceeded { capacity: usize },
    #[error("Store command queue is closed")]
    QueueClosed,
}

// ----------------------------------------------------------------------------
// Courier Errors
// ----------------------------------------------------------------------------

/// Errors from transport resolution and parcel transmission
#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("No courier registered for id {courier_id} and no default configured")]
    Unresolvable { courier_id: CourierId },
    #[error("No default courier configured")]
    NoDefault,
    #[error("Courier {courier_id} failed to send parcel: {reason}")]
    SendFailed { courier_id: CourierId, reason: String },
    #[error("Courier {courier_id} timed out after {duration_ms}ms")]
    Timeout { courier_id: CourierId, duration_ms: u64 },
}

// ----------------------------------------------------------------------------
// Registry Errors
// ----------------------------------------------------------------------------

/// Programming errors in message-type registration
///
/// These are fatal at initialization time and must fail loudly, never
/// silently degrade.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Message type {message_type} already registered by area '{existing_area}' (attempted by '{new_area}')")]
    DuplicateType {
        message_type: MessageType,
        existing_area: &'static str,
        new_area: &'static str,
    },
    #[error("Message type {message_type} is outside the reserved range of area '{area}'")]
    OutsideReservedRange {
        message_type: MessageType,
        area: &'static str,
    },
    #[error("Unknown functional area '{area}'")]
    UnknownArea { area: String },
    #[error("Message type {message_type} was never registered")]
    UnregisteredType { message_type: MessageType },
}

// ----------------------------------------------------------------------------
// Dispatch Errors
// ----------------------------------------------------------------------------

/// Errors from downstream dispatch registration
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Cannot decode payload for message type {message_type}: {reason}")]
    Decode {
        message_type: MessageType,
        reason: String,
    },
    #[error("Malformed downstream parcel: {reason}")]
    MalformedParcel { reason: String },
}

// ----------------------------------------------------------------------------
// Scheduler Errors
// ----------------------------------------------------------------------------

/// Errors from the external scheduling collaborator
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task '{task_id}' already scheduled and existing-task policy is Keep")]
    AlreadyScheduled { task_id: String },
    #[error("Scheduler is shut down")]
    ShutDown,
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Top-level error type for the postal pipeline
#[derive(Debug, thiserror::Error)]
pub enum PostalError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Courier error: {0}")]
    Courier(#[from] CourierError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

pub type Result<T> = core::result::Result<T, PostalError>;
