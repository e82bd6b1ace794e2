//! Postal Core
//!
//! Foundational types and state machines for the postal delivery pipeline:
//! the typed message/parcel model, the message-type registry, the durable
//! message store, the courier abstraction, and the external scheduling
//! contract. Orchestration (the serial store task, upstream sender and the
//! Post Office façade) lives in `postal-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod envelope;
pub mod errors;
pub mod lounge;
pub mod message;
pub mod parcel;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{ChannelConfig, PostalConfig, SenderConfig, StoreConfig};
pub use envelope::{EnvelopeState, SendOptions, UpstreamEnvelope};
pub use errors::{
    CourierError, DispatchError, PostalError, RegistryError, Result, SchedulerError, StoreError,
};
pub use lounge::{Courier, CourierLounge};
pub use message::{Message, Mixin, MixinError, MixinOutput, RawFields, SealedMessage};
pub use parcel::{DownstreamEntry, DownstreamParcel, UpstreamParcel, TYPE_KEY};
pub use registry::{core_types, AreaRange, MessageTypeRegistry, RESERVED_AREAS};
pub use scheduler::{
    BackoffPolicy, ExistingTaskPolicy, NetworkRequirement, SchedulableTask, TaskId, TaskOptions,
    TaskOutcome, TaskScheduler,
};
pub use store::{
    BatchCriteria, JsonFileBackend, MemoryBackend, MessageStore, StoreBackend, StoreStats,
};
pub use types::{
    CourierId, EnvelopeId, ManualTimeSource, MessageType, SendPriority, SystemTimeSource,
    TimeSource, Timestamp,
};
