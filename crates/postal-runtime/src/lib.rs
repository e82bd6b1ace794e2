//! Postal Runtime
//!
//! Orchestration for the postal delivery pipeline: the serial store task,
//! the upstream sender and its schedulable cycle, the Post Office façade
//! with downstream dispatch, a tokio-backed task scheduler, and the builder
//! that wires them together. All state machines and stable types live in
//! `postal-core` and are re-exported here for convenience.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod builder;
pub mod dispatch;
pub mod post_office;
pub mod scheduler;
pub mod sender;
pub mod store_task;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use builder::{PostOfficeBuilder, PostOfficeHandle};
pub use dispatch::{DispatchReport, DispatchTable};
pub use post_office::PostOffice;
pub use scheduler::TokioScheduler;
pub use sender::{CycleReport, SendCycleTask, UpstreamSender};
pub use store_task::{create_store_channel, StoreCommand, StoreHandle, StoreTask, SweepReport};

// Core types most embedders need alongside the runtime
pub use postal_core;
pub use postal_core::{
    BatchCriteria, Courier, CourierError, CourierId, CourierLounge, EnvelopeId, Message,
    MessageType, MessageTypeRegistry, Mixin, MixinError, PostalConfig, PostalError, RawFields,
    SendOptions, SendPriority, TaskOptions, TaskOutcome, TaskScheduler,
};
