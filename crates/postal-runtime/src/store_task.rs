//! Serial store task
//!
//! All message-store mutations flow through one task draining a command
//! channel, so `enqueue`/`mark_in_flight`/`acknowledge`/sweeps are race-free
//! without per-call locking. Compound operations (select then mark in
//! flight) execute as a single command and are therefore atomic with
//! respect to every other command. Network I/O never runs on this task;
//! courier calls and mixin collection happen elsewhere and come back here
//! only as commands.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use postal_core::{
    BatchCriteria, ChannelConfig, EnvelopeId, SealedMessage, SendOptions, StoreBackend,
    StoreError, StoreStats, Timestamp, UpstreamEnvelope,
};
use postal_core::MessageStore;

// ----------------------------------------------------------------------------
// Commands
// ----------------------------------------------------------------------------

/// Result of one cleanup sweep (timeouts then expirations)
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// In-flight envelopes released because their deadline passed
    pub timeouts_reset: usize,
    /// Envelopes dropped because their time-to-live passed
    pub expired: usize,
}

/// Commands processed by the store task, one at a time
pub enum StoreCommand {
    Enqueue {
        message: SealedMessage,
        options: SendOptions,
        reply: oneshot::Sender<Result<EnvelopeId, StoreError>>,
    },
    SelectAndMarkInFlight {
        criteria: BatchCriteria,
        deadline: Timestamp,
        reply: oneshot::Sender<Result<Vec<UpstreamEnvelope>, StoreError>>,
    },
    Acknowledge {
        ids: Vec<EnvelopeId>,
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    ReleaseInFlight {
        ids: Vec<EnvelopeId>,
        reply: oneshot::Sender<Result<usize, StoreError>>,
    },
    Sweep {
        reply: oneshot::Sender<Result<SweepReport, StoreError>>,
    },
    Stats {
        reply: oneshot::Sender<StoreStats>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Create the bounded store command channel
pub fn create_store_channel(
    config: &ChannelConfig,
) -> (mpsc::Sender<StoreCommand>, mpsc::Receiver<StoreCommand>) {
    mpsc::channel(config.command_buffer_size)
}

// ----------------------------------------------------------------------------
// Store Task
// ----------------------------------------------------------------------------

/// The task owning the message store and draining commands serially
pub struct StoreTask<B: StoreBackend> {
    store: MessageStore<B>,
    receiver: mpsc::Receiver<StoreCommand>,
}

impl<B: StoreBackend> StoreTask<B> {
    pub fn new(store: MessageStore<B>, receiver: mpsc::Receiver<StoreCommand>) -> Self {
        Self { store, receiver }
    }

    /// Run until shutdown or every handle is dropped
    pub async fn run(mut self) {
        info!("store task starting");

        while let Some(command) = self.receiver.recv().await {
            match command {
                StoreCommand::Enqueue {
                    message,
                    options,
                    reply,
                } => {
                    let result = self.store.enqueue(message, options);
                    if let Err(err) = &result {
                        error!(error = %err, "enqueue failed");
                    }
                    let _ = reply.send(result);
                }
                StoreCommand::SelectAndMarkInFlight {
                    criteria,
                    deadline,
                    reply,
                } => {
                    let result = self.store.select_and_mark_in_flight(&criteria, deadline);
                    if let Ok(batch) = &result {
                        debug!(count = batch.len(), "selected batch for send");
                    }
                    let _ = reply.send(result);
                }
                StoreCommand::Acknowledge { ids, reply } => {
                    let _ = reply.send(self.store.acknowledge(&ids));
                }
                StoreCommand::ReleaseInFlight { ids, reply } => {
                    let _ = reply.send(self.store.release_in_flight(&ids));
                }
                StoreCommand::Sweep { reply } => {
                    let result = self
                        .store
                        .check_in_flight_timeouts()
                        .and_then(|timeouts_reset| {
                            let expired = self.store.check_expirations()?;
                            Ok(SweepReport {
                                timeouts_reset,
                                expired,
                            })
                        });
                    let _ = reply.send(result);
                }
                StoreCommand::Stats { reply } => {
                    let _ = reply.send(self.store.stats().clone());
                }
                StoreCommand::Len { reply } => {
                    let _ = reply.send(self.store.len());
                }
                StoreCommand::Shutdown => {
                    info!("store task shutting down");
                    break;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Store Handle
// ----------------------------------------------------------------------------

/// Clonable async handle onto the serial store task
#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    pub fn new(sender: mpsc::Sender<StoreCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        command: StoreCommand,
        receiver: oneshot::Receiver<Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        receiver.await.map_err(|_| StoreError::QueueClosed)?
    }

    /// Persist a new pending envelope
    pub async fn enqueue(
        &self,
        message: SealedMessage,
        options: SendOptions,
    ) -> Result<EnvelopeId, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.request(
            StoreCommand::Enqueue {
                message,
                options,
                reply,
            },
            receiver,
        )
        .await
    }

    /// Atomically select a batch and mark it in flight
    pub async fn select_and_mark_in_flight(
        &self,
        criteria: BatchCriteria,
        deadline: Timestamp,
    ) -> Result<Vec<UpstreamEnvelope>, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.request(
            StoreCommand::SelectAndMarkInFlight {
                criteria,
                deadline,
                reply,
            },
            receiver,
        )
        .await
    }

    /// Remove envelopes on terminal success; idempotent
    pub async fn acknowledge(&self, ids: Vec<EnvelopeId>) -> Result<usize, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.request(StoreCommand::Acknowledge { ids, reply }, receiver)
            .await
    }

    /// Return in-flight envelopes to pending after a failed transmission
    pub async fn release_in_flight(&self, ids: Vec<EnvelopeId>) -> Result<usize, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.request(StoreCommand::ReleaseInFlight { ids, reply }, receiver)
            .await
    }

    /// Run the cleanup sweep: in-flight timeouts, then expirations
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.request(StoreCommand::Sweep { reply }, receiver).await
    }

    /// Snapshot of store counters
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(StoreCommand::Stats { reply })
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        receiver.await.map_err(|_| StoreError::QueueClosed)
    }

    /// Number of live envelopes (pending + in flight)
    pub async fn len(&self) -> Result<usize, StoreError> {
        let (reply, receiver) = oneshot::channel();
        self.sender
            .send(StoreCommand::Len { reply })
            .await
            .map_err(|_| StoreError::QueueClosed)?;
        receiver.await.map_err(|_| StoreError::QueueClosed)
    }

    /// Ask the store task to stop after the commands already queued
    pub async fn shutdown(&self) {
        let _ = self.sender.send(StoreCommand::Shutdown).await;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
