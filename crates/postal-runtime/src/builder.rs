//! Builder and handle for the assembled pipeline
//!
//! Wires config, backend, registry and couriers into a running Post Office:
//! constructs the store, spawns the serial store task, and hands back a
//! handle holding the façade, the sender and the join handle for shutdown.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use postal_core::{
    Courier, CourierId, CourierLounge, MemoryBackend, MessageStore, MessageTypeRegistry,
    PostalConfig, PostalError, StoreBackend, SystemTimeSource, TimeSource,
};

use crate::dispatch::DispatchTable;
use crate::post_office::PostOffice;
use crate::sender::{SendCycleTask, UpstreamSender};
use crate::store_task::{create_store_channel, StoreHandle, StoreTask};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builds and starts the delivery pipeline
pub struct PostOfficeBuilder<B: StoreBackend> {
    config: PostalConfig,
    backend: B,
    registry: Option<Arc<MessageTypeRegistry>>,
    couriers: Vec<Arc<dyn Courier>>,
    default_courier: Option<CourierId>,
    time_source: Arc<dyn TimeSource>,
}

impl PostOfficeBuilder<MemoryBackend> {
    /// Builder backed by the in-memory store
    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }
}

impl<B: StoreBackend + Send + 'static> PostOfficeBuilder<B> {
    pub fn with_backend(backend: B) -> Self {
        Self {
            config: PostalConfig::default(),
            backend,
            registry: None,
            couriers: Vec::new(),
            default_courier: None,
            time_source: Arc::new(SystemTimeSource),
        }
    }

    pub fn config(mut self, config: PostalConfig) -> Self {
        self.config = config;
        self
    }

    /// Supply a pre-populated registry; defaults to one carrying only the
    /// core types
    pub fn registry(mut self, registry: Arc<MessageTypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn courier(mut self, courier: Arc<dyn Courier>) -> Self {
        self.couriers.push(courier);
        self
    }

    pub fn default_courier(mut self, id: CourierId) -> Self {
        self.default_courier = Some(id);
        self
    }

    pub fn time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Construct the store, spawn the store task, and assemble the façade
    pub fn build(self) -> Result<PostOfficeHandle, PostalError> {
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(MessageTypeRegistry::with_core_types()?),
        };

        let store = MessageStore::new(
            self.backend,
            self.config.store.clone(),
            self.time_source.clone(),
        )?;
        let (command_sender, command_receiver) = create_store_channel(&self.config.channel);
        let store_task = tokio::spawn(StoreTask::new(store, command_receiver).run());
        let store = StoreHandle::new(command_sender);

        let lounge = Arc::new(CourierLounge::new());
        for courier in self.couriers {
            lounge.register(courier);
        }
        if let Some(id) = self.default_courier {
            lounge.set_default(id);
        }

        let sender = Arc::new(UpstreamSender::new(
            store.clone(),
            lounge.clone(),
            self.config.sender.clone(),
            self.config.store.clone(),
            self.time_source.clone(),
        ));

        let post_office = Arc::new(PostOffice::new(
            registry,
            store.clone(),
            Arc::new(DispatchTable::new()),
        ));

        info!(couriers = lounge.len(), "post office assembled");
        Ok(PostOfficeHandle {
            post_office,
            store,
            lounge,
            sender,
            max_cycle_attempts: self.config.sender.max_send_attempts,
            store_task,
        })
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Handle onto the running pipeline
pub struct PostOfficeHandle {
    post_office: Arc<PostOffice>,
    store: StoreHandle,
    lounge: Arc<CourierLounge>,
    sender: Arc<UpstreamSender>,
    max_cycle_attempts: u32,
    store_task: JoinHandle<()>,
}

impl PostOfficeHandle {
    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn lounge(&self) -> &Arc<CourierLounge> {
        &self.lounge
    }

    pub fn sender(&self) -> &Arc<UpstreamSender> {
        &self.sender
    }

    /// Send-cycle task ready to hand to a task scheduler
    pub fn send_cycle_task(&self) -> Arc<SendCycleTask> {
        Arc::new(SendCycleTask::new(
            self.sender.clone(),
            self.max_cycle_attempts,
        ))
    }

    /// Stop the store task after the commands already queued and wait for
    /// it to finish
    pub async fn shutdown(self) {
        self.store.shutdown().await;
        if let Err(err) = self.store_task.await {
            tracing::error!(error = %err, "store task join failed");
        }
        info!("post office shut down");
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
