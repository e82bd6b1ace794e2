//! Post Office façade
//!
//! The single entry point producers and consumers see. Producers hand it
//! messages; it resolves mixins concurrently off the serial store queue,
//! seals the message, and enqueues the envelope. Consumers register
//! mailboxes; inbound parcels route through the dispatch table. Message
//! types unknown to the registry are rejected at both ends, loudly.

use std::sync::Arc;

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use postal_core::{
    DispatchError, DownstreamParcel, EnvelopeId, Message, MessageType, MessageTypeRegistry,
    MixinOutput, PostalError, RawFields, RegistryError, SendOptions,
};

use crate::dispatch::{DispatchReport, DispatchTable};
use crate::store_task::StoreHandle;

// ----------------------------------------------------------------------------
// Post Office
// ----------------------------------------------------------------------------

/// Producer/consumer façade over the delivery pipeline
pub struct PostOffice {
    registry: Arc<MessageTypeRegistry>,
    store: StoreHandle,
    dispatch: Arc<DispatchTable>,
}

impl PostOffice {
    pub fn new(
        registry: Arc<MessageTypeRegistry>,
        store: StoreHandle,
        dispatch: Arc<DispatchTable>,
    ) -> Self {
        Self {
            registry,
            store,
            dispatch,
        }
    }

    pub fn registry(&self) -> &Arc<MessageTypeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Upstream
    // ------------------------------------------------------------------------

    /// Enqueue a message with default send options
    pub async fn send_message(&self, message: Message) -> Result<EnvelopeId, PostalError> {
        self.send_message_opts(message, SendOptions::default()).await
    }

    /// Resolve mixins, seal, and enqueue a message
    ///
    /// Mixin collection runs concurrently here, never on the store queue; a
    /// failing mixin is skipped with a warning. An unregistered message type
    /// is a programming error and is rejected before anything is persisted.
    pub async fn send_message_opts(
        &self,
        message: Message,
        options: SendOptions,
    ) -> Result<EnvelopeId, PostalError> {
        self.registry.ensure_registered(message.message_type())?;

        let outputs = Self::resolve_mixins(&message).await;
        let sealed = message.seal(outputs);
        let id = self.store.enqueue(sealed, options).await?;
        debug!(envelope = %id, "message enqueued");
        Ok(id)
    }

    async fn resolve_mixins(message: &Message) -> Vec<MixinOutput> {
        let mixins = message.mixins();
        if mixins.is_empty() {
            return Vec::new();
        }

        let collected = join_all(mixins.iter().map(|mixin| mixin.collect())).await;
        let mut outputs = Vec::with_capacity(mixins.len());
        for (mixin, result) in mixins.iter().zip(collected) {
            match result {
                Ok(fields) => outputs.push(MixinOutput {
                    namespace: mixin.nested().then(|| mixin.name().to_string()),
                    fields,
                }),
                Err(err) => {
                    // Enrichment is best-effort; the send proceeds without it
                    warn!(mixin = mixin.name(), error = %err, "mixin skipped");
                }
            }
        }
        outputs
    }

    // ------------------------------------------------------------------------
    // Downstream
    // ------------------------------------------------------------------------

    /// Register a typed mailbox for one message type
    pub fn mailbox<T, F>(&self, message_type: MessageType, handler: F) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.registry.ensure_registered(message_type)?;
        self.dispatch.register::<T, F>(message_type, handler);
        Ok(())
    }

    /// Register a typed mailbox plus a recovery handler that receives the
    /// raw fields when the payload fails to decode
    pub fn mailbox_with_recovery<T, F, R>(
        &self,
        message_type: MessageType,
        handler: F,
        recovery: R,
    ) -> Result<(), RegistryError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
        R: Fn(&RawFields) + Send + Sync + 'static,
    {
        self.registry.ensure_registered(message_type)?;
        self.dispatch
            .register_with_recovery::<T, F, R>(message_type, handler, recovery);
        Ok(())
    }

    /// Register a catch-all mailbox receiving every inbound entry raw
    pub fn mailbox_any<F>(&self, handler: F)
    where
        F: Fn(MessageType, &RawFields) + Send + Sync + 'static,
    {
        self.dispatch.register_any(handler);
    }

    /// Route a raw inbound parcel (JSON array of typed objects) through the
    /// registered mailboxes
    pub fn on_inbound_parcel_received(&self, wire: Value) -> Result<DispatchReport, PostalError> {
        let parcel = DownstreamParcel::from_wire(wire).map_err(|err| {
            DispatchError::MalformedParcel {
                reason: err.to_string(),
            }
        })?;
        Ok(self.dispatch_parcel(&parcel))
    }

    /// Route an already-parsed parcel
    pub fn dispatch_parcel(&self, parcel: &DownstreamParcel) -> DispatchReport {
        self.dispatch.dispatch(parcel)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_task::{create_store_channel, StoreTask};
    use async_trait::async_trait;
    use postal_core::{
        ChannelConfig, ManualTimeSource, MemoryBackend, MessageStore, Mixin, MixinError,
        StoreConfig, Timestamp,
    };
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fields_of(value: Value) -> RawFields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    async fn post_office() -> PostOffice {
        let clock = Arc::new(ManualTimeSource::starting_at(Timestamp::new(1_000)));
        let store = MessageStore::new(MemoryBackend::new(), StoreConfig::default(), clock)
            .expect("store construction");
        let (sender, receiver) = create_store_channel(&ChannelConfig::default());
        tokio::spawn(StoreTask::new(store, receiver).run());

        let registry = MessageTypeRegistry::with_core_types().unwrap();
        registry.register(MessageType::new(100), "notification").unwrap();
        registry.register(MessageType::new(200), "analytics").unwrap();

        PostOffice::new(
            Arc::new(registry),
            StoreHandle::new(sender),
            Arc::new(DispatchTable::new()),
        )
    }

    struct NetworkMixin;

    #[async_trait]
    impl Mixin for NetworkMixin {
        fn name(&self) -> &str {
            "network"
        }

        async fn collect(&self) -> Result<RawFields, MixinError> {
            Ok(fields_of(json!({"kind": "wifi"})))
        }
    }

    struct BrokenMixin;

    #[async_trait]
    impl Mixin for BrokenMixin {
        fn name(&self) -> &str {
            "broken"
        }

        async fn collect(&self) -> Result<RawFields, MixinError> {
            Err(MixinError {
                name: "broken".to_string(),
                reason: "sensor unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_send_rejects_unregistered_type() {
        let office = post_office().await;
        let message = Message::new(MessageType::new(999), RawFields::new());

        let err = office.send_message(message).await.unwrap_err();
        assert!(matches!(err, PostalError::Registry(_)));
        assert_eq!(office.store().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_resolves_mixins_and_skips_failures() {
        let office = post_office().await;
        let message = Message::new(MessageType::new(200), fields_of(json!({"event": "open"})))
            .with_mixin(Arc::new(NetworkMixin))
            .with_mixin(Arc::new(BrokenMixin));

        office.send_message(message).await.unwrap();

        let batch = office
            .store()
            .select_and_mark_in_flight(
                postal_core::BatchCriteria {
                    network_available: true,
                    max_count: 10,
                    max_bytes: usize::MAX,
                },
                Timestamp::new(9_000),
            )
            .await
            .unwrap();

        let fields = batch[0].message.fields();
        assert_eq!(fields["event"], json!("open"));
        assert_eq!(fields["network"], json!({"kind": "wifi"}));
        assert!(!fields.contains_key("broken"));
    }

    #[tokio::test]
    async fn test_mailbox_rejects_unregistered_type() {
        let office = post_office().await;

        #[derive(Deserialize)]
        struct Anything {}

        let err = office
            .mailbox::<Anything, _>(MessageType::new(999), |_| {})
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnregisteredType { .. }));
    }

    #[tokio::test]
    async fn test_inbound_parcel_routes_to_mailboxes() {
        let office = post_office().await;

        #[derive(Deserialize)]
        struct Notification {
            title: String,
        }

        let titles = Arc::new(Mutex::new(Vec::new()));
        let titles_clone = titles.clone();
        office
            .mailbox::<Notification, _>(MessageType::new(100), move |n| {
                titles_clone.lock().unwrap().push(n.title.clone());
            })
            .unwrap();

        let acks = Arc::new(AtomicUsize::new(0));
        let acks_clone = acks.clone();
        office.mailbox_any(move |message_type, _| {
            if message_type == postal_core::core_types::DELIVERY_ACK {
                acks_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let report = office
            .on_inbound_parcel_received(json!([
                {"type": 100, "title": "hello"},
                {"type": 1, "delivered": ["abc"]},
            ]))
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.unrouted, 0);
        assert_eq!(titles.lock().unwrap().as_slice(), &["hello".to_string()]);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_inbound_non_array_rejected() {
        let office = post_office().await;
        let err = office
            .on_inbound_parcel_received(json!({"type": 100}))
            .unwrap_err();
        assert!(matches!(
            err,
            PostalError::Dispatch(DispatchError::MalformedParcel { .. })
        ));
    }
}
