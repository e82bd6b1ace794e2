//! Upstream sender: the send-cycle orchestrator
//!
//! Invoked by an externally scheduled task, never self-scheduling. One cycle
//! sweeps the store, selects and marks a batch in flight, groups it into one
//! parcel per resolved courier, and transmits. Success acknowledges the
//! parcel's envelopes; failure releases them for the next cycle, except on a
//! final attempt past the configured maximum, where the envelopes are
//! dropped permanently and reported.
//!
//! The external scheduler's unique-work/replace policy guarantees at most
//! one cycle in flight per process; this component assumes that exclusivity
//! and takes no lock of its own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use postal_core::{
    BatchCriteria, Courier, CourierId, CourierLounge, EnvelopeId, SchedulableTask, SenderConfig,
    StoreConfig, StoreError, TaskOutcome, TimeSource, UpstreamEnvelope, UpstreamParcel,
};

use crate::store_task::StoreHandle;

// ----------------------------------------------------------------------------
// Cycle Report
// ----------------------------------------------------------------------------

/// Outcome counters for one send cycle
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    /// Parcels built and handed to couriers
    pub parcels_sent: usize,
    /// Parcels whose courier reported failure
    pub parcels_failed: usize,
    /// Envelopes acknowledged after successful transmission
    pub acknowledged: usize,
    /// Envelopes released back to pending for a later cycle
    pub released: usize,
    /// Envelopes dropped permanently on a final attempt
    pub dropped_permanent: usize,
    /// Envelopes dropped by TTL expiry during the pre-cycle sweep
    pub expired: usize,
    /// In-flight envelopes reset by the pre-cycle sweep
    pub timeouts_reset: usize,
    /// Envelopes whose courier could not be resolved (released, retryable)
    pub unresolved: usize,
}

impl CycleReport {
    /// True only if every parcel succeeded and every courier resolved
    pub fn succeeded(&self) -> bool {
        self.parcels_failed == 0 && self.unresolved == 0
    }
}

// ----------------------------------------------------------------------------
// Upstream Sender
// ----------------------------------------------------------------------------

/// Orchestrates store → courier for one send cycle at a time
pub struct UpstreamSender {
    store: StoreHandle,
    lounge: Arc<CourierLounge>,
    sender_config: SenderConfig,
    store_config: StoreConfig,
    time_source: Arc<dyn TimeSource>,
}

impl UpstreamSender {
    pub fn new(
        store: StoreHandle,
        lounge: Arc<CourierLounge>,
        sender_config: SenderConfig,
        store_config: StoreConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            store,
            lounge,
            sender_config,
            store_config,
            time_source,
        }
    }

    /// Run one full send cycle
    ///
    /// `final_attempt` marks the scheduler's last retry: envelopes that
    /// would exceed the attempt maximum are dropped instead of released.
    /// Returns a report; store/backend errors propagate and abort the cycle.
    pub async fn collect_and_send(
        &self,
        final_attempt: bool,
        network_available: bool,
    ) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport::default();

        // Cleanup before work: recover stranded in-flight envelopes and
        // drop expired ones so they never reach a courier.
        let sweep = self.store.sweep().await?;
        report.timeouts_reset = sweep.timeouts_reset;
        report.expired = sweep.expired;

        let deadline = self
            .time_source
            .now()
            .add_duration(self.store_config.in_flight_timeout);
        let batch = self
            .store
            .select_and_mark_in_flight(
                BatchCriteria {
                    network_available,
                    max_count: self.sender_config.parcel_max_messages,
                    max_bytes: self.sender_config.parcel_max_bytes,
                },
                deadline,
            )
            .await?;

        if batch.is_empty() {
            debug!("send cycle found nothing to deliver");
            return Ok(report);
        }

        let (groups, unresolved) = self.group_by_courier(batch, network_available);
        if !unresolved.is_empty() {
            warn!(count = unresolved.len(), "no courier usable; releasing batch");
            report.unresolved = unresolved.len();
            report.released += self.store.release_in_flight(unresolved).await?;
        }

        let built_at = self.time_source.now();
        for (courier, envelopes) in groups {
            let parcel = UpstreamParcel::new(courier.id(), envelopes, built_at);
            report.parcels_sent += 1;
            self.transmit(&*courier, parcel, final_attempt, &mut report)
                .await?;
        }

        info!(
            parcels = report.parcels_sent,
            failed = report.parcels_failed,
            acknowledged = report.acknowledged,
            dropped = report.dropped_permanent,
            "send cycle finished"
        );
        Ok(report)
    }

    /// Group a selected batch into per-courier envelope lists, preserving
    /// selection order within each group
    ///
    /// A courier that requires network connectivity is unusable while the
    /// cycle runs offline; its envelopes are set aside with the unresolved
    /// ones and released for a later cycle.
    #[allow(clippy::type_complexity)]
    fn group_by_courier(
        &self,
        batch: Vec<UpstreamEnvelope>,
        network_available: bool,
    ) -> (Vec<(Arc<dyn Courier>, Vec<UpstreamEnvelope>)>, Vec<EnvelopeId>) {
        let mut groups: Vec<(Arc<dyn Courier>, Vec<UpstreamEnvelope>)> = Vec::new();
        let mut unresolved = Vec::new();

        for envelope in batch {
            match self.lounge.resolve(envelope.courier_id.as_ref()) {
                Ok(courier) if !network_available && courier.requires_network() => {
                    debug!(
                        envelope = %envelope.id,
                        courier = %courier.id(),
                        "courier requires network, cycle is offline"
                    );
                    unresolved.push(envelope.id);
                }
                Ok(courier) => {
                    let courier_id = courier.id();
                    match groups.iter_mut().find(|(c, _)| c.id() == courier_id) {
                        Some((_, envelopes)) => envelopes.push(envelope),
                        None => groups.push((courier, vec![envelope])),
                    }
                }
                Err(err) => {
                    debug!(envelope = %envelope.id, error = %err, "courier resolution failed");
                    unresolved.push(envelope.id);
                }
            }
        }

        (groups, unresolved)
    }

    async fn transmit(
        &self,
        courier: &dyn Courier,
        parcel: UpstreamParcel,
        final_attempt: bool,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let courier_id: CourierId = courier.id();
        match courier.send_parcel(&parcel).await {
            Ok(()) => {
                let ids = parcel.envelope_ids();
                report.acknowledged += self.store.acknowledge(ids).await?;
            }
            Err(err) => {
                warn!(courier = %courier_id, error = %err, "parcel transmission failed");
                report.parcels_failed += 1;

                let mut to_drop = Vec::new();
                let mut to_release = Vec::new();
                for envelope in parcel.envelopes() {
                    if final_attempt
                        && envelope.attempts_exhausted(self.sender_config.max_send_attempts)
                    {
                        to_drop.push(envelope.id);
                    } else {
                        to_release.push(envelope.id);
                    }
                }

                if !to_drop.is_empty() {
                    warn!(
                        count = to_drop.len(),
                        courier = %courier_id,
                        "dropping envelopes permanently after final attempt"
                    );
                    // Terminal removal reuses acknowledge; the drop is
                    // reported through the cycle counters.
                    report.dropped_permanent += self.store.acknowledge(to_drop).await?;
                }
                report.released += self.store.release_in_flight(to_release).await?;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Send Cycle Task
// ----------------------------------------------------------------------------

/// Adapter exposing the send cycle as a schedulable task
///
/// Tracks its own attempt count so the cycle knows when the scheduler is on
/// its last retry; the counter resets after every successful cycle.
pub struct SendCycleTask {
    sender: Arc<UpstreamSender>,
    max_cycle_attempts: u32,
    attempts: AtomicU32,
}

impl SendCycleTask {
    pub fn new(sender: Arc<UpstreamSender>, max_cycle_attempts: u32) -> Self {
        Self {
            sender,
            max_cycle_attempts,
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SchedulableTask for SendCycleTask {
    async fn perform(&self) -> TaskOutcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let final_attempt = attempt >= self.max_cycle_attempts;

        match self.sender.collect_and_send(final_attempt, true).await {
            Ok(report) if report.succeeded() => {
                self.attempts.store(0, Ordering::SeqCst);
                TaskOutcome::Success
            }
            Ok(_) if final_attempt => {
                self.attempts.store(0, Ordering::SeqCst);
                TaskOutcome::Failure
            }
            Ok(_) => TaskOutcome::Retry,
            Err(err) => {
                // Persistence failure: nothing a retry on the same state
                // can fix from here.
                tracing::error!(error = %err, "send cycle aborted by store error");
                TaskOutcome::Failure
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_task::{create_store_channel, StoreTask};
    use postal_core::{
        ChannelConfig, CourierError, ManualTimeSource, MemoryBackend, Message, MessageStore,
        MessageType, SendOptions, SendPriority, Timestamp,
    };
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct RecordingCourier {
        id: CourierId,
        needs_network: bool,
        fail_times: AtomicUsize,
        parcels: Mutex<Vec<Vec<EnvelopeId>>>,
    }

    impl RecordingCourier {
        fn succeeding(id: &str) -> Arc<Self> {
            Self::failing_times(id, 0)
        }

        fn failing_times(id: &str, times: usize) -> Arc<Self> {
            Arc::new(Self {
                id: CourierId::new(id),
                needs_network: true,
                fail_times: AtomicUsize::new(times),
                parcels: Mutex::new(Vec::new()),
            })
        }

        fn offline_capable(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: CourierId::new(id),
                needs_network: false,
                fail_times: AtomicUsize::new(0),
                parcels: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Courier for RecordingCourier {
        fn id(&self) -> CourierId {
            self.id.clone()
        }

        fn requires_network(&self) -> bool {
            self.needs_network
        }

        async fn send_parcel(&self, parcel: &UpstreamParcel) -> Result<(), CourierError> {
            self.parcels.lock().unwrap().push(parcel.envelope_ids());
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(CourierError::SendFailed {
                    courier_id: self.id.clone(),
                    reason: "stubbed failure".to_string(),
                });
            }
            Ok(())
        }
    }

    struct Fixture {
        store: StoreHandle,
        lounge: Arc<CourierLounge>,
        clock: Arc<ManualTimeSource>,
    }

    impl Fixture {
        async fn new() -> Self {
            let clock = Arc::new(ManualTimeSource::starting_at(Timestamp::new(1_000)));
            let store = MessageStore::new(
                MemoryBackend::new(),
                StoreConfig::default(),
                clock.clone(),
            )
            .unwrap();
            let (sender, receiver) = create_store_channel(&ChannelConfig::default());
            tokio::spawn(StoreTask::new(store, receiver).run());
            Self {
                store: StoreHandle::new(sender),
                lounge: Arc::new(CourierLounge::new()),
                clock,
            }
        }

        fn sender(&self, config: SenderConfig) -> UpstreamSender {
            UpstreamSender::new(
                self.store.clone(),
                self.lounge.clone(),
                config,
                StoreConfig::default(),
                self.clock.clone(),
            )
        }

        async fn enqueue(&self, label: &str, priority: SendPriority) -> EnvelopeId {
            let mut fields = serde_json::Map::new();
            fields.insert("label".to_string(), serde_json::Value::from(label));
            let sealed = Message::new(MessageType::new(100), fields).seal(Vec::new());
            self.store
                .enqueue(sealed, SendOptions::with_priority(priority))
                .await
                .unwrap()
        }

        async fn enqueue_offline_capable(&self, label: &str) -> EnvelopeId {
            let mut fields = serde_json::Map::new();
            fields.insert("label".to_string(), serde_json::Value::from(label));
            let sealed = Message::new(MessageType::new(100), fields)
                .without_network_requirement()
                .seal(Vec::new());
            self.store
                .enqueue(sealed, SendOptions::default())
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_successful_cycle_preserves_priority_order() {
        let fixture = Fixture::new().await;
        let courier = RecordingCourier::succeeding("http");
        fixture.lounge.register(courier.clone());

        // Enqueue A (immediate) after B's tier but expect A first
        let b = fixture.enqueue("b", SendPriority::Buffer).await;
        let a = fixture.enqueue("a", SendPriority::Immediate).await;

        let report = fixture
            .sender(SenderConfig::default())
            .collect_and_send(false, true)
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.parcels_sent, 1);
        assert_eq!(report.acknowledged, 2);

        let parcels = courier.parcels.lock().unwrap();
        assert_eq!(parcels.as_slice(), &[vec![a, b]]);
        drop(parcels);

        assert_eq!(fixture.store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_cycle_releases_for_retry() {
        let fixture = Fixture::new().await;
        fixture
            .lounge
            .register(RecordingCourier::failing_times("http", 1));
        let id = fixture.enqueue("c", SendPriority::Buffer).await;

        let sender = fixture.sender(SenderConfig::default());
        let report = sender.collect_and_send(false, true).await.unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.released, 1);
        assert_eq!(report.dropped_permanent, 0);

        // Envelope is back in the store with one attempt counted
        assert_eq!(fixture.store.len().await.unwrap(), 1);

        // Next cycle succeeds and drains the store
        let report = sender.collect_and_send(false, true).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.acknowledged, 1);
        assert_eq!(fixture.store.len().await.unwrap(), 0);
        let _ = id;
    }

    #[tokio::test]
    async fn test_final_attempt_drops_permanently() {
        let fixture = Fixture::new().await;
        fixture
            .lounge
            .register(RecordingCourier::failing_times("http", 2));
        fixture.enqueue("c", SendPriority::Buffer).await;

        let config = SenderConfig {
            max_send_attempts: 2,
            ..SenderConfig::default()
        };
        let sender = fixture.sender(config);

        // First attempt fails and releases
        let report = sender.collect_and_send(false, true).await.unwrap();
        assert_eq!(report.released, 1);

        // Second (final) attempt fails and drops, reporting it
        let report = sender.collect_and_send(true, true).await.unwrap();
        assert_eq!(report.dropped_permanent, 1);
        assert_eq!(report.released, 0);
        assert_eq!(fixture.store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parcels_grouped_per_courier() {
        let fixture = Fixture::new().await;
        let http = RecordingCourier::succeeding("http");
        let lash = RecordingCourier::succeeding("lash");
        fixture.lounge.register(http.clone());
        fixture.lounge.register(lash.clone());

        fixture.enqueue("default-courier", SendPriority::Buffer).await;
        let mut fields = serde_json::Map::new();
        fields.insert("label".to_string(), serde_json::Value::from("via-lash"));
        let sealed = Message::new(MessageType::new(100), fields).seal(Vec::new());
        fixture
            .store
            .enqueue(
                sealed,
                SendOptions {
                    courier_id: Some(CourierId::new("lash")),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();

        let report = fixture
            .sender(SenderConfig::default())
            .collect_and_send(false, true)
            .await
            .unwrap();

        assert!(report.succeeded());
        assert_eq!(report.parcels_sent, 2);
        assert_eq!(http.parcels.lock().unwrap().len(), 1);
        assert_eq!(lash.parcels.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_cycle_skips_network_couriers() {
        let fixture = Fixture::new().await;
        let http = RecordingCourier::succeeding("http");
        fixture.lounge.register(http.clone());
        fixture.enqueue_offline_capable("queued-offline").await;

        // Offline cycle: the message is eligible, the only courier is not
        let sender = fixture.sender(SenderConfig::default());
        let report = sender.collect_and_send(false, false).await.unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.parcels_sent, 0);
        assert!(http.parcels.lock().unwrap().is_empty());
        assert_eq!(fixture.store.len().await.unwrap(), 1);

        // An offline-capable courier delivers it without connectivity
        let local = RecordingCourier::offline_capable("spool");
        fixture.lounge.register(local.clone());
        fixture.lounge.set_default(CourierId::new("spool"));
        let report = sender.collect_and_send(false, false).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.acknowledged, 1);
        assert_eq!(local.parcels.lock().unwrap().len(), 1);
        assert_eq!(fixture.store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_lounge_releases_batch() {
        let fixture = Fixture::new().await;
        fixture.enqueue("stuck", SendPriority::Buffer).await;

        let report = fixture
            .sender(SenderConfig::default())
            .collect_and_send(false, true)
            .await
            .unwrap();

        assert!(!report.succeeded());
        assert_eq!(report.unresolved, 1);
        // Batch remains for a later cycle once a courier registers
        assert_eq!(fixture.store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_cycle_task_outcomes() {
        let fixture = Fixture::new().await;
        fixture
            .lounge
            .register(RecordingCourier::failing_times("http", 2));
        fixture.enqueue("c", SendPriority::Buffer).await;

        let config = SenderConfig {
            max_send_attempts: 2,
            ..SenderConfig::default()
        };
        let task = SendCycleTask::new(Arc::new(fixture.sender(config)), 2);

        assert_eq!(task.perform().await, TaskOutcome::Retry);
        // Final attempt drops the envelope; the cycle still reports failure
        assert_eq!(task.perform().await, TaskOutcome::Failure);
        assert_eq!(fixture.store.len().await.unwrap(), 0);

        // With an empty store the next run succeeds
        assert_eq!(task.perform().await, TaskOutcome::Success);
    }
}
