//! Durable, ordered store of outbound envelopes
//!
//! The store is the single source of truth for at-least-once delivery:
//! envelopes are persisted through a [`StoreBackend`] at enqueue time and
//! survive process restarts. Selection respects priority tiers strictly
//! (Immediate before Buffer before Whenever) and FIFO within a tier, so
//! urgent messages have bounded latency even when low-priority traffic is
//! backed up.
//!
//! All mutations are local — errors here are persistence I/O errors, which
//! are fatal to the enclosing operation and always surfaced to the caller.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::StoreConfig;
use crate::envelope::{EnvelopeState, SendOptions, UpstreamEnvelope};
use crate::errors::StoreError;
use crate::message::SealedMessage;
use crate::types::{EnvelopeId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Batch Criteria
// ----------------------------------------------------------------------------

/// Eligibility criteria for one batch selection
#[derive(Debug, Clone)]
pub struct BatchCriteria {
    /// Whether network-requiring envelopes are currently eligible
    pub network_available: bool,
    /// Maximum number of envelopes to select
    pub max_count: usize,
    /// Maximum cumulative payload bytes to select
    pub max_bytes: usize,
}

// ----------------------------------------------------------------------------
// Store Backend
// ----------------------------------------------------------------------------

/// Persistence collaborator for envelope durability
///
/// The backend owns write batching/rate-limiting; the store calls it on
/// every mutation and treats failures as fatal to that operation.
pub trait StoreBackend: Send {
    /// Load every persisted envelope (called once at store construction)
    fn load(&mut self) -> Result<Vec<UpstreamEnvelope>, StoreError>;
    /// Persist a new envelope
    fn put(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError>;
    /// Persist updated envelope state
    fn update(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError>;
    /// Remove a terminal envelope
    fn remove(&mut self, id: &EnvelopeId) -> Result<(), StoreError>;
}

impl<B: StoreBackend + ?Sized> StoreBackend for Box<B> {
    fn load(&mut self) -> Result<Vec<UpstreamEnvelope>, StoreError> {
        (**self).load()
    }

    fn put(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError> {
        (**self).put(envelope)
    }

    fn update(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError> {
        (**self).update(envelope)
    }

    fn remove(&mut self, id: &EnvelopeId) -> Result<(), StoreError> {
        (**self).remove(id)
    }
}

// ----------------------------------------------------------------------------
// Memory Backend
// ----------------------------------------------------------------------------

/// In-memory backend with shared state
///
/// Clones share the same underlying map, so a "restarted" store built from a
/// clone of the backend sees everything the previous instance persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<HashMap<EnvelopeId, UpstreamEnvelope>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&mut self) -> Result<Vec<UpstreamEnvelope>, StoreError> {
        let inner = self.inner.lock().map_err(|_| poisoned())?;
        Ok(inner.values().cloned().collect())
    }

    fn put(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.insert(envelope.id, envelope.clone());
        Ok(())
    }

    fn update(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError> {
        self.put(envelope)
    }

    fn remove(&mut self, id: &EnvelopeId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.remove(id);
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend(std::io::Error::other("memory backend lock poisoned"))
}

// ----------------------------------------------------------------------------
// JSON File Backend
// ----------------------------------------------------------------------------

/// File-backed backend storing envelopes as a JSON array
///
/// Rewrites the whole file on each mutation; adequate for the envelope
/// volumes this store sees on-device.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    cache: HashMap<EnvelopeId, UpstreamEnvelope>,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: HashMap::new(),
        }
    }

    fn flush(&self) -> Result<(), StoreError> {
        let envelopes: Vec<&UpstreamEnvelope> = self.cache.values().collect();
        let encoded = serde_json::to_vec(&envelopes)?;
        std::fs::write(&self.path, encoded)?;
        Ok(())
    }
}

impl StoreBackend for JsonFileBackend {
    fn load(&mut self) -> Result<Vec<UpstreamEnvelope>, StoreError> {
        let envelopes: Vec<UpstreamEnvelope> = match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(StoreError::Backend(err)),
        };
        self.cache = envelopes.iter().map(|e| (e.id, e.clone())).collect();
        Ok(envelopes)
    }

    fn put(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError> {
        self.cache.insert(envelope.id, envelope.clone());
        self.flush()
    }

    fn update(&mut self, envelope: &UpstreamEnvelope) -> Result<(), StoreError> {
        self.put(envelope)
    }

    fn remove(&mut self, id: &EnvelopeId) -> Result<(), StoreError> {
        self.cache.remove(id);
        self.flush()
    }
}

// ----------------------------------------------------------------------------
// Store Statistics
// ----------------------------------------------------------------------------

/// Counters reported by the store
#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub enqueued: u64,
    pub acknowledged: u64,
    pub released: u64,
    /// Envelopes dropped by TTL expiry, reported distinctly from failures
    pub expired: u64,
    /// In-flight envelopes reset to pending by deadline sweeps
    pub timeouts_reset: u64,
}

// ----------------------------------------------------------------------------
// Message Store
// ----------------------------------------------------------------------------

/// Durable queue of outbound envelopes, ordered by priority then insertion
pub struct MessageStore<B: StoreBackend> {
    backend: B,
    config: StoreConfig,
    time_source: Arc<dyn TimeSource>,
    entries: HashMap<EnvelopeId, UpstreamEnvelope>,
    /// Selection order index: (priority rank, sequence) → id
    order: BTreeMap<(u8, u64), EnvelopeId>,
    next_sequence: u64,
    stats: StoreStats,
}

impl<B: StoreBackend> MessageStore<B> {
    /// Construct a store, loading any envelopes the backend persisted
    pub fn new(
        mut backend: B,
        config: StoreConfig,
        time_source: Arc<dyn TimeSource>,
    ) -> Result<Self, StoreError> {
        let loaded = backend.load()?;

        let mut entries = HashMap::with_capacity(loaded.len());
        let mut order = BTreeMap::new();
        let mut next_sequence = 0u64;
        for envelope in loaded {
            next_sequence = next_sequence.max(envelope.sequence + 1);
            order.insert((envelope.priority.rank(), envelope.sequence), envelope.id);
            entries.insert(envelope.id, envelope);
        }

        Ok(Self {
            backend,
            config,
            time_source,
            entries,
            order,
            next_sequence,
            stats: StoreStats::default(),
        })
    }

    /// Persist a new pending envelope; never blocks on network
    pub fn enqueue(
        &mut self,
        message: SealedMessage,
        options: SendOptions,
    ) -> Result<EnvelopeId, StoreError> {
        if self.entries.len() >= self.config.max_pending {
            return Err(StoreError::CapacityExceeded {
                capacity: self.config.max_pending,
            });
        }

        let now = self.time_source.now();
        let ttl = options
            .ttl
            .or(self.config.default_ttl)
            .map(|relative| now.add_duration(relative));

        let envelope = UpstreamEnvelope {
            id: EnvelopeId::generate(),
            message,
            created_at: now,
            priority: options.priority,
            ttl,
            attempt_count: 0,
            in_flight_deadline: None,
            courier_id: options.courier_id,
            requires_delivery_ack: options.requires_delivery_ack,
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        self.backend.put(&envelope)?;

        let id = envelope.id;
        self.order
            .insert((envelope.priority.rank(), envelope.sequence), id);
        self.entries.insert(id, envelope);
        self.stats.enqueued += 1;
        Ok(id)
    }

    /// Select pending envelopes eligible under the criteria
    ///
    /// Strict priority-tier order, FIFO within a tier. The byte cap never
    /// excludes the first eligible envelope, so an oversized single message
    /// cannot starve the queue.
    pub fn select_batch(&self, criteria: &BatchCriteria) -> Vec<UpstreamEnvelope> {
        let now = self.time_source.now();
        let mut selected = Vec::new();
        let mut total_bytes = 0usize;

        for id in self.order.values() {
            if selected.len() >= criteria.max_count {
                break;
            }
            let Some(envelope) = self.entries.get(id) else {
                continue;
            };
            if envelope.state() != EnvelopeState::Pending {
                continue;
            }
            if envelope.is_expired(now) {
                continue;
            }
            if envelope.message.requires_network() && !criteria.network_available {
                continue;
            }
            let size = envelope.message.payload_size();
            if !selected.is_empty() && total_bytes + size > criteria.max_bytes {
                break;
            }
            total_bytes += size;
            selected.push(envelope.clone());
        }

        selected
    }

    /// Transition pending → in flight, recording the deadline
    pub fn mark_in_flight(
        &mut self,
        ids: &[EnvelopeId],
        deadline: Timestamp,
    ) -> Result<(), StoreError> {
        for id in ids {
            if let Some(envelope) = self.entries.get_mut(id) {
                envelope.mark_in_flight(deadline);
                self.backend.update(envelope)?;
            }
        }
        Ok(())
    }

    /// Atomically select a batch and mark it in flight
    pub fn select_and_mark_in_flight(
        &mut self,
        criteria: &BatchCriteria,
        deadline: Timestamp,
    ) -> Result<Vec<UpstreamEnvelope>, StoreError> {
        let mut selected = self.select_batch(criteria);
        let ids: Vec<EnvelopeId> = selected.iter().map(|e| e.id).collect();
        self.mark_in_flight(&ids, deadline)?;
        for envelope in &mut selected {
            envelope.mark_in_flight(deadline);
        }
        Ok(selected)
    }

    /// Remove envelopes on terminal success; idempotent
    ///
    /// Acknowledging an already-removed id is a no-op, not an error, so
    /// duplicate acks are harmless.
    pub fn acknowledge(&mut self, ids: &[EnvelopeId]) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in ids {
            if self.remove_entry(id)? {
                removed += 1;
            }
        }
        self.stats.acknowledged += removed as u64;
        Ok(removed)
    }

    /// Transition in flight → pending after a transmission failure,
    /// incrementing the attempt count
    pub fn release_in_flight(&mut self, ids: &[EnvelopeId]) -> Result<usize, StoreError> {
        let mut released = 0;
        for id in ids {
            if let Some(envelope) = self.entries.get_mut(id) {
                if envelope.state() == EnvelopeState::InFlight {
                    envelope.release();
                    self.backend.update(envelope)?;
                    released += 1;
                }
            }
        }
        self.stats.released += released as u64;
        Ok(released)
    }

    /// Release in-flight envelopes whose deadline has passed
    ///
    /// Recovers envelopes stranded by a crash or hang between mark-in-flight
    /// and acknowledge; without this sweep they would stay "in flight"
    /// forever.
    pub fn check_in_flight_timeouts(&mut self) -> Result<usize, StoreError> {
        let now = self.time_source.now();
        let timed_out: Vec<EnvelopeId> = self
            .entries
            .values()
            .filter(|e| e.is_flight_timed_out(now))
            .map(|e| e.id)
            .collect();

        let mut reset = 0;
        for id in &timed_out {
            if let Some(envelope) = self.entries.get_mut(id) {
                envelope.release();
                self.backend.update(envelope)?;
                reset += 1;
            }
        }
        if reset > 0 {
            tracing::warn!(reset, "released in-flight envelopes past deadline");
        }
        self.stats.timeouts_reset += reset as u64;
        Ok(reset)
    }

    /// Drop envelopes whose time-to-live has passed, without sending them
    pub fn check_expirations(&mut self) -> Result<usize, StoreError> {
        let now = self.time_source.now();
        let expired: Vec<EnvelopeId> = self
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.id)
            .collect();

        let mut dropped = 0;
        for id in &expired {
            if self.remove_entry(id)? {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::info!(dropped, "dropped expired envelopes");
        }
        self.stats.expired += dropped as u64;
        Ok(dropped)
    }

    fn remove_entry(&mut self, id: &EnvelopeId) -> Result<bool, StoreError> {
        match self.entries.remove(id) {
            Some(envelope) => {
                self.order
                    .remove(&(envelope.priority.rank(), envelope.sequence));
                self.backend.remove(id)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look up one envelope by id
    pub fn get(&self, id: &EnvelopeId) -> Option<&UpstreamEnvelope> {
        self.entries.get(id)
    }

    /// Number of live envelopes (pending + in flight)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
