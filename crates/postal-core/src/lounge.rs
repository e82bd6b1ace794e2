//! Couriers and the courier lounge
//!
//! A courier is a pluggable transport capable of transmitting one
//! [`UpstreamParcel`]. Couriers are stateless with respect to message
//! content — all delivery state lives in the message store. The lounge is
//! the registry: registered once at startup, read-mostly afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use smallvec::SmallVec;

use crate::errors::CourierError;
use crate::parcel::UpstreamParcel;
use crate::types::CourierId;

// ----------------------------------------------------------------------------
// Courier Trait
// ----------------------------------------------------------------------------

/// A pluggable transport for upstream parcels
#[async_trait]
pub trait Courier: Send + Sync {
    /// Stable identifier used for registration and envelope assignment
    fn id(&self) -> CourierId;

    /// Whether this courier needs network connectivity to transmit
    fn requires_network(&self) -> bool {
        true
    }

    /// Transmit a parcel; any I/O failure maps to [`CourierError`] here and
    /// never leaks past the upstream sender
    async fn send_parcel(&self, parcel: &UpstreamParcel) -> Result<(), CourierError>;
}

// ----------------------------------------------------------------------------
// Courier Lounge
// ----------------------------------------------------------------------------

/// Registry and selection of couriers
#[derive(Default)]
pub struct CourierLounge {
    couriers: DashMap<CourierId, Arc<dyn Courier>>,
    default_courier: std::sync::RwLock<Option<CourierId>>,
}

impl CourierLounge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a courier; re-registering the same id replaces it, which
    /// supports hot-swap in tests
    pub fn register(&self, courier: Arc<dyn Courier>) {
        let id = courier.id();
        let mut default_courier = self
            .default_courier
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        // First registration becomes the default unless one was chosen
        if default_courier.is_none() {
            *default_courier = Some(id.clone());
        }
        self.couriers.insert(id, courier);
    }

    /// Choose the fallback courier used when an envelope names none
    pub fn set_default(&self, id: CourierId) {
        let mut default_courier = self
            .default_courier
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        *default_courier = Some(id);
    }

    /// Resolve the preferred courier, falling back to the default
    ///
    /// Resolution never fails silently: an unresolvable courier is an error
    /// and the caller must treat the batch as failed-and-retryable.
    pub fn resolve(&self, preferred: Option<&CourierId>) -> Result<Arc<dyn Courier>, CourierError> {
        if let Some(id) = preferred {
            if let Some(courier) = self.couriers.get(id) {
                return Ok(courier.clone());
            }
            // Preferred courier unknown: fall through to the default
        }

        let default_id = {
            let default_courier = self
                .default_courier
                .read()
                .unwrap_or_else(|poison| poison.into_inner());
            default_courier.clone()
        };

        match default_id {
            Some(id) => self
                .couriers
                .get(&id)
                .map(|c| c.clone())
                .ok_or(CourierError::Unresolvable { courier_id: id }),
            None => match preferred {
                Some(id) => Err(CourierError::Unresolvable {
                    courier_id: id.clone(),
                }),
                None => Err(CourierError::NoDefault),
            },
        }
    }

    /// Ids of every registered courier
    pub fn courier_ids(&self) -> SmallVec<[CourierId; 4]> {
        self.couriers.iter().map(|c| c.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.couriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.couriers.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
