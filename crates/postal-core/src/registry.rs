//! Message type registry
//!
//! A flat, process-wide namespace of integer message types, partitioned into
//! reserved ranges per functional area. Every functional area registers its
//! types once at startup; collisions are programming errors and fail loudly
//! at initialization rather than degrading at runtime.

use core::ops::RangeInclusive;

use dashmap::DashMap;

use crate::errors::RegistryError;
use crate::types::MessageType;

// ----------------------------------------------------------------------------
// Functional Areas
// ----------------------------------------------------------------------------

/// A functional area and its reserved message-type range
#[derive(Debug, Clone)]
pub struct AreaRange {
    pub name: &'static str,
    pub range: RangeInclusive<i32>,
}

/// Reserved ranges for the built-in functional areas
pub const RESERVED_AREAS: &[AreaRange] = &[
    AreaRange { name: "core", range: 1..=99 },
    AreaRange { name: "notification", range: 100..=199 },
    AreaRange { name: "analytics", range: 200..=299 },
    AreaRange { name: "datalytics", range: 300..=399 },
    AreaRange { name: "geo", range: 400..=499 },
];

/// Well-known core message types
pub mod core_types {
    use crate::types::MessageType;

    /// Inbound acknowledgment that the backend received an upstream envelope
    pub const DELIVERY_ACK: MessageType = MessageType::new(1);
    /// Backend-initiated request to flush pending upstream messages
    pub const FLUSH_REQUEST: MessageType = MessageType::new(2);
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Process-wide registry of message types
///
/// Populated once during module initialization and read-mostly afterwards;
/// shared as `Arc<MessageTypeRegistry>` across the Post Office and producers.
#[derive(Debug, Default)]
pub struct MessageTypeRegistry {
    registered: DashMap<MessageType, &'static str>,
}

impl MessageTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in core types pre-registered
    pub fn with_core_types() -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.register(core_types::DELIVERY_ACK, "core")?;
        registry.register(core_types::FLUSH_REQUEST, "core")?;
        Ok(registry)
    }

    /// Register a message type for a functional area
    ///
    /// Fails if the type is already taken or falls outside the area's
    /// reserved range. Both are programming errors that should abort
    /// initialization.
    pub fn register(
        &self,
        message_type: MessageType,
        area: &'static str,
    ) -> Result<(), RegistryError> {
        let area_range = RESERVED_AREAS
            .iter()
            .find(|a| a.name == area)
            .ok_or_else(|| RegistryError::UnknownArea {
                area: area.to_string(),
            })?;

        if !area_range.range.contains(&message_type.value()) {
            return Err(RegistryError::OutsideReservedRange { message_type, area });
        }

        match self.registered.entry(message_type) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                Err(RegistryError::DuplicateType {
                    message_type,
                    existing_area: existing.get(),
                    new_area: area,
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(area);
                Ok(())
            }
        }
    }

    /// Check whether a message type has been registered
    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.registered.contains_key(&message_type)
    }

    /// Look up the functional area owning a message type
    pub fn area_for(&self, message_type: MessageType) -> Option<&'static str> {
        self.registered.get(&message_type).map(|a| *a.value())
    }

    /// Fail with [`RegistryError::UnregisteredType`] for unknown types
    pub fn ensure_registered(&self, message_type: MessageType) -> Result<(), RegistryError> {
        if self.is_registered(message_type) {
            Ok(())
        } else {
            Err(RegistryError::UnregisteredType { message_type })
        }
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
