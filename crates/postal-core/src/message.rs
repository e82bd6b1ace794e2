//! Upstream message model and mixins
//!
//! A [`Message`] is the producer-facing unit of information to send
//! upstream: an integer message type, a JSON payload, and an optional set of
//! [`Mixin`]s — asynchronous data providers whose output is merged into the
//! payload at send time. Once mixins have been resolved the message is
//! sealed into a [`SealedMessage`], which is what the store persists and the
//! wire carries.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::MessageType;

/// Raw JSON object fields of a message payload
///
/// Kept as an open map so unknown/extra fields pass through opaquely
/// (forward compatibility).
pub type RawFields = serde_json::Map<String, Value>;

// ----------------------------------------------------------------------------
// Mixin
// ----------------------------------------------------------------------------

/// Error from a mixin's collect step
#[derive(Debug, thiserror::Error)]
#[error("Mixin '{name}' failed to collect: {reason}")]
pub struct MixinError {
    pub name: String,
    pub reason: String,
}

/// Asynchronous data provider merged into a message payload at send time
///
/// Typical mixins supply location, network or cell info. Collection runs on
/// the worker pool, never on the serial store queue. A mixin that fails is
/// skipped with a warning; enrichment is best-effort and never blocks the
/// send.
#[async_trait]
pub trait Mixin: Send + Sync {
    /// Stable name, used as the namespace key when the output is nested
    fn name(&self) -> &str;

    /// Whether the collected fields nest under [`Mixin::name`] as a
    /// sub-object (`true`) or merge into the top-level payload (`false`)
    fn nested(&self) -> bool {
        true
    }

    /// Gather the extra fields for this mixin
    async fn collect(&self) -> Result<RawFields, MixinError>;
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// An upstream message as built by a producer, before mixin resolution
#[derive(Clone)]
pub struct Message {
    message_type: MessageType,
    fields: RawFields,
    mixins: Vec<Arc<dyn Mixin>>,
    requires_network: bool,
}

impl Message {
    /// Create a message from raw fields
    pub fn new(message_type: MessageType, fields: RawFields) -> Self {
        Self {
            message_type,
            fields,
            mixins: Vec::new(),
            requires_network: true,
        }
    }

    /// Create a message by serializing a typed payload
    ///
    /// The payload must serialize to a JSON object.
    pub fn from_typed<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        let fields = match value {
            Value::Object(map) => map,
            other => {
                return Err(serde::ser::Error::custom(format!(
                    "message payload must be a JSON object, got {other}"
                )))
            }
        };
        Ok(Self::new(message_type, fields))
    }

    /// Attach a mixin to be resolved at send time
    pub fn with_mixin(mut self, mixin: Arc<dyn Mixin>) -> Self {
        self.mixins.push(mixin);
        self
    }

    /// Mark the message as sendable without network connectivity
    /// (e.g. destined for a local or store-and-forward courier)
    pub fn without_network_requirement(mut self) -> Self {
        self.requires_network = false;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn fields(&self) -> &RawFields {
        &self.fields
    }

    pub fn mixins(&self) -> &[Arc<dyn Mixin>] {
        &self.mixins
    }

    pub fn requires_network(&self) -> bool {
        self.requires_network
    }

    /// Merge resolved mixin outputs into the payload and seal the message
    ///
    /// Nested outputs land under their namespace key; flat outputs merge
    /// top-level without overwriting fields the producer set explicitly.
    pub fn seal(self, mixin_outputs: Vec<MixinOutput>) -> SealedMessage {
        let mut fields = self.fields;
        for output in mixin_outputs {
            match output.namespace {
                Some(namespace) => {
                    fields.insert(namespace, Value::Object(output.fields));
                }
                None => {
                    for (key, value) in output.fields {
                        fields.entry(key).or_insert(value);
                    }
                }
            }
        }
        SealedMessage {
            message_type: self.message_type,
            fields,
            requires_network: self.requires_network,
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("message_type", &self.message_type)
            .field("fields", &self.fields)
            .field("mixins", &self.mixins.len())
            .field("requires_network", &self.requires_network)
            .finish()
    }
}

/// Output of one resolved mixin
#[derive(Debug, Clone)]
pub struct MixinOutput {
    /// Namespace key for nested outputs, `None` for top-level merge
    pub namespace: Option<String>,
    pub fields: RawFields,
}

// ----------------------------------------------------------------------------
// Sealed Message
// ----------------------------------------------------------------------------

/// An upstream message with mixins resolved; immutable and persistable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedMessage {
    message_type: MessageType,
    fields: RawFields,
    requires_network: bool,
}

impl SealedMessage {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn fields(&self) -> &RawFields {
        &self.fields
    }

    pub fn requires_network(&self) -> bool {
        self.requires_network
    }

    /// Serialized payload size in bytes, used for parcel byte caps
    pub fn payload_size(&self) -> usize {
        serde_json::to_vec(&self.fields).map(|v| v.len()).unwrap_or(0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
