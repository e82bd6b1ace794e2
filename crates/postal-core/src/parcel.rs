//! Parcels: batches of messages exchanged in one transmission
//!
//! An [`UpstreamParcel`] groups envelopes for one courier in one send
//! attempt; it is transient and never persisted (the underlying envelopes
//! are what persist). A [`DownstreamParcel`] is a batch of raw typed JSON
//! objects received from any inbound transport.

use serde_json::Value;

use crate::envelope::UpstreamEnvelope;
use crate::message::RawFields;
use crate::types::{CourierId, MessageType, Timestamp};

/// JSON key carrying the integer message-type discriminator on the wire
pub const TYPE_KEY: &str = "type";

// ----------------------------------------------------------------------------
// Upstream Parcel
// ----------------------------------------------------------------------------

/// A batch of envelopes destined for one courier in one transmission
#[derive(Debug, Clone)]
pub struct UpstreamParcel {
    courier_id: CourierId,
    envelopes: Vec<UpstreamEnvelope>,
    built_at: Timestamp,
}

impl UpstreamParcel {
    /// Build a parcel; envelope order is store selection order
    pub fn new(courier_id: CourierId, envelopes: Vec<UpstreamEnvelope>, built_at: Timestamp) -> Self {
        Self {
            courier_id,
            envelopes,
            built_at,
        }
    }

    pub fn courier_id(&self) -> &CourierId {
        &self.courier_id
    }

    pub fn envelopes(&self) -> &[UpstreamEnvelope] {
        &self.envelopes
    }

    pub fn built_at(&self) -> Timestamp {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Ids of every envelope in the parcel, in order
    pub fn envelope_ids(&self) -> Vec<crate::types::EnvelopeId> {
        self.envelopes.iter().map(|e| e.id).collect()
    }

    /// Serialize to the wire shape: a JSON array of payload objects, each
    /// carrying the integer type under [`TYPE_KEY`]
    pub fn to_wire(&self) -> Value {
        let entries: Vec<Value> = self
            .envelopes
            .iter()
            .map(|envelope| {
                let mut fields = envelope.message.fields().clone();
                fields.insert(
                    TYPE_KEY.to_string(),
                    Value::from(envelope.message.message_type().value()),
                );
                Value::Object(fields)
            })
            .collect();
        Value::Array(entries)
    }
}

// ----------------------------------------------------------------------------
// Downstream Parcel
// ----------------------------------------------------------------------------

/// One raw typed entry of a downstream parcel
#[derive(Debug, Clone)]
pub struct DownstreamEntry {
    pub message_type: MessageType,
    /// All payload fields, extras preserved opaquely
    pub fields: RawFields,
}

/// A batch of raw typed JSON objects received from an inbound transport
#[derive(Debug, Clone, Default)]
pub struct DownstreamParcel {
    entries: Vec<DownstreamEntry>,
    /// Entries that were not objects or carried no integer type key; kept
    /// so telemetry can report them, never a reason to reject the parcel
    malformed: Vec<Value>,
}

impl DownstreamParcel {
    /// Parse the wire shape: a JSON array of objects with an integer type key
    ///
    /// A non-array input is an error; individually malformed entries are
    /// collected aside and do not reject the rest of the batch.
    pub fn from_wire(value: Value) -> Result<Self, serde_json::Error> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "downstream parcel must be a JSON array, got {other}"
                )))
            }
        };

        let mut entries = Vec::new();
        let mut malformed = Vec::new();
        for item in items {
            match item {
                Value::Object(mut fields) => {
                    let message_type = fields
                        .remove(TYPE_KEY)
                        .and_then(|v| v.as_i64())
                        .and_then(|v| i32::try_from(v).ok());
                    match message_type {
                        Some(raw_type) => entries.push(DownstreamEntry {
                            message_type: MessageType::new(raw_type),
                            fields,
                        }),
                        None => malformed.push(Value::Object(fields)),
                    }
                }
                other => malformed.push(other),
            }
        }

        Ok(Self { entries, malformed })
    }

    /// Build a parcel directly from entries (test and local-loop use)
    pub fn from_entries(entries: Vec<DownstreamEntry>) -> Self {
        Self {
            entries,
            malformed: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[DownstreamEntry] {
        &self.entries
    }

    pub fn malformed(&self) -> &[Value] {
        &self.malformed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.malformed.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::types::{EnvelopeId, SendPriority};
    use serde_json::json;

    fn envelope_with(message_type: i32, fields: Value) -> UpstreamEnvelope {
        let fields = match fields {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        UpstreamEnvelope {
            id: EnvelopeId::generate(),
            message: Message::new(MessageType::new(message_type), fields).seal(Vec::new()),
            created_at: Timestamp::new(0),
            priority: SendPriority::Buffer,
            ttl: None,
            attempt_count: 0,
            in_flight_deadline: None,
            courier_id: None,
            requires_delivery_ack: false,
            sequence: 0,
        }
    }

    #[test]
    fn test_upstream_wire_shape() {
        let parcel = UpstreamParcel::new(
            CourierId::new("http"),
            vec![
                envelope_with(100, json!({"title": "hi"})),
                envelope_with(200, json!({"event": "open"})),
            ],
            Timestamp::new(42),
        );

        let wire = parcel.to_wire();
        assert_eq!(
            wire,
            json!([
                {"title": "hi", "type": 100},
                {"event": "open", "type": 200},
            ])
        );
    }

    #[test]
    fn test_downstream_from_wire_preserves_extras() {
        let parcel = DownstreamParcel::from_wire(json!([
            {"type": 100, "title": "hello", "unknown_field": {"x": 1}},
        ]))
        .unwrap();

        assert_eq!(parcel.len(), 1);
        let entry = &parcel.entries()[0];
        assert_eq!(entry.message_type, MessageType::new(100));
        assert_eq!(entry.fields["unknown_field"], json!({"x": 1}));
        assert!(!entry.fields.contains_key(TYPE_KEY));
    }

    #[test]
    fn test_downstream_malformed_entries_set_aside() {
        let parcel = DownstreamParcel::from_wire(json!([
            {"type": 100, "ok": true},
            {"no_type": true},
            "not an object",
            {"type": "not an int"},
        ]))
        .unwrap();

        assert_eq!(parcel.entries().len(), 1);
        assert_eq!(parcel.malformed().len(), 3);
    }

    #[test]
    fn test_downstream_non_array_rejected() {
        assert!(DownstreamParcel::from_wire(json!({"type": 1})).is_err());
    }
}
