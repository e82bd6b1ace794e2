//! Downstream dispatch table
//!
//! Routes raw inbound entries to registered mailbox handlers. Handlers for
//! the same message type that share a payload type also share one decode:
//! lanes are keyed by the payload's `TypeId`, so each distinct payload type
//! is deserialized at most once per entry regardless of how many handlers
//! subscribed. A decode failure is isolated to its lane and entry; the rest
//! of the parcel is unaffected.

use std::any::{Any, TypeId};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use postal_core::{DownstreamParcel, MessageType, RawFields};

// ----------------------------------------------------------------------------
// Handler Types
// ----------------------------------------------------------------------------

type Decoder =
    Arc<dyn Fn(&RawFields) -> Result<Box<dyn Any + Send + Sync>, serde_json::Error> + Send + Sync>;
type ErasedHandler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;
type RecoveryHandler = Arc<dyn Fn(&RawFields) + Send + Sync>;
type AnyHandler = Arc<dyn Fn(MessageType, &RawFields) + Send + Sync>;

/// One decode lane: a payload type plus every handler subscribed to it
struct Lane {
    payload_type: TypeId,
    decoder: Decoder,
    handlers: Vec<ErasedHandler>,
    recovery: Vec<RecoveryHandler>,
}

// ----------------------------------------------------------------------------
// Dispatch Report
// ----------------------------------------------------------------------------

/// Counters for one parcel's dispatch
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchReport {
    /// Typed handler invocations that received a decoded payload
    pub delivered: usize,
    /// Lane decodes that failed (recovery handlers, if any, were invoked)
    pub decode_errors: usize,
    /// Entries with no subscribed mailbox and no catch-all handler
    pub unrouted: usize,
    /// Entries set aside by the wire parser before dispatch
    pub malformed: usize,
}

// ----------------------------------------------------------------------------
// Dispatch Table
// ----------------------------------------------------------------------------

/// Mailbox registrations and the routing of inbound parcels through them
#[derive(Default)]
pub struct DispatchTable {
    lanes: DashMap<MessageType, Vec<Lane>>,
    any_handlers: RwLock<Vec<AnyHandler>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a typed handler to one message type
    pub fn register<T, F>(&self, message_type: MessageType, handler: F)
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register_inner::<T>(
            message_type,
            Arc::new(move |payload| {
                if let Some(typed) = payload.downcast_ref::<T>() {
                    handler(typed);
                }
            }),
            None,
        );
    }

    /// Subscribe a typed handler plus a recovery handler invoked with the
    /// raw fields when this lane's decode fails
    pub fn register_with_recovery<T, F, R>(
        &self,
        message_type: MessageType,
        handler: F,
        recovery: R,
    ) where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&T) + Send + Sync + 'static,
        R: Fn(&RawFields) + Send + Sync + 'static,
    {
        self.register_inner::<T>(
            message_type,
            Arc::new(move |payload| {
                if let Some(typed) = payload.downcast_ref::<T>() {
                    handler(typed);
                }
            }),
            Some(Arc::new(recovery)),
        );
    }

    fn register_inner<T>(
        &self,
        message_type: MessageType,
        handler: ErasedHandler,
        recovery: Option<RecoveryHandler>,
    ) where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let payload_type = TypeId::of::<T>();
        let mut lanes = self.lanes.entry(message_type).or_default();
        let index = match lanes.iter().position(|lane| lane.payload_type == payload_type) {
            Some(index) => index,
            None => {
                lanes.push(Lane {
                    payload_type,
                    decoder: Arc::new(|fields: &RawFields| {
                        serde_json::from_value::<T>(serde_json::Value::Object(fields.clone()))
                            .map(|payload| Box::new(payload) as Box<dyn Any + Send + Sync>)
                    }),
                    handlers: Vec::new(),
                    recovery: Vec::new(),
                });
                lanes.len() - 1
            }
        };
        let lane = &mut lanes[index];
        lane.handlers.push(handler);
        if let Some(recovery) = recovery {
            lane.recovery.push(recovery);
        }
    }

    /// Subscribe a catch-all handler receiving every entry's raw fields
    pub fn register_any<F>(&self, handler: F)
    where
        F: Fn(MessageType, &RawFields) + Send + Sync + 'static,
    {
        self.any_handlers
            .write()
            .expect("any-handler registry poisoned")
            .push(Arc::new(handler));
    }

    /// True if at least one mailbox (typed or catch-all) is subscribed to
    /// the message type
    pub fn has_route(&self, message_type: MessageType) -> bool {
        self.lanes.contains_key(&message_type)
            || !self
                .any_handlers
                .read()
                .expect("any-handler registry poisoned")
                .is_empty()
    }

    /// Route every entry of a parcel to its subscribed handlers
    pub fn dispatch(&self, parcel: &DownstreamParcel) -> DispatchReport {
        let mut report = DispatchReport {
            malformed: parcel.malformed().len(),
            ..DispatchReport::default()
        };
        if report.malformed > 0 {
            warn!(count = report.malformed, "skipping malformed downstream entries");
        }

        let any_handlers = self
            .any_handlers
            .read()
            .expect("any-handler registry poisoned")
            .clone();

        for entry in parcel.entries() {
            let mut routed = false;

            // Clone lane contents out of the map guard before invoking, so
            // handlers may register on this table without deadlocking
            let lanes: Vec<(Decoder, Vec<ErasedHandler>, Vec<RecoveryHandler>)> = self
                .lanes
                .get(&entry.message_type)
                .map(|lanes| {
                    lanes
                        .iter()
                        .map(|lane| {
                            (
                                lane.decoder.clone(),
                                lane.handlers.clone(),
                                lane.recovery.clone(),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default();

            for (decoder, handlers, recovery) in &lanes {
                match decoder(&entry.fields) {
                    Ok(payload) => {
                        routed = true;
                        for handler in handlers {
                            handler(payload.as_ref());
                            report.delivered += 1;
                        }
                    }
                    Err(err) => {
                        // Fail the lane, not the parcel
                        warn!(
                            message_type = entry.message_type.value(),
                            error = %err,
                            "downstream payload decode failed"
                        );
                        report.decode_errors += 1;
                        routed = true;
                        for handler in recovery {
                            handler(&entry.fields);
                        }
                    }
                }
            }

            for handler in &any_handlers {
                handler(entry.message_type, &entry.fields);
                routed = true;
            }

            if !routed {
                debug!(
                    message_type = entry.message_type.value(),
                    "no mailbox subscribed for inbound message"
                );
                report.unrouted += 1;
            }
        }

        report
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use postal_core::DownstreamEntry;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Notification {
        title: String,
    }

    #[derive(Debug, Deserialize)]
    struct BareEvent {
        #[serde(default)]
        #[allow(dead_code)]
        event: String,
    }

    fn entry(message_type: i32, fields: serde_json::Value) -> DownstreamEntry {
        let fields = match fields {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        DownstreamEntry {
            message_type: MessageType::new(message_type),
            fields,
        }
    }

    #[test]
    fn test_fan_out_to_multiple_handlers() {
        let table = DispatchTable::new();
        let titles = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        let titles_clone = titles.clone();
        table.register::<Notification, _>(MessageType::new(100), move |n| {
            titles_clone.lock().unwrap().push(n.title.clone());
        });
        let count_clone = count.clone();
        table.register::<Notification, _>(MessageType::new(100), move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let parcel =
            DownstreamParcel::from_entries(vec![entry(100, json!({"title": "hello"}))]);
        let report = table.dispatch(&parcel);

        assert_eq!(report.delivered, 2);
        assert_eq!(titles.lock().unwrap().as_slice(), &["hello".to_string()]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_failure_isolated_with_recovery() {
        let table = DispatchTable::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let recovered = Arc::new(Mutex::new(Vec::new()));

        let delivered_clone = delivered.clone();
        let recovered_clone = recovered.clone();
        table.register_with_recovery::<Notification, _, _>(
            MessageType::new(100),
            move |_| {
                delivered_clone.fetch_add(1, Ordering::SeqCst);
            },
            move |fields| {
                recovered_clone.lock().unwrap().push(fields.clone());
            },
        );

        let parcel = DownstreamParcel::from_entries(vec![
            entry(100, json!({"title": "first"})),
            entry(100, json!({"title": 42})),
            entry(100, json!({"title": "third"})),
        ]);
        let report = table.dispatch(&parcel);

        // The bad entry fails alone; its neighbors still deliver
        assert_eq!(report.delivered, 2);
        assert_eq!(report.decode_errors, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        let recovered = recovered.lock().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0]["title"], json!(42));
    }

    #[test]
    fn test_distinct_payload_types_get_separate_lanes() {
        let table = DispatchTable::new();
        let strict = Arc::new(AtomicUsize::new(0));
        let lenient = Arc::new(AtomicUsize::new(0));

        let strict_clone = strict.clone();
        table.register::<Notification, _>(MessageType::new(100), move |_| {
            strict_clone.fetch_add(1, Ordering::SeqCst);
        });
        let lenient_clone = lenient.clone();
        table.register::<BareEvent, _>(MessageType::new(100), move |_| {
            lenient_clone.fetch_add(1, Ordering::SeqCst);
        });

        // Decodes for BareEvent but not Notification
        let parcel = DownstreamParcel::from_entries(vec![entry(100, json!({"event": "x"}))]);
        let report = table.dispatch(&parcel);

        assert_eq!(strict.load(Ordering::SeqCst), 0);
        assert_eq!(lenient.load(Ordering::SeqCst), 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.decode_errors, 1);
    }

    #[test]
    fn test_catch_all_sees_every_entry() {
        let table = DispatchTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        table.register_any(move |message_type, _| {
            seen_clone.lock().unwrap().push(message_type.value());
        });

        let parcel = DownstreamParcel::from_entries(vec![
            entry(1, json!({"ok": true})),
            entry(999, json!({})),
        ]);
        let report = table.dispatch(&parcel);

        assert_eq!(seen.lock().unwrap().as_slice(), &[1, 999]);
        assert_eq!(report.unrouted, 0);
    }

    #[test]
    fn test_handler_may_register_during_dispatch() {
        let table = Arc::new(DispatchTable::new());
        let follow_up = Arc::new(AtomicUsize::new(0));

        // Registering for the dispatched type from inside its own handler
        // must not block on the lane table
        let table_clone = table.clone();
        let follow_up_clone = follow_up.clone();
        table.register::<Notification, _>(MessageType::new(100), move |_| {
            let counter = follow_up_clone.clone();
            table_clone.register::<Notification, _>(MessageType::new(100), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        let report = table.dispatch(&DownstreamParcel::from_entries(vec![entry(
            100,
            json!({"title": "go"}),
        )]));
        assert_eq!(report.delivered, 1);
        assert_eq!(follow_up.load(Ordering::SeqCst), 0);

        // The mailbox added mid-dispatch sees the next parcel
        let report = table.dispatch(&DownstreamParcel::from_entries(vec![entry(
            100,
            json!({"title": "again"}),
        )]));
        assert_eq!(report.delivered, 2);
        assert_eq!(follow_up.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrouted_entries_counted() {
        let table = DispatchTable::new();
        table.register::<Notification, _>(MessageType::new(100), |_| {});

        let parcel = DownstreamParcel::from_entries(vec![
            entry(100, json!({"title": "routed"})),
            entry(200, json!({"event": "nobody home"})),
        ]);
        let report = table.dispatch(&parcel);

        assert_eq!(report.delivered, 1);
        assert_eq!(report.unrouted, 1);
    }
}
