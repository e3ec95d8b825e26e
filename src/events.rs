//! In-process domain event fan-out.
//!
//! `publish` never blocks and never fails the publisher: subscribers read
//! from bounded broadcast channels and a slow subscriber loses the oldest
//! events (counted, not fatal — reservation state lives in the store, the
//! bus carries only notifications).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::Clock;
use crate::db::models::ReservationStatus;

/// Per-subscriber channel capacity; the oldest event is dropped on overflow.
const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic publish sequence, per bus.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ReservationCreated {
        reservation_id: i64,
        user_id: i64,
        resource_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
    ReservationCancelled {
        reservation_id: i64,
        user_id: i64,
        resource_id: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        cancelled_at: DateTime<Utc>,
    },
    ReservationUpdated {
        reservation_id: i64,
        user_id: i64,
        resource_id: i64,
        status: ReservationStatus,
    },
    ReservationExpired {
        reservation_id: i64,
        user_id: i64,
        resource_id: i64,
    },
    ResourceCreated {
        resource_id: i64,
        name: String,
    },
    ResourceUpdated {
        resource_id: i64,
        name: String,
    },
    ResourceUnavailable {
        resource_id: i64,
        name: String,
    },
    ResourceAvailable {
        resource_id: i64,
        name: String,
    },
    WaitlistOffer {
        entry_id: i64,
        user_id: i64,
        resource_id: i64,
        desired_start: DateTime<Utc>,
        desired_end: DateTime<Utc>,
        offer_expires_at: DateTime<Utc>,
    },
    WaitlistAccepted {
        entry_id: i64,
        user_id: i64,
        resource_id: i64,
        reservation_id: i64,
    },
    WaitlistExpired {
        entry_id: i64,
        user_id: i64,
        resource_id: i64,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::ReservationCreated { .. } => "reservation.created",
            EventPayload::ReservationCancelled { .. } => "reservation.cancelled",
            EventPayload::ReservationUpdated { .. } => "reservation.updated",
            EventPayload::ReservationExpired { .. } => "reservation.expired",
            EventPayload::ResourceCreated { .. } => "resource.created",
            EventPayload::ResourceUpdated { .. } => "resource.updated",
            EventPayload::ResourceUnavailable { .. } => "resource.unavailable",
            EventPayload::ResourceAvailable { .. } => "resource.available",
            EventPayload::WaitlistOffer { .. } => "waitlist.offer",
            EventPayload::WaitlistAccepted { .. } => "waitlist.accepted",
            EventPayload::WaitlistExpired { .. } => "waitlist.expired",
        }
    }

    /// Type-specific `data` object of the wire schema: the affected entity's
    /// id plus the minimum context needed to dereference it.
    pub fn data(&self) -> Value {
        match self {
            EventPayload::ReservationCreated {
                reservation_id,
                user_id,
                resource_id,
                start_time,
                end_time,
            } => json!({
                "reservation_id": reservation_id,
                "user_id": user_id,
                "resource_id": resource_id,
                "start_time": start_time.to_rfc3339(),
                "end_time": end_time.to_rfc3339(),
            }),
            EventPayload::ReservationCancelled {
                reservation_id,
                user_id,
                resource_id,
                start_time,
                end_time,
                cancelled_at,
            } => json!({
                "reservation_id": reservation_id,
                "user_id": user_id,
                "resource_id": resource_id,
                "start_time": start_time.to_rfc3339(),
                "end_time": end_time.to_rfc3339(),
                "cancelled_at": cancelled_at.to_rfc3339(),
            }),
            EventPayload::ReservationUpdated {
                reservation_id,
                user_id,
                resource_id,
                status,
            } => json!({
                "reservation_id": reservation_id,
                "user_id": user_id,
                "resource_id": resource_id,
                "status": status.as_str(),
            }),
            EventPayload::ReservationExpired {
                reservation_id,
                user_id,
                resource_id,
            } => json!({
                "reservation_id": reservation_id,
                "user_id": user_id,
                "resource_id": resource_id,
            }),
            EventPayload::ResourceCreated { resource_id, name }
            | EventPayload::ResourceUpdated { resource_id, name }
            | EventPayload::ResourceUnavailable { resource_id, name }
            | EventPayload::ResourceAvailable { resource_id, name } => json!({
                "resource_id": resource_id,
                "name": name,
            }),
            EventPayload::WaitlistOffer {
                entry_id,
                user_id,
                resource_id,
                desired_start,
                desired_end,
                offer_expires_at,
            } => json!({
                "waitlist_id": entry_id,
                "user_id": user_id,
                "resource_id": resource_id,
                "desired_start": desired_start.to_rfc3339(),
                "desired_end": desired_end.to_rfc3339(),
                "expires_at": offer_expires_at.to_rfc3339(),
            }),
            EventPayload::WaitlistAccepted {
                entry_id,
                user_id,
                resource_id,
                reservation_id,
            } => json!({
                "waitlist_id": entry_id,
                "user_id": user_id,
                "resource_id": resource_id,
                "reservation_id": reservation_id,
            }),
            EventPayload::WaitlistExpired {
                entry_id,
                user_id,
                resource_id,
            } => json!({
                "waitlist_id": entry_id,
                "user_id": user_id,
                "resource_id": resource_id,
            }),
        }
    }
}

/// Canonical webhook wire body: `{event, timestamp, data}`, keys sorted.
pub fn wire_body(event: &Event) -> String {
    json!({
        "event": event.payload.event_type(),
        "timestamp": event.timestamp.to_rfc3339(),
        "data": event.payload.data(),
    })
    .to_string()
}

/// Fan-out hub for domain events.
///
/// Cloning is cheap — clones share the same underlying channel via Arc.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    clock: Clock,
}

impl EventBus {
    pub fn new(clock: Clock) -> Self {
        Self::with_capacity(clock, BUS_CAPACITY)
    }

    pub fn with_capacity(clock: Clock, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Publish an event to every subscriber. Never blocks; an event sent
    /// while no subscriber is attached is simply dropped.
    pub fn publish(&self, payload: EventPayload) -> Event {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: self.clock.now(),
            payload,
        };
        debug!(event = event.payload.event_type(), seq = event.seq, "Publishing event");
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Record `n` events lost by a lagging subscriber.
    pub fn note_lagged(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Total events dropped across all subscribers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_bus() -> EventBus {
        let clock = Clock::fixed(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        EventBus::new(clock)
    }

    fn expired_payload(id: i64) -> EventPayload {
        EventPayload::ReservationExpired {
            reservation_id: id,
            user_id: 1,
            resource_id: 1,
        }
    }

    #[test]
    fn event_type_strings_match_wire_names() {
        let clock = Clock::fixed(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let now = clock.now();
        let cases = [
            (
                EventPayload::ReservationCreated {
                    reservation_id: 1,
                    user_id: 1,
                    resource_id: 1,
                    start_time: now,
                    end_time: now,
                },
                "reservation.created",
            ),
            (
                EventPayload::ReservationCancelled {
                    reservation_id: 1,
                    user_id: 1,
                    resource_id: 1,
                    start_time: now,
                    end_time: now,
                    cancelled_at: now,
                },
                "reservation.cancelled",
            ),
            (
                EventPayload::ReservationUpdated {
                    reservation_id: 1,
                    user_id: 1,
                    resource_id: 1,
                    status: ReservationStatus::Active,
                },
                "reservation.updated",
            ),
            (expired_payload(1), "reservation.expired"),
            (
                EventPayload::ResourceCreated {
                    resource_id: 1,
                    name: "Room A".into(),
                },
                "resource.created",
            ),
            (
                EventPayload::ResourceUnavailable {
                    resource_id: 1,
                    name: "Room A".into(),
                },
                "resource.unavailable",
            ),
            (
                EventPayload::WaitlistOffer {
                    entry_id: 1,
                    user_id: 1,
                    resource_id: 1,
                    desired_start: now,
                    desired_end: now,
                    offer_expires_at: now,
                },
                "waitlist.offer",
            ),
            (
                EventPayload::WaitlistAccepted {
                    entry_id: 1,
                    user_id: 1,
                    resource_id: 1,
                    reservation_id: 2,
                },
                "waitlist.accepted",
            ),
            (
                EventPayload::WaitlistExpired {
                    entry_id: 1,
                    user_id: 1,
                    resource_id: 1,
                },
                "waitlist.expired",
            ),
        ];
        for (payload, expected) in cases {
            assert_eq!(payload.event_type(), expected);
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_publish_order() {
        let bus = test_bus();
        let mut rx = bus.subscribe();

        bus.publish(expired_payload(1));
        bus.publish(expired_payload(2));
        bus.publish(expired_payload(3));

        for expected_seq in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.seq, expected_seq);
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let bus = test_bus();
        let event = bus.publish(expired_payload(1));
        assert_eq!(event.seq, 0);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let clock = Clock::fixed(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let bus = EventBus::with_capacity(clock, 4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(expired_payload(i));
        }

        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                bus.note_lagged(n);
                assert_eq!(bus.dropped_events(), n);
            }
            other => panic!("expected lag, got {other:?}"),
        }

        // The newest events are still deliverable after the lag.
        let event = rx.recv().await.unwrap();
        assert!(event.seq >= 4);
    }

    #[test]
    fn wire_body_is_canonical_json() {
        let bus = test_bus();
        let event = bus.publish(EventPayload::ReservationCreated {
            reservation_id: 42,
            user_id: 7,
            resource_id: 3,
            start_time: Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap(),
        });

        let body = wire_body(&event);
        let parsed: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["event"], "reservation.created");
        assert_eq!(parsed["timestamp"], "2025-06-01T12:00:00+00:00");
        assert_eq!(parsed["data"]["reservation_id"], 42);
        assert_eq!(parsed["data"]["start_time"], "2025-06-01T13:00:00+00:00");

        // Deterministic: serializing twice yields identical bytes.
        assert_eq!(body, wire_body(&event));
    }
}
