use crate::errors::ServiceError;
use crate::events::{EventEnvelope, ReservationEvent};
use crate::message_queue::DeliveredMessage;
use async_trait::async_trait;
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

/// A consumer of reservation events. Handlers must be idempotent: the bus
/// delivers at least once, and the dispatcher's dedup is best-effort.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &ReservationEvent) -> Result<(), ServiceError>;
}

/// Fans delivered messages out to subscribers. Decodes the envelope into the
/// closed event set (rejecting unknown kinds at the boundary) and suppresses
/// redeliveries a subscriber has already processed, keyed on
/// `(reservation_id, event_type)` per subscriber.
pub struct SubscriberDispatcher {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
    seen: DashSet<(Uuid, &'static str, String)>,
}

impl SubscriberDispatcher {
    pub fn new(subscribers: Vec<Arc<dyn EventSubscriber>>) -> Self {
        Self {
            subscribers,
            seen: DashSet::new(),
        }
    }

    pub async fn dispatch(&self, message: &DeliveredMessage) -> Result<(), ServiceError> {
        let envelope: EventEnvelope = serde_json::from_value(message.payload.clone())
            .map_err(|e| ServiceError::EventError(format!("malformed envelope: {e}")))?;
        let event = envelope.decode()?;

        for subscriber in &self.subscribers {
            let dedup_key = (
                event.reservation_id(),
                subscriber.name(),
                event.event_type().to_string(),
            );
            if !self.seen.insert(dedup_key.clone()) {
                info!(
                    subscriber = subscriber.name(),
                    event_type = event.event_type(),
                    reservation_id = %event.reservation_id(),
                    "duplicate delivery suppressed"
                );
                continue;
            }
            if let Err(e) = subscriber.handle(&event).await {
                // Forget the key so the redelivery gets another attempt.
                self.seen.remove(&dedup_key);
                warn!(
                    subscriber = subscriber.name(),
                    event_type = event.event_type(),
                    error = %e,
                    "subscriber failed; will retry on redelivery"
                );
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Notification-side consumer. The engine only owns the producer contract, so
/// this logs the intent the notification platform would act on.
#[derive(Debug, Default)]
pub struct NotificationSubscriber;

#[async_trait]
impl EventSubscriber for NotificationSubscriber {
    fn name(&self) -> &'static str {
        "notifications"
    }

    async fn handle(&self, event: &ReservationEvent) -> Result<(), ServiceError> {
        match event {
            ReservationEvent::Created(e) => info!(
                reservation_id = %e.reservation_id,
                user_id = %e.user_id,
                expires_at = %e.expires_at,
                "notify: reservation created"
            ),
            ReservationEvent::Confirmed(e) => info!(
                reservation_id = %e.reservation_id,
                user_id = %e.user_id,
                total_price = %e.total_price,
                "notify: reservation confirmed"
            ),
            ReservationEvent::Cancelled(e) => info!(
                reservation_id = %e.reservation_id,
                user_id = %e.user_id,
                "notify: reservation cancelled"
            ),
            ReservationEvent::Expired(e) => info!(
                reservation_id = %e.reservation_id,
                user_id = %e.user_id,
                "notify: reservation expired"
            ),
        }
        Ok(())
    }
}

/// Analytics-side consumer keeping running totals. Idempotence comes from the
/// dispatcher's dedup plus the closed event set.
#[derive(Debug, Default)]
pub struct AnalyticsSubscriber {
    created: AtomicU64,
    confirmed: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    revenue: Mutex<Decimal>,
}

impl AnalyticsSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn confirmed_count(&self) -> u64 {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn cancelled_count(&self) -> u64 {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::SeqCst)
    }

    pub fn confirmed_revenue(&self) -> Decimal {
        *self.revenue.lock().expect("revenue lock poisoned")
    }
}

#[async_trait]
impl EventSubscriber for AnalyticsSubscriber {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn handle(&self, event: &ReservationEvent) -> Result<(), ServiceError> {
        match event {
            ReservationEvent::Created(_) => {
                self.created.fetch_add(1, Ordering::SeqCst);
            }
            ReservationEvent::Confirmed(e) => {
                self.confirmed.fetch_add(1, Ordering::SeqCst);
                let mut revenue = self.revenue.lock().expect("revenue lock poisoned");
                *revenue += e.total_price;
            }
            ReservationEvent::Cancelled(_) => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            ReservationEvent::Expired(_) => {
                self.expired.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RESERVATION_TOPIC;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn delivered(event: &ReservationEvent) -> DeliveredMessage {
        let envelope = event.envelope(Utc::now()).unwrap();
        DeliveredMessage {
            topic: RESERVATION_TOPIC.to_string(),
            key: event.aggregate_key(),
            payload: serde_json::to_value(envelope).unwrap(),
        }
    }

    fn confirmed_event() -> ReservationEvent {
        ReservationEvent::Confirmed(crate::events::ReservationConfirmed {
            reservation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: 1,
            quantity: 2,
            total_price: dec!(50.00),
            confirmed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn duplicate_delivery_is_effectively_once() {
        let analytics = Arc::new(AnalyticsSubscriber::new());
        let dispatcher = SubscriberDispatcher::new(vec![analytics.clone()]);

        let message = delivered(&confirmed_event());
        dispatcher.dispatch(&message).await.unwrap();
        dispatcher.dispatch(&message).await.unwrap();

        assert_eq!(analytics.confirmed_count(), 1);
        assert_eq!(analytics.confirmed_revenue(), dec!(50.00));
    }

    #[tokio::test]
    async fn unknown_event_kind_is_rejected() {
        let dispatcher = SubscriberDispatcher::new(vec![Arc::new(NotificationSubscriber)]);
        let message = DeliveredMessage {
            topic: RESERVATION_TOPIC.to_string(),
            key: "k".to_string(),
            payload: json!({
                "event_type": "reservation.upgraded",
                "timestamp": Utc::now(),
                "data": {}
            }),
        };
        assert!(dispatcher.dispatch(&message).await.is_err());
    }

    #[tokio::test]
    async fn distinct_events_all_count() {
        let analytics = Arc::new(AnalyticsSubscriber::new());
        let dispatcher = SubscriberDispatcher::new(vec![analytics.clone()]);

        dispatcher
            .dispatch(&delivered(&confirmed_event()))
            .await
            .unwrap();
        dispatcher
            .dispatch(&delivered(&confirmed_event()))
            .await
            .unwrap();

        assert_eq!(analytics.confirmed_count(), 2);
        assert_eq!(analytics.confirmed_revenue(), dec!(100.00));
    }
}
