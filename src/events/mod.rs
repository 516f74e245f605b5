use crate::entities::reservation;
use crate::errors::ServiceError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod outbox;
pub mod subscribers;

/// Bus topic carrying every reservation lifecycle event. Partitioned by
/// `user_id` so one user's events arrive in write order.
pub const RESERVATION_TOPIC: &str = "reservation_events";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationCreated {
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub product_id: i64,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationConfirmed {
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub product_id: i64,
    pub quantity: i32,
    pub total_price: Decimal,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationCancelled {
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub product_id: i64,
    pub quantity: i32,
    pub total_price: Decimal,
    pub cancelled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationExpired {
    pub reservation_id: Uuid,
    pub user_id: Uuid,
    pub product_id: i64,
    pub quantity: i32,
    pub total_price: Decimal,
    pub expired_at: DateTime<Utc>,
}

/// The closed set of domain events this engine emits. Subscribers match on
/// the variant; unknown event types never get past `EventEnvelope::decode`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationEvent {
    Created(ReservationCreated),
    Confirmed(ReservationConfirmed),
    Cancelled(ReservationCancelled),
    Expired(ReservationExpired),
}

impl ReservationEvent {
    pub fn created(model: &reservation::Model) -> Self {
        ReservationEvent::Created(ReservationCreated {
            reservation_id: model.id,
            user_id: model.user_id,
            product_id: model.product_id,
            quantity: model.quantity,
            unit_price: model.unit_price,
            expires_at: model.expires_at,
        })
    }

    pub fn confirmed(model: &reservation::Model, confirmed_at: DateTime<Utc>) -> Self {
        ReservationEvent::Confirmed(ReservationConfirmed {
            reservation_id: model.id,
            user_id: model.user_id,
            product_id: model.product_id,
            quantity: model.quantity,
            total_price: model.total_price,
            confirmed_at,
        })
    }

    pub fn cancelled(
        model: &reservation::Model,
        cancelled_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Self {
        ReservationEvent::Cancelled(ReservationCancelled {
            reservation_id: model.id,
            user_id: model.user_id,
            product_id: model.product_id,
            quantity: model.quantity,
            total_price: model.total_price,
            cancelled_at,
            reason,
        })
    }

    pub fn expired(model: &reservation::Model, expired_at: DateTime<Utc>) -> Self {
        ReservationEvent::Expired(ReservationExpired {
            reservation_id: model.id,
            user_id: model.user_id,
            product_id: model.product_id,
            quantity: model.quantity,
            total_price: model.total_price,
            expired_at,
        })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            ReservationEvent::Created(_) => "reservation.created",
            ReservationEvent::Confirmed(_) => "reservation.confirmed",
            ReservationEvent::Cancelled(_) => "reservation.cancelled",
            ReservationEvent::Expired(_) => "reservation.expired",
        }
    }

    pub fn reservation_id(&self) -> Uuid {
        match self {
            ReservationEvent::Created(e) => e.reservation_id,
            ReservationEvent::Confirmed(e) => e.reservation_id,
            ReservationEvent::Cancelled(e) => e.reservation_id,
            ReservationEvent::Expired(e) => e.reservation_id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            ReservationEvent::Created(e) => e.user_id,
            ReservationEvent::Confirmed(e) => e.user_id,
            ReservationEvent::Cancelled(e) => e.user_id,
            ReservationEvent::Expired(e) => e.user_id,
        }
    }

    /// Partition key on the bus.
    pub fn aggregate_key(&self) -> String {
        self.user_id().to_string()
    }

    fn data(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            ReservationEvent::Created(e) => serde_json::to_value(e),
            ReservationEvent::Confirmed(e) => serde_json::to_value(e),
            ReservationEvent::Cancelled(e) => serde_json::to_value(e),
            ReservationEvent::Expired(e) => serde_json::to_value(e),
        }
    }

    pub fn envelope(&self, timestamp: DateTime<Utc>) -> Result<EventEnvelope, ServiceError> {
        Ok(EventEnvelope {
            event_type: self.event_type().to_string(),
            timestamp,
            data: self
                .data()
                .map_err(|e| ServiceError::EventError(e.to_string()))?,
        })
    }
}

/// Wire shape of every published event: `{event_type, timestamp, data}` with
/// an RFC3339 timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Parses the envelope back into the closed event set. Unknown event
    /// types are rejected here, at the subscriber boundary.
    pub fn decode(&self) -> Result<ReservationEvent, ServiceError> {
        let data = self.data.clone();
        let parse = |e: serde_json::Error| ServiceError::EventError(e.to_string());
        match self.event_type.as_str() {
            "reservation.created" => Ok(ReservationEvent::Created(
                serde_json::from_value(data).map_err(parse)?,
            )),
            "reservation.confirmed" => Ok(ReservationEvent::Confirmed(
                serde_json::from_value(data).map_err(parse)?,
            )),
            "reservation.cancelled" => Ok(ReservationEvent::Cancelled(
                serde_json::from_value(data).map_err(parse)?,
            )),
            "reservation.expired" => Ok(ReservationEvent::Expired(
                serde_json::from_value(data).map_err(parse)?,
            )),
            other => Err(ServiceError::EventError(format!(
                "unknown event type: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn sample_model() -> reservation::Model {
        let now = Utc::now();
        reservation::Model {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            product_id: 7,
            quantity: 3,
            status: "pending".to_string(),
            unit_price: dec!(25.00),
            total_price: dec!(75.00),
            customer_info: json!({}),
            expires_at: now + chrono::Duration::minutes(15),
            created_at: now,
            updated_at: None,
            confirmed_at: None,
            cancelled_at: None,
        }
    }

    #[test]
    fn envelope_carries_type_timestamp_and_data() {
        let model = sample_model();
        let event = ReservationEvent::created(&model);
        let envelope = event.envelope(Utc::now()).unwrap();

        assert_eq!(envelope.event_type, "reservation.created");
        assert_eq!(
            envelope.data["reservation_id"],
            json!(model.id.to_string())
        );
        assert_eq!(envelope.data["quantity"], json!(3));
    }

    #[test]
    fn confirmed_event_carries_total_price() {
        let model = sample_model();
        let event = ReservationEvent::confirmed(&model, Utc::now());
        let envelope = event.envelope(Utc::now()).unwrap();
        assert_eq!(envelope.event_type, "reservation.confirmed");
        assert!(envelope.data.get("total_price").is_some());
    }

    #[test]
    fn envelope_round_trips_through_decode() {
        let model = sample_model();
        let event = ReservationEvent::expired(&model, Utc::now());
        let envelope = event.envelope(Utc::now()).unwrap();
        let decoded = envelope.decode().unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let envelope = EventEnvelope {
            event_type: "reservation.teleported".to_string(),
            timestamp: Utc::now(),
            data: json!({}),
        };
        assert!(envelope.decode().is_err());
    }

    #[test]
    fn aggregate_key_is_the_user_id() {
        let model = sample_model();
        let event = ReservationEvent::created(&model);
        assert_eq!(event.aggregate_key(), model.user_id.to_string());
    }
}
