//! Connection events for collaborators
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel. Delivery is
//! at most once per occurrence: a subscriber that falls behind by more than the
//! channel capacity sees `RecvError::Lagged` and misses the overwritten events.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::messages::OcppError;
use super::state::ConnectionState;

/// Something that happened on a charge point connection
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ConnectionEvent {
    /// Transport opened
    #[serde(rename_all = "camelCase")]
    Connected { charge_point_id: String },

    /// Caller-initiated disconnect completed
    #[serde(rename_all = "camelCase")]
    Disconnected { charge_point_id: String },

    /// Any state transition
    #[serde(rename = "stateChange", rename_all = "camelCase")]
    StateChanged {
        charge_point_id: String,
        state: ConnectionState,
    },

    /// Transport failure; `fatal` when no further automatic retries will happen
    #[serde(rename_all = "camelCase")]
    Error {
        charge_point_id: String,
        message: String,
        fatal: bool,
    },

    #[serde(rename_all = "camelCase")]
    StatusNotification {
        charge_point_id: String,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    MeterValues {
        charge_point_id: String,
        payload: Value,
    },

    /// Carries the transaction id that was handed back to the charge point
    #[serde(rename_all = "camelCase")]
    StartTransaction {
        charge_point_id: String,
        transaction_id: i32,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    StopTransaction {
        charge_point_id: String,
        payload: Value,
    },
}

impl ConnectionEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected { .. } => "connected",
            ConnectionEvent::Disconnected { .. } => "disconnected",
            ConnectionEvent::StateChanged { .. } => "stateChange",
            ConnectionEvent::Error { .. } => "error",
            ConnectionEvent::StatusNotification { .. } => "statusNotification",
            ConnectionEvent::MeterValues { .. } => "meterValues",
            ConnectionEvent::StartTransaction { .. } => "startTransaction",
            ConnectionEvent::StopTransaction { .. } => "stopTransaction",
        }
    }

    /// Charge point the event belongs to
    pub fn charge_point_id(&self) -> &str {
        match self {
            ConnectionEvent::Connected { charge_point_id }
            | ConnectionEvent::Disconnected { charge_point_id }
            | ConnectionEvent::StateChanged { charge_point_id, .. }
            | ConnectionEvent::Error { charge_point_id, .. }
            | ConnectionEvent::StatusNotification { charge_point_id, .. }
            | ConnectionEvent::MeterValues { charge_point_id, .. }
            | ConnectionEvent::StartTransaction { charge_point_id, .. }
            | ConnectionEvent::StopTransaction { charge_point_id, .. } => charge_point_id,
        }
    }

    /// Raw payload of a charge-point-initiated event
    pub fn payload(&self) -> Option<&Value> {
        match self {
            ConnectionEvent::StatusNotification { payload, .. }
            | ConnectionEvent::MeterValues { payload, .. }
            | ConnectionEvent::StartTransaction { payload, .. }
            | ConnectionEvent::StopTransaction { payload, .. } => Some(payload),
            _ => None,
        }
    }

    /// Decode the payload into one of the typed requests in `ocpp::types`
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, OcppError> {
        let payload = self.payload().ok_or(OcppError::InvalidFormat)?;
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Broadcast fan-out shared by one or more connections
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ConnectionEvent) {
        trace!("Event {} for {}", event.event_type(), event.charge_point_id());
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::types::{ChargePointStatus, StatusNotificationRequest};

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(ConnectionEvent::Connected {
            charge_point_id: "CP1".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "connected");
        assert_eq!(event.charge_point_id(), "CP1");
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(8);
        bus.emit(ConnectionEvent::Disconnected {
            charge_point_id: "CP1".into(),
        });
    }

    #[test]
    fn test_typed_payload() {
        let event = ConnectionEvent::StatusNotification {
            charge_point_id: "CP1".into(),
            payload: serde_json::json!({
                "connectorId": 1,
                "status": "Charging",
                "errorCode": "NoError"
            }),
        };

        let req: StatusNotificationRequest = event.payload_as().unwrap();
        assert_eq!(req.status, ChargePointStatus::Charging);

        let connected = ConnectionEvent::Connected {
            charge_point_id: "CP1".into(),
        };
        assert!(connected.payload_as::<StatusNotificationRequest>().is_err());
    }

    #[test]
    fn test_event_serialization() {
        let event = ConnectionEvent::StateChanged {
            charge_point_id: "CP1".into(),
            state: ConnectionState::Reconnecting,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stateChange");
        assert_eq!(json["chargePointId"], "CP1");
        assert_eq!(json["state"], "reconnecting");
    }
}
