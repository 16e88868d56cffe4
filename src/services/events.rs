use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PushEventKind {
    WeatherUpdate,
    SatelliteUpdate,
    DamageAssessment,
    Alert,
}

impl PushEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushEventKind::WeatherUpdate => "weather_update",
            PushEventKind::SatelliteUpdate => "satellite_update",
            PushEventKind::DamageAssessment => "damage_assessment",
            PushEventKind::Alert => "alert",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushEvent {
    #[serde(rename = "type")]
    pub kind: PushEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot_id: Option<String>,
    pub data: JsonValue,
    pub timestamp: DateTime<Utc>,
}

/// Best-effort fan-out for the push surface. Slow or disconnected consumers
/// drop messages; there is no replay.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PushEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, kind: PushEventKind, plot_id: Option<&str>, data: JsonValue) {
        let event = PushEvent {
            kind,
            plot_id: plot_id.map(|value| value.to_string()),
            data,
            timestamp: Utc::now(),
        };
        // No receivers is fine; the surface is best-effort.
        let _ = self.sender.send(event);
    }

    pub fn alert(&self, message: &str, data: JsonValue) {
        self.publish(
            PushEventKind::Alert,
            None,
            serde_json::json!({ "message": message, "detail": data }),
        );
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(
            PushEventKind::WeatherUpdate,
            Some("plot-1"),
            serde_json::json!({"composite_score": 0.4}),
        );

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a.kind, PushEventKind::WeatherUpdate);
        assert_eq!(got_a.plot_id.as_deref(), Some("plot-1"));
        assert_eq!(got_b.data["composite_score"], 0.4);
    }

    #[test]
    fn publishing_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(PushEventKind::Alert, None, serde_json::json!({}));
    }
}
