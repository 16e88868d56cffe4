use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::services::events::{PushEvent, PushEventKind};
use crate::state::AppState;

/// Per-plot push stream. Best-effort: a lagging or disconnected client
/// drops messages with no replay.
pub(crate) async fn plot_stream_handler(
    State(state): State<AppState>,
    Path(plot_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| run_stream(state, socket, Some(plot_id)))
}

/// System-wide alert stream.
pub(crate) async fn alerts_stream_handler(
    State(state): State<AppState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| run_stream(state, socket, None))
}

fn wants(event: &PushEvent, plot_filter: Option<&str>) -> bool {
    match plot_filter {
        // Plot streams see everything scoped to their plot.
        Some(plot) => event.plot_id.as_deref() == Some(plot),
        // The alert stream sees alerts only, plot-scoped or global.
        None => event.kind == PushEventKind::Alert,
    }
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| {
            value
                .get("type")
                .and_then(|kind| kind.as_str())
                .map(str::to_string)
        })
        .is_some_and(|kind| kind == "ping")
}

async fn run_stream(state: AppState, socket: WebSocket, plot_filter: Option<String>) {
    let mut events = state.events.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) if wants(&event, plot_filter.as_deref()) => {
                        let Ok(text) = serde_json::to_string(&event) else {
                            continue;
                        };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(dropped)) => {
                        tracing::debug!(dropped, "push subscriber lagged; messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(&text) {
                            let pong = json!({"type": "pong"}).to_string();
                            if sink.send(Message::Text(pong.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/plot/{plot}", get(plot_stream_handler))
        .route("/ws/alerts", get(alerts_stream_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(kind: PushEventKind, plot: Option<&str>) -> PushEvent {
        PushEvent {
            kind,
            plot_id: plot.map(|value| value.to_string()),
            data: json!({}),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn plot_streams_filter_by_plot() {
        let update = event(PushEventKind::WeatherUpdate, Some("plot-1"));
        assert!(wants(&update, Some("plot-1")));
        assert!(!wants(&update, Some("plot-2")));
    }

    #[test]
    fn alert_stream_sees_alerts_only() {
        assert!(wants(&event(PushEventKind::Alert, Some("plot-1")), None));
        assert!(wants(&event(PushEventKind::Alert, None), None));
        assert!(!wants(&event(PushEventKind::WeatherUpdate, Some("plot-1")), None));
    }

    #[test]
    fn ping_detection_requires_the_type_field() {
        assert!(is_ping(r#"{"type":"ping"}"#));
        assert!(!is_ping(r#"{"type":"pong"}"#));
        assert!(!is_ping("not json"));
    }
}
