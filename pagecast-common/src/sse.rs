//! Server-Sent Events (SSE) utilities
//!
//! Framing for the two event families: the service-wide EventBus feed and the
//! per-request upload stream.

use crate::events::{EventBus, PagecastEvent, UploadEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Heartbeat period shared by all streams
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Frame an upload event: `event:` is the kind, `data:` the JSON object
pub fn upload_event_frame(event: &UploadEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("SSE: Failed to serialize upload event: {}", e);
        String::from("{}")
    });
    Event::default().event(event.event_type()).data(data)
}

/// Frame a bus event, or `None` if it cannot be serialized
pub fn bus_event_frame(event: &PagecastEvent) -> Option<Event> {
    let event_type = event.event_type();
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().event(event_type).data(json)),
        Err(e) => {
            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
            None
        }
    }
}

/// Stream every upload event received on `rx` until the sender side closes
///
/// The producer decides when the stream ends; the stream itself never adds a
/// terminal event.
pub fn upload_sse_stream(
    mut rx: mpsc::Receiver<UploadEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            debug!("SSE: upload event {}", event.event_type());
            yield Ok(upload_event_frame(&event));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
}

/// Forward all EventBus traffic to an SSE client, with a heartbeat
///
/// A client that lags behind the bus skips the dropped events and keeps going.
pub fn event_bus_sse_stream(
    event_bus: &EventBus,
    service_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} events", service_name);

    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }

                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Some(frame) = bus_event_frame(&event) {
                            yield Ok(frame);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("SSE: {} client lagged, skipped {} events", service_name, skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!("SSE: {} event bus closed", service_name);
                        break;
                    }
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("heartbeat"))
}
