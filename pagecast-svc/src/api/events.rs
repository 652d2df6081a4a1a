//! GET /events - service-wide SSE feed
//!
//! Forwards every EventBus event (uploads, page narration, retries, book
//! progress, sweeps) with a 15 s heartbeat.

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use pagecast_common::sse::event_bus_sse_stream;
use std::convert::Infallible;

use crate::AppState;

pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_bus_sse_stream(&state.event_bus, "pagecast-svc")
}
