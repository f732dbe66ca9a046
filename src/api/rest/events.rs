use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::state::AppState;

/// Live feed of dispatch events. Lagging subscribers skip what they missed.
pub async fn stream_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        let event = result.ok()?;
        match Event::default().event(event.kind()).json_data(&event) {
            Ok(frame) => Some(Ok(frame)),
            Err(err) => {
                warn!(error = %err, "failed to serialize dispatch event for sse");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
