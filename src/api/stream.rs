//! Live task event stream via SSE.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;

use super::AppState;

/// Push-stream of `{task_id, type, ...}` events until the observer closes.
///
/// A disconnected client drops its receiver; the hub detaches the observer
/// on the next delivery attempt.
pub async fn observe(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (_observer_id, mut rx) = state.hub.attach().await;

    let stream = async_stream::stream! {
        // Keepalive comments prevent proxies from timing out quiet streams.
        let mut keepalive = tokio::time::interval(Duration::from_secs(15));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(ev) => {
                            let sse = Event::default()
                                .event(ev.kind.event_name())
                                .json_data(&ev)
                                .unwrap();
                            yield Ok(sse);
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    yield Ok(Event::default().comment("keepalive"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
