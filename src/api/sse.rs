//! SSE endpoint backing `GET /api/sessions/:name/stream`.
//!
//! First frame is always `{type:"connected", sessionName}`. If the session
//! currently has live WS state, a `state_snapshot` frame follows. From then
//! on every bus event for that session name is forwarded as it's emitted.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;

use crate::events::recv_lossy;
use crate::master::MasterContext;

pub async fn stream_session(
    State(ctx): State<Arc<MasterContext>>,
    Path(name): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut initial = vec![json!({ "type": "connected", "sessionName": name })];
    if let Some(snapshot) = ctx.sessions.get_session_state(&name).await {
        initial.push(json!({ "type": "state_snapshot", "state": snapshot }));
    }

    let rx = ctx.bus.subscribe();
    let initial_stream = stream::iter(initial.into_iter().map(|v| Ok(Event::default().data(v.to_string()))));
    let live_stream = stream::unfold((rx, name), forward_next_matching);

    Sse::new(initial_stream.chain(live_stream))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

async fn forward_next_matching(
    mut state: (broadcast::Receiver<crate::events::SessionEvent>, String),
) -> Option<(Result<Event, Infallible>, (broadcast::Receiver<crate::events::SessionEvent>, String))> {
    loop {
        let event = recv_lossy(&mut state.0).await?;
        if event.session_name() == state.1 {
            let data = serde_json::to_string(&event).unwrap_or_default();
            return Some((Ok(Event::default().data(data)), state));
        }
    }
}
