//! CLI-facing WebSocket: `ws://…/ws/sessions?name=<session>`.
//!
//! Runs on the same axum router as the REST surface — unlike the teacher's
//! standalone IPC listener, there's already an HTTP server here, so the
//! upgrade rides axum's extractor instead of a second raw TCP accept loop.
//! The per-connection read/write loop below keeps the teacher's shape:
//! `tokio::select!` between inbound frames and the outbound channel, with
//! `Lagged` treated as a log-and-continue rather than a fatal condition.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::master::MasterContext;
use crate::protocol::encode_line;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    name: String,
}

pub async fn ws_upgrade(
    State(ctx): State<Arc<MasterContext>>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, q.name))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<MasterContext>, session_name: String) {
    let (_subscription, mut outbound) = ctx.sessions.handle_connection(&session_name).await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        ctx.sessions.handle_message(&session_name, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong — axum answers ping/pong itself
                    Some(Err(e)) => {
                        debug!(session = %session_name, err = %e, "ws read error — closing");
                        break;
                    }
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(msg) => {
                        let line = encode_line(&msg);
                        if socket.send(Message::Text(line)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    ctx.sessions.handle_close(&session_name).await;
    warn!(session = %session_name, "ws session closed");
}
