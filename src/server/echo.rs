//! Echo service: every data frame goes back unchanged.

use super::stats::{ServerStats, StreamKind};
use super::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use log::{debug, warn};
use std::sync::Arc;

pub(crate) async fn echo(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let max_message = state.config.echo_max_message;
    let stats = Arc::clone(&state.stats);
    ws.on_upgrade(move |socket| handle_echo(socket, stats, max_message))
}

/// Pings are answered by the WebSocket layer itself.
async fn handle_echo(mut socket: WebSocket, stats: Arc<ServerStats>, max_message: usize) {
    let _guard = stats.begin(StreamKind::Echo);

    while let Some(msg) = socket.recv().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Echo channel error: {}", e);
                break;
            }
        };

        let len = match &msg {
            Message::Text(text) => text.len(),
            Message::Binary(data) => data.len(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if len > max_message {
            debug!("Echo message of {} bytes over the {} byte limit", len, max_message);
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: "message too large".into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            break;
        }

        stats.record_echo_message();
        if let Err(e) = socket.send(msg).await {
            debug!("Echo reply failed: {}", e);
            break;
        }
    }
}
