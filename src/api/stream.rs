//! Observer push: every emitted position update, as JSON text frames.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::handlers::ApiState;

/// GET /api/v1/stream
pub async fn ws_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, state))
}

async fn handle_observer(mut socket: WebSocket, state: ApiState) {
    // Subscribe before anything else so no update is missed after the upgrade.
    let mut updates = state.reconciler.subscribe();
    info!(observers = state.reconciler.observer_count(), "Observer connected");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => {
                    let text = match serde_json::to_string(&update) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to encode position update");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Observer lagging, skipping updates");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Observer disconnected");
}
