use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::host::ScoutHostState;
use crate::ws::types::{BroadcastMessage, ClientId, WsError};

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ScoutHostState>>,
) -> Response {
    ws.on_upgrade(move |socket| {
        let client_id = ClientId::new();
        handle_socket(socket, state).instrument(info_span!("ws_client", client = %client_id))
    })
}

fn encode(message: &BroadcastMessage) -> Result<Message, WsError> {
    Ok(Message::Text(serde_json::to_string(message)?.into()))
}

/// Sends the full snapshot, then every patch until the client leaves or the
/// service shuts down. A client that lags gets a fresh snapshot and carries on.
async fn handle_socket(socket: WebSocket, state: Arc<ScoutHostState>) {
    let (mut sink, mut stream) = socket.split();
    let (snapshot, mut receiver) = state.orchestrator.snapshot_store().subscribe();
    info!("WebSocket client connected");

    let initial = match encode(&BroadcastMessage::Snapshot { snapshot }) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Failed to encode initial snapshot");
            return;
        }
    };
    if sink.send(initial).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket receive error");
                    break;
                }
            },
            outgoing = receiver.recv() => {
                let message = match outgoing {
                    Ok(m) => m,
                    Err(WsError::Lagged(_)) => {
                        let snapshot = state.orchestrator.snapshot_store().resubscribe(&mut receiver);
                        debug!("Re-syncing lagged client with a full snapshot");
                        BroadcastMessage::Snapshot { snapshot }
                    }
                    Err(_) => break,
                };
                let shutdown = matches!(message, BroadcastMessage::Shutdown);
                match encode(&message) {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode broadcast"),
                }
                if shutdown {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
