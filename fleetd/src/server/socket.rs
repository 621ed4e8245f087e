//! Provisioning push channel
//!
//! One socket can follow several instances. Each subscription gets the
//! acknowledgement, the buffered log backlog and the current snapshot, then
//! live events from the hub in order.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use openapi_server::{ClientEvent, ErrorResponse, ServerEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::state::ServerState;

/// Events queued per socket before forwarders wait on the writer
const OUTBOX_CAPACITY: usize = 256;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerEvent>(OUTBOX_CAPACITY);
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        let error = ServerEvent::Error(ErrorResponse {
                            error_type: "VALIDATION".to_string(),
                            message: format!("malformed event: {}", e),
                            suggestions: Vec::new(),
                        });
                        if send_event(&mut socket, &error).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };
                match event {
                    ClientEvent::Subscribe { instance_id } => {
                        if let Some(previous) = forwarders.remove(&instance_id) {
                            previous.abort();
                        }
                        let Some(subscription) = state.progress.subscribe(&instance_id).await else {
                            warn!("Progress hub is gone; closing socket");
                            break;
                        };
                        debug!(instance_id = %instance_id, "Socket subscribed");

                        let mut opening = vec![
                            ServerEvent::Subscribed { instance_id: instance_id.clone() },
                            ServerEvent::ProvisioningLogsBuffer {
                                instance_id: instance_id.clone(),
                                logs: subscription.backlog,
                            },
                        ];
                        if let Some(snapshot) = subscription.snapshot {
                            opening.push(ServerEvent::Progress(snapshot));
                        }
                        let mut failed = false;
                        for event in &opening {
                            if send_event(&mut socket, event).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }

                        let handle = tokio::spawn(forward(subscription.events, outbox_tx.clone()));
                        forwarders.insert(instance_id, handle);
                    }
                    ClientEvent::Unsubscribe { instance_id } => {
                        if let Some(handle) = forwarders.remove(&instance_id) {
                            handle.abort();
                            debug!(instance_id = %instance_id, "Socket unsubscribed");
                        }
                    }
                }
            }
            Some(event) = outbox_rx.recv() => {
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    for (_, handle) in forwarders {
        handle.abort();
    }
}

/// Copy hub events into the socket outbox until either side closes
async fn forward(mut events: broadcast::Receiver<ServerEvent>, outbox: mpsc::Sender<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if outbox.send(event).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Socket subscriber lagged, {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode progress event: {}", e);
            return Ok(());
        }
    };
    socket.send(Message::Text(text.into())).await
}
