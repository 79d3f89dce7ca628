//! Manages the lifecycle of one event-stream WebSocket.

use crate::{handlers::ApiError, state::AppState};
use anyhow::Result;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use joinly_core::{events::WebSocketMessage, hub::Scope};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Upgrades to a stream of events for a single agent.
#[utoipa::path(
    get,
    path = "/ws/agents/{id}",
    responses(
        (status = 101, description = "Switching to the agent event stream"),
        (status = 404, description = "Agent not found", body = crate::models::ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Agent ID")
    )
)]
pub async fn ws_agent_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let agent = state.supervisor.get(&id)?;
    let greeting = WebSocketMessage::status(&agent.id, agent.status);
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state, Scope::Agent(agent.id), Some(greeting))
    }))
}

/// Upgrades to a stream of every event on the hub.
#[utoipa::path(
    get,
    path = "/ws/session",
    responses(
        (status = 101, description = "Switching to the session event stream")
    )
)]
pub async fn ws_session_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state, Scope::Session, None))
}

/// Forwards hub events to the client until either side goes away.
///
/// The client is not expected to send anything; inbound frames are only read
/// to notice a close.
#[instrument(name = "ws_events", skip_all, fields(subscriber_id, scope = ?scope))]
async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    scope: Scope,
    greeting: Option<WebSocketMessage>,
) {
    let hub = state.supervisor.hub().clone();
    let mut subscription = hub.subscribe(scope).await;
    tracing::Span::current().record("subscriber_id", subscription.id);
    info!("Event stream connected");

    let (mut socket_tx, mut socket_rx) = socket.split();
    if let Some(greeting) = greeting {
        if send_msg(&mut socket_tx, &greeting).await.is_err() {
            hub.unsubscribe(subscription.id).await;
            return;
        }
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    info!("Hub closed the subscription");
                    break;
                };
                if let Err(e) = send_msg(&mut socket_tx, &event).await {
                    debug!(error = ?e, "Failed to forward event, closing stream");
                    break;
                }
            }
            inbound = socket_rx.next() => match inbound {
                None | Some(Ok(Message::Close(_))) => {
                    info!("Client closed the event stream");
                    break;
                }
                Some(Err(e)) => {
                    warn!("Error receiving from client WebSocket: {:?}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(subscription.id).await;
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send an event to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: &WebSocketMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
