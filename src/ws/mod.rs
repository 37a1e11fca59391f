use crate::{
    pool::{ParticipantId, PresenceStore},
    server::AppState,
    session::{
        SessionController, SessionEvent,
        message::{ClientMessage, ServerMessage},
    },
};
use axum::{
    extract::{
        Query, State,
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
    time::Instant,
};
use uuid::Uuid;

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub participant_id: Option<String>,
}

/// Axum WebSocket handler. One connection is one presence session.
pub async fn ws_handler<S: PresenceStore>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<S>>,
    Query(params): Query<ConnectParams>,
) -> impl IntoResponse {
    let participant_id = params
        .participant_id
        .filter(|id| !id.trim().is_empty())
        .map(ParticipantId::from)
        .unwrap_or_else(|| Uuid::new_v4().into());
    tracing::info!(%participant_id, "New WebSocket connection attempt");

    ws.on_upgrade(move |socket| handle_socket(socket, state, participant_id))
}

/// Ends the session when the connection handler goes away, however it exits,
/// unless a newer connection for the same participant has taken it over.
struct SessionGuard<S: PresenceStore> {
    controller: Arc<SessionController<S>>,
    participant_id: ParticipantId,
    connection: u64,
}

impl<S: PresenceStore> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        let controller = Arc::clone(&self.controller);
        let participant_id = self.participant_id.clone();
        let connection = self.connection;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%participant_id, "No runtime to end session on; relying on lease expiry");
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = controller.end_connection(&participant_id, connection).await {
                tracing::warn!(%participant_id, error = %e, "Error ending session after disconnect");
            }
        });
    }
}

async fn send_message(sender: &WsSender, msg: ServerMessage) -> bool {
    let text: Utf8Bytes = match msg.try_into() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to serialize server message: {}", e);
            return true;
        }
    };
    sender.lock().await.send(Message::Text(text)).await.is_ok()
}

/// Handles the actual WebSocket communication for a single participant.
async fn handle_socket<S: PresenceStore>(
    socket: WebSocket,
    state: AppState<S>,
    participant_id: ParticipantId,
) {
    let controller = Arc::clone(&state.controller);
    let heartbeat_interval = state.config.server.heartbeat_interval();
    let heartbeat_timeout = state.config.server.heartbeat_timeout();

    let (ws_sender, mut ws_receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(ws_sender));

    // Subscribe before joining so a pick that lands right after the join is
    // still delivered.
    let (connection, mut events) = controller.attach(&participant_id).await;
    let _guard = SessionGuard {
        controller: Arc::clone(&controller),
        participant_id: participant_id.clone(),
        connection,
    };

    if !send_message(
        &ws_sender,
        ServerMessage::Welcome {
            participant_id: participant_id.clone(),
        },
    )
    .await
    {
        return;
    }

    let reply = match controller.start_session(&participant_id).await {
        Ok(outcome) => ServerMessage::from_outcome(outcome),
        Err(e) if e.is_connection_lost() => {
            tracing::error!(%participant_id, "Presence store unavailable, closing connection");
            send_message(&ws_sender, ServerMessage::from_error(&e)).await;
            return;
        }
        Err(e) => ServerMessage::from_error(&e),
    };
    if !send_message(&ws_sender, reply).await {
        return;
    }

    tracing::info!(%participant_id, "WebSocket session established");

    let last_pong_received = Arc::new(Mutex::new(Instant::now()));

    // --- Task 1: Forward controller events to the WebSocket ---
    let event_sender = Arc::clone(&ws_sender);
    let event_participant = participant_id.clone();
    let mut event_task: JoinHandle<()> = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::ChosenBy { peer }) => {
                    tracing::debug!(participant_id = %event_participant, %peer, "Chosen as match");
                    if !send_message(&event_sender, ServerMessage::ChosenBy { peer_id: peer }).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(participant_id = %event_participant, skipped, "Event receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // --- Task 2: Receive messages from the WebSocket ---
    let recv_controller = Arc::clone(&controller);
    let recv_sender = Arc::clone(&ws_sender);
    let recv_last_pong = Arc::clone(&last_pong_received);
    let recv_participant = participant_id.clone();
    let mut recv_task: JoinHandle<()> = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            let msg = match msg_result {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(participant_id = %recv_participant, "WebSocket receive error: {}", e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => {
                    let client_msg = match ClientMessage::try_from(text) {
                        Ok(client_msg) => client_msg,
                        Err(e) => {
                            tracing::warn!(participant_id = %recv_participant, "Failed to parse client message: {}", e);
                            continue;
                        }
                    };

                    let reply = match client_msg {
                        ClientMessage::Join => recv_controller.start_session(&recv_participant).await,
                        ClientMessage::RequestMatch => {
                            recv_controller.request_match(&recv_participant).await
                        }
                        ClientMessage::Leave => {
                            if let Err(e) = recv_controller.end_connection(&recv_participant, connection).await {
                                tracing::warn!(participant_id = %recv_participant, error = %e, "Leave failed");
                            }
                            send_message(&recv_sender, ServerMessage::Left).await;
                            break;
                        }
                    };

                    let (reply, fatal) = match reply {
                        Ok(outcome) => (ServerMessage::from_outcome(outcome), false),
                        Err(e) => (ServerMessage::from_error(&e), e.is_connection_lost()),
                    };
                    if !send_message(&recv_sender, reply).await || fatal {
                        break;
                    }
                }
                Message::Binary(bin) => {
                    tracing::warn!(participant_id = %recv_participant, "Received unexpected binary message ({} bytes)", bin.len());
                }
                Message::Ping(_) => {
                    // Axum answers pings itself.
                    tracing::trace!(participant_id = %recv_participant, "Received Ping from client");
                }
                Message::Pong(_) => {
                    *recv_last_pong.lock().await = Instant::now();
                    if let Err(e) = recv_controller.store().touch(&recv_participant).await {
                        tracing::warn!(participant_id = %recv_participant, error = %e, "Failed to refresh lease");
                    }
                }
                Message::Close(close_frame) => {
                    tracing::info!(participant_id = %recv_participant, "Received Close frame: {:?}", close_frame);
                    break;
                }
            }
        }
        tracing::debug!(participant_id = %recv_participant, "WebSocket receive task loop finished.");
    });

    // --- Task 3: Server-side heartbeat ---
    let heartbeat_sender = Arc::clone(&ws_sender);
    let heartbeat_last_pong = Arc::clone(&last_pong_received);
    let heartbeat_participant = participant_id.clone();
    let mut heartbeat_task: JoinHandle<&'static str> = tokio::spawn(async move {
        heartbeat(
            heartbeat_sender,
            heartbeat_last_pong,
            heartbeat_interval,
            heartbeat_timeout,
            &heartbeat_participant,
        )
        .await
    });

    tokio::select! {
        _ = &mut event_task => {
            recv_task.abort();
            heartbeat_task.abort();
        },
        res = &mut recv_task => {
            if let Err(e) = res {
                tracing::error!(%participant_id, "WebSocket receive task panicked: {}", e);
            }
            event_task.abort();
            heartbeat_task.abort();
        },
        res = &mut heartbeat_task => {
            match res {
                Ok(reason) => tracing::info!(%participant_id, "Heartbeat task stopped: {}", reason),
                Err(e) => tracing::error!(%participant_id, "Heartbeat task panicked: {}", e),
            }
            event_task.abort();
            recv_task.abort();
        }
    }

    if let Err(e) = ws_sender.lock().await.close().await {
        tracing::debug!(%participant_id, "Ignoring error closing WebSocket sender: {}", e);
    }

    // `_guard` ends the session when it drops here.
    tracing::info!(%participant_id, "Participant disconnected");
}

async fn heartbeat(
    sender: WsSender,
    last_pong: Arc<Mutex<Instant>>,
    interval: Duration,
    timeout: Duration,
    participant_id: &ParticipantId,
) -> &'static str {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if last_pong.lock().await.elapsed() > timeout {
            tracing::warn!(%participant_id, "Heartbeat timeout: Pong not received recently. Disconnecting.");
            return "Heartbeat Timeout";
        }

        tracing::trace!(%participant_id, "Sending Ping to client");
        if let Err(e) = sender.lock().await.send(Message::Ping(Vec::new().into())).await {
            tracing::warn!(%participant_id, "Failed to send Ping: {}. Client likely disconnected.", e);
            return "Failed to send Ping";
        }
    }
}
