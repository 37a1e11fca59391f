use std::{net::SocketAddr, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpListener, net::TcpStream, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use ws_roulette::{
    config::RouletteConfig,
    pool::{MemoryStore, ParticipantId, PresenceStore},
    server::{App, AppState},
    session::message::ServerMessage,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (SocketAddr, AppState<MemoryStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = App::new(RouletteConfig::default());
    let state = app.state().clone();
    tokio::spawn(async move { app.serve(listener).await });
    (addr, state)
}

async fn connect(addr: SocketAddr, id: &str) -> Client {
    let url = format!("ws://{addr}/ws/roulette?participant_id={id}");
    let (client, _) = connect_async(url.as_str()).await.unwrap();
    client
}

async fn next_message(client: &mut Client) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for server message")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(client: &mut Client, json: &str) {
    client.send(Message::Text(json.into())).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_clients_are_matched_over_websocket() {
    let (addr, _state) = start_server().await;

    let mut alice = connect(addr, "alice").await;
    assert_eq!(
        next_message(&mut alice).await,
        ServerMessage::Welcome { participant_id: ParticipantId::from("alice") }
    );
    assert_eq!(next_message(&mut alice).await, ServerMessage::NoPeerAvailable);

    let mut bob = connect(addr, "bob").await;
    assert_eq!(
        next_message(&mut bob).await,
        ServerMessage::Welcome { participant_id: ParticipantId::from("bob") }
    );
    assert_eq!(
        next_message(&mut bob).await,
        ServerMessage::Matched { peer_id: ParticipantId::from("alice") }
    );
    assert_eq!(
        next_message(&mut alice).await,
        ServerMessage::ChosenBy { peer_id: ParticipantId::from("bob") }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leave_closes_the_connection_and_empties_the_pool() {
    let (addr, state) = start_server().await;

    let mut carol = connect(addr, "carol").await;
    next_message(&mut carol).await;
    assert_eq!(next_message(&mut carol).await, ServerMessage::NoPeerAvailable);

    send_json(&mut carol, r#"{"type":"Leave"}"#).await;
    assert_eq!(next_message(&mut carol).await, ServerMessage::Left);

    let pool = state.controller.store().snapshot().await.unwrap();
    assert!(pool.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_match_retries_after_someone_arrives() {
    let (addr, _state) = start_server().await;

    let mut dave = connect(addr, "dave").await;
    next_message(&mut dave).await;
    assert_eq!(next_message(&mut dave).await, ServerMessage::NoPeerAvailable);

    // erin joins while dave is waiting, and is matched with dave.
    let mut erin = connect(addr, "erin").await;
    next_message(&mut erin).await;
    assert_eq!(
        next_message(&mut erin).await,
        ServerMessage::Matched { peer_id: ParticipantId::from("dave") }
    );
    assert_eq!(
        next_message(&mut dave).await,
        ServerMessage::ChosenBy { peer_id: ParticipantId::from("erin") }
    );

    // dave was claimed; joining again re-enters the pool and picks erin.
    send_json(&mut dave, r#"{"type":"Join"}"#).await;
    assert_eq!(
        next_message(&mut dave).await,
        ServerMessage::Matched { peer_id: ParticipantId::from("erin") }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_survives_the_old_socket_closing() {
    let (addr, state) = start_server().await;
    let alice = ParticipantId::from("alice");

    let mut first = connect(addr, "alice").await;
    next_message(&mut first).await;
    assert_eq!(next_message(&mut first).await, ServerMessage::NoPeerAvailable);

    let mut second = connect(addr, "alice").await;
    next_message(&mut second).await;
    assert_eq!(next_message(&mut second).await, ServerMessage::NoPeerAvailable);

    first.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pool = state.controller.store().snapshot().await.unwrap();
    assert!(pool.contains_key(&alice));
    let sessions = state.controller.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].participant_id, alice);

    // The live socket is still drawable and still hears about it.
    let mut bob = connect(addr, "bob").await;
    next_message(&mut bob).await;
    assert_eq!(
        next_message(&mut bob).await,
        ServerMessage::Matched { peer_id: alice.clone() }
    );
    assert_eq!(
        next_message(&mut second).await,
        ServerMessage::ChosenBy { peer_id: ParticipantId::from("bob") }
    );
}
