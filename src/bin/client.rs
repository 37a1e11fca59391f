use anyhow::Context;
use clap::Parser;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    signal::ctrl_c,
    sync::{Mutex, watch},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use url::Url;
use ws_roulette::session::message::{ClientMessage, ServerMessage};

// Type aliases for clarity
type WsWriter = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;
type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Parser)]
#[command(name = "roulette-client", about = "Join the pool and get matched with a random peer")]
struct Args {
    /// Base URL of the roulette server
    #[arg(short, long, default_value = "ws://127.0.0.1:8080/")]
    server: String,

    /// Participant id to register under; the server picks one if omitted
    #[arg(short, long)]
    participant_id: Option<String>,
}

fn connect_url(base: &str, participant_id: Option<&str>) -> anyhow::Result<Url> {
    let mut url = Url::parse(base)
        .with_context(|| format!("invalid server url '{base}'"))?
        .join("ws/roulette")?;
    if let Some(id) = participant_id {
        url.query_pairs_mut().append_pair("participant_id", id);
    }
    Ok(url)
}

fn parse_command(line: &str) -> Option<ClientMessage> {
    match line.trim() {
        "next" | "join" => Some(ClientMessage::Join),
        "match" => Some(ClientMessage::RequestMatch),
        "leave" | "quit" => Some(ClientMessage::Leave),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let url = connect_url(&args.server, args.participant_id.as_deref())?;
    tracing::info!("Connecting to {}", url);

    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .context("failed to connect")?;
    tracing::info!("Connected. Commands: next, match, quit");

    let (write, read) = ws_stream.split();
    let writer: WsWriter = Arc::new(Mutex::new(write));

    // Use a watch channel to notify tasks to shut down gracefully.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sender_handle = tokio::spawn(sender_task(
        writer.clone(),
        shutdown_rx.clone(),
        shutdown_tx.clone(),
    ));
    let receiver_handle = tokio::spawn(receiver_task(
        read,
        shutdown_rx.clone(),
        shutdown_tx.clone(),
    ));

    let mut shutdown_rx_main = shutdown_rx.clone();
    tokio::select! {
        result = sender_handle => tracing::debug!("Sender task finished: {:?}", result),
        result = receiver_handle => tracing::debug!("Receiver task finished: {:?}", result),
        _ = ctrl_c() => tracing::info!("Ctrl+C received, shutting down"),
        _ = shutdown_rx_main.changed() => {}
    }
    let _ = shutdown_tx.send(true);

    if let Err(e) = writer.lock().await.close().await {
        tracing::debug!("Error closing WebSocket writer: {}", e);
    }

    tracing::info!("Client exiting.");
    Ok(())
}

// --- Sender Task (Stdin) ---
async fn sender_task(
    writer: WsWriter,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            result = stdin.next_line() => {
                let line = match result {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::info!("Stdin closed.");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Error reading from stdin: {}", e);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let Some(command) = parse_command(&line) else {
                    println!("unknown command '{}', try next, match or quit", line.trim());
                    continue;
                };
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode command: {}", e);
                        continue;
                    }
                };
                if let Err(e) = writer.lock().await.send(Message::Text(text.into())).await {
                    tracing::error!("Failed to send message: {}", e);
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

// --- Receiver Task ---
async fn receiver_task(
    mut reader: WsReader,
    mut shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            message_result = reader.next() => {
                match message_result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerMessage>(text.as_str()) {
                            Ok(msg) => print_server_message(&msg),
                            Err(e) => tracing::warn!("Unrecognised server message: {} ({})", text.as_str(), e),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("Received Close frame: {:?}", frame);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    // tokio-tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("Error receiving message: {}", e);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    None => {
                        tracing::info!("WebSocket stream closed by server.");
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_server_message(msg: &ServerMessage) {
    match msg {
        ServerMessage::Welcome { participant_id } => println!("registered as {participant_id}"),
        ServerMessage::Matched { peer_id } => println!("matched with {peer_id}"),
        ServerMessage::NoPeerAvailable => println!("nobody else is online yet, type 'match' to retry"),
        ServerMessage::ChosenBy { peer_id } => println!("{peer_id} picked you"),
        ServerMessage::MatchFailed { reason, retryable } => {
            if *retryable {
                println!("match failed ({reason}), try again");
            } else {
                println!("match failed: {reason}");
            }
        }
        ServerMessage::Left => println!("left the pool"),
    }
}
