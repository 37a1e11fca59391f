use crate::{
    api,
    config::RouletteConfig,
    pool::{MemoryStore, PresenceStore},
    session::SessionController,
    ws::ws_handler,
};
use axum::{
    Router,
    http::{HeaderName, Method},
    routing::get,
};
use std::sync::Arc;
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

pub type RouletteController = SessionController<MemoryStore>;

/// Shared state handed to every handler.
#[derive(Debug)]
pub struct AppState<S: PresenceStore> {
    pub controller: Arc<SessionController<S>>,
    pub config: Arc<RouletteConfig>,
}

impl<S: PresenceStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: PresenceStore> AppState<S> {
    pub fn new(controller: Arc<SessionController<S>>, config: RouletteConfig) -> Self {
        Self {
            controller,
            config: Arc::new(config),
        }
    }
}

pub struct App {
    state: AppState<MemoryStore>,
    reaper: JoinHandle<()>,
}

impl App {
    /// Builds the store and controller and starts the lease reaper.
    /// Must be called from within a tokio runtime.
    pub fn new(config: RouletteConfig) -> Self {
        let store = Arc::new(MemoryStore::with_max_attempts(
            config.pool.max_transaction_attempts,
        ));
        let controller = Arc::new(SessionController::new(Arc::clone(&store)));
        let reaper = spawn_reaper(store, &config);

        Self {
            state: AppState::new(controller, config),
            reaper,
        }
    }

    pub fn state(&self) -> &AppState<MemoryStore> {
        &self.state
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::DELETE])
            // allow the Content-Type header and other headers needed for WebSockets
            .allow_headers([
                HeaderName::from_static("content-type"),
                HeaderName::from_static("upgrade"),
                HeaderName::from_static("connection"),
                HeaderName::from_static("sec-websocket-key"),
                HeaderName::from_static("sec-websocket-version"),
                HeaderName::from_static("sec-websocket-extensions"),
                HeaderName::from_static("sec-websocket-protocol"),
            ])
            .allow_origin(Any);

        Router::new()
            .route("/ws/roulette", get(ws_handler::<MemoryStore>))
            .route("/api/presence", get(api::presence::list_presence::<MemoryStore>))
            .route(
                "/api/presence/{participant_id}",
                get(api::presence::get_presence::<MemoryStore>)
                    .delete(api::presence::evict_participant::<MemoryStore>),
            )
            .route("/api/sessions", get(api::sessions::list_sessions::<MemoryStore>))
            .route("/healthz", get(api::health::<MemoryStore>))
            .layer(cors)
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.state.config.server.socket_addr();
        let listener = TcpListener::bind(addr).await?;

        info!("Server running on http://{}", addr);
        match self.serve(listener).await {
            Ok(_) => info!("Server shut down gracefully"),
            Err(e) => error!("Server error: {}", e),
        }

        Ok(())
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

/// Periodically applies queued disconnects and expires stale leases.
fn spawn_reaper(store: Arc<MemoryStore>, config: &RouletteConfig) -> JoinHandle<()> {
    let ttl = config.pool.lease_ttl();
    let period = config.pool.reap_interval();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            // Without a TTL only the disconnect queue is drained.
            match store.reap_expired(ttl.unwrap_or(std::time::Duration::MAX)).await {
                Ok(removed) if !removed.is_empty() => {
                    info!(count = removed.len(), "Reaped disconnected participants")
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Lease reaper stopping");
                    break;
                }
            }
        }
    })
}
