//! tally entry point: one device session in one room.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, routing::get};
use tally_api::{AppState, router as api_router};
use tally_common::{Config, config::BackendKind};
use tally_core::{
    BroadcasterService, ChangeFeedService, FileLockStore, InMemoryBroadcaster,
    InMemoryVoteBackend, LockStoreService, RoomVoteStore, SyncOptions, SyncReconciler,
    VoteBackendService,
};
use tally_db::{VoteChangeListener, repositories::VoteRepository};
use tally_pubsub::RedisPubSub;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

/// Remote collaborators of the session and the connections behind them.
struct Remote {
    backend: VoteBackendService,
    change_feed: ChangeFeedService,
    broadcaster: BroadcasterService,
    connections: Option<(Arc<VoteChangeListener>, Arc<RedisPubSub>)>,
}

impl Remote {
    async fn connect(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        match config.backend {
            BackendKind::Memory => {
                warn!("Using the in-memory backend; votes are not shared with other processes");
                let backend = InMemoryVoteBackend::new();
                Ok(Self {
                    backend: Arc::new(backend.clone()),
                    change_feed: Arc::new(backend),
                    broadcaster: Arc::new(InMemoryBroadcaster::new()),
                    connections: None,
                })
            }
            BackendKind::Postgres => {
                let db = tally_db::init(config).await?;
                info!("Connected to database");

                info!("Running database migrations...");
                tally_db::migrate(&db).await?;
                info!("Migrations completed");

                let listener = Arc::new(VoteChangeListener::connect(&config.database.url).await?);

                info!("Connecting to Redis...");
                let pubsub =
                    Arc::new(RedisPubSub::new(&config.redis.url, config.redis.prefix.clone()).await?);

                Ok(Self {
                    backend: Arc::new(VoteRepository::new(Arc::new(db))),
                    change_feed: listener.clone(),
                    broadcaster: pubsub.clone(),
                    connections: Some((listener, pubsub)),
                })
            }
        }
    }

    async fn shutdown(self) {
        if let Some((listener, pubsub)) = self.connections {
            listener.shutdown().await;
            if let Err(e) = pubsub.shutdown().await {
                warn!(error = %e, "Redis Pub/Sub shutdown failed");
            }
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=info,tower_http=info".into()),
        )
        .init();

    info!("Starting tally...");

    // Load configuration
    let config = Config::load()?;
    let room = config.room.resolve_id()?;
    info!(room = %room, backend = ?config.backend, "Joining room");

    let remote = Remote::connect(&config).await?;
    let locks: LockStoreService = Arc::new(FileLockStore::new(&config.room.lock_path));

    let store = Arc::new(RoomVoteStore::new(
        room,
        remote.backend.clone(),
        remote.broadcaster.clone(),
        locks,
    ));
    let reconciler = SyncReconciler::start(
        store.clone(),
        remote.change_feed.clone(),
        remote.broadcaster.clone(),
        SyncOptions::from(&config.sync),
    )
    .await?;

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .nest("/api", api_router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(AppState::new(store));

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reconciler.shutdown().await;
    remote.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
