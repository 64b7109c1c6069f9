//! Tandem node daemon.
//!
//! Listens for peer sessions over TCP, syncs with configured peers on an
//! interval and serves health and status over HTTP.

use std::sync::Arc;

use tandem_engine::{HybridClock, Replica};
use tandem_node::config::Config;
use tandem_node::transport::TcpTransport;
use tandem_node::{db, routes, schema, AppState, SyncNode};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tandem_node=debug,tandem_engine=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let schema = schema::load(config.schema_path.as_deref())?;

    tracing::info!(
        node_id = %config.node_id,
        schema_version = schema.version,
        peers = config.peers.len(),
        "starting Tandem node"
    );

    let pool = db::create_pool(&config.database_url, 5).await?;
    tracing::info!("running database migrations");
    db::run_migrations(&pool).await?;

    let clock = HybridClock::new(config.node_id.clone()).with_max_drift(config.max_clock_drift_ms);
    let replica = Replica::with_clock(schema, clock);

    let (peer_addr, incoming) = TcpTransport::listen(&config.listen_addr).await?;
    tracing::info!(%peer_addr, "accepting peer sessions");
    let transport = Arc::new(TcpTransport::new(config.peers.clone()));

    let node = Arc::new(SyncNode::open(replica, pool, transport, config.session.clone()).await?);
    tokio::spawn(Arc::clone(&node).serve(incoming));
    tokio::spawn(Arc::clone(&node).run_anti_entropy(config.sync_interval));

    let app = routes::create_router(AppState { node })
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(&config.status_addr).await?;
    tracing::info!(addr = %config.status_addr, "status server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
