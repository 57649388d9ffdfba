use std::net::SocketAddr;
use tmdb_edge::{cache::open_edge_cache, config::ProxyConfig, router, AppState};

/// tmdb-edge server entry point.
///
/// Initializes tracing, loads and validates configuration, opens the edge
/// cache and serves the proxy.
///
/// # Configuration
/// Environment variables:
/// - `PORT`: HTTP listen port (default: 8080)
/// - `EDGE_CACHE_DIR`: sled directory for images (default: in-memory)
/// - `RUST_LOG`: Logging verbosity (default: "tmdb_edge=debug,tower_http=debug")
///
/// See `ProxyConfig::from_env` for the upstream and cache settings.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tmdb_edge=debug,tower_http=debug".into()),
        )
        .init();

    tracing::info!("Starting tmdb-edge");

    let cfg = ProxyConfig::from_env()?;
    cfg.validate()?;

    // Bind to 0.0.0.0 for external access (required for containerized deployment)
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));

    let edge_cache = open_edge_cache(&cfg)?;
    let state = AppState::new(cfg, edge_cache)?;
    let app = router(state);
    tracing::info!("Server listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
