//! MCP server initialization for stdio and streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that open the
//! store and wire it into the MCP tool handler.

use anyhow::{Context, Result};
use rmcp::ServiceExt;

use crate::tools::ConvoTools;
use convostore::config::AppConfig;
use convostore::repository::CacheRepository;
use convostore::{Store, StoreOptions};

/// Shared setup: open (and migrate) the database, build the context cache repository.
fn setup_shared_state(config: &AppConfig) -> Result<(Store, CacheRepository)> {
    let db_path = config.resolved_db_path();
    let store = Store::open(&db_path, StoreOptions::from_config(config))
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(db = %db_path.display(), "database ready");

    let cache = CacheRepository::new(store.clone(), config.cache.clone());
    Ok((store, cache))
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: AppConfig) -> Result<()> {
    tracing::info!("starting convostore MCP server on stdio");

    let (store, cache) = setup_shared_state(&config)?;

    let tools = ConvoTools::new(store.clone(), cache);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    store.shutdown();
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over streamable HTTP transport.
pub async fn serve_http(config: AppConfig) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let bind_addr = format!("{host}:{port}");

    tracing::info!(addr = %bind_addr, "starting convostore MCP server on HTTP");

    let (store, cache) = setup_shared_state(&config)?;

    let service_store = store.clone();
    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(ConvoTools::new(service_store.clone(), cache.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    store.shutdown();
    Ok(())
}
