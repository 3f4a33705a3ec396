//! Minimal runnable harness: wires a `ConfigService`, `UpstreamAdapter`,
//! and `Supervisor` together and runs the reconciliation loop until a
//! shutdown signal arrives. No HTTP surface — that's an external
//! collaborator's job (spec §1). Shaped after the teacher's `main.rs`
//! startup/shutdown sequencing, with the axum/DB/CORS layers removed.

use std::sync::Arc;

use mcp_proxy_core::config::ConfigService;
use mcp_proxy_core::adapter::UpstreamAdapter;
use mcp_proxy_core::model::ConfigSnapshot;
use mcp_proxy_core::state_view::StateView;
use mcp_proxy_core::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_proxy_core::init_tracing();
    dotenvy::dotenv().ok();

    let config_path = std::env::var("MCP_PROXY_CONFIG").ok();

    let initial = match &config_path {
        Some(path) => match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!("failed to parse {}: {} — starting from an empty config", path, e);
                ConfigSnapshot::empty(Some(path.clone()))
            }),
            Err(e) => {
                tracing::warn!("failed to read {}: {} — starting from an empty config", path, e);
                ConfigSnapshot::empty(Some(path.clone()))
            }
        },
        None => ConfigSnapshot::empty(None),
    };

    let config = Arc::new(ConfigService::new(initial));
    let adapter = Arc::new(UpstreamAdapter::new());
    let state_view = Arc::new(StateView::new());
    let supervisor = Supervisor::new(config.clone(), adapter.clone(), state_view.clone());

    supervisor.spawn_background_loops();
    supervisor.spawn_event_driven_refresh();

    tracing::info!("mcp-proxy-core harness started");

    shutdown_signal().await;

    tracing::info!("shutdown signal received, draining supervisor");
    supervisor.shutdown();
    adapter.close().await;
    config.close().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
