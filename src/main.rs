use std::sync::Arc;

use lattice_agent::{api, config, process, state};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load_config(&config::config_path()).await?;
    let bind_address = cfg.agent.bind_address.clone();

    let supervisor = Arc::new(
        process::Supervisor::load(
            cfg.agent.data_directory.clone(),
            cfg.process.clone(),
            cfg.console.clone(),
        )
        .await?,
    );

    // Kill any orphaned servers from a previous crash
    process::kill_orphaned_servers(&supervisor.server_roots()).await;

    let state = state::AppState::new(cfg, supervisor.clone());
    let relay = state.fanout.spawn_relay();

    let app = api::router(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down servers...");
    state.monitor.shutdown();
    supervisor.shutdown().await;
    relay.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
