use dbfw_admission::admission::AdmissionController;
use dbfw_admission::config::GateConfig;
use dbfw_admission::error::Result;
use dbfw_admission::listener::Listener;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting database firewall admission gate");

    if let Err(e) = run().await {
        error!("fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = GateConfig::from_env_validated()?;
    info!(
        "config: listen={}, connection_limit={}, per_ip_connection_limit={}, rate_limiter={:?}",
        config.listen_addr,
        config.connection.connection_limit,
        config.connection.per_ip_connection_limit,
        config.rate_limiter
    );

    let controller = Arc::new(AdmissionController::from_config(
        &config.connection,
        config.rate_limiter.as_ref(),
    ));

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

    let listener = Listener::bind(&config.listen_addr, controller).await?;
    info!("admission gate listening on {}", listener.local_addr());

    let mut listener_task = tokio::spawn({
        let shutdown_rx = shutdown_tx.subscribe();
        async move {
            if let Err(e) = listener.serve(shutdown_rx).await {
                error!("listener error: {}", e);
            }
        }
    });

    let mut listener_finished = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, initiating graceful shutdown");
        }
        res = &mut listener_task => {
            listener_finished = true;
            if let Err(err) = res {
                error!("listener task join error: {}", err);
            }
        }
    }

    let _ = shutdown_tx.send(());

    if !listener_finished {
        if let Err(err) = listener_task.await {
            error!("listener task join error: {}", err);
        }
    }

    info!("shutdown complete");
    Ok(())
}
