use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};

use conclave_core::logging;
use conclave_hub::{HubConfig, HubProcess, attach_handler, ws};

#[tokio::main]
async fn main() -> Result<()> {
    let config = HubConfig::load()?;
    let _log_guard = match &config.log_dir {
        Some(dir) => Some(logging::init_logging_to_dir(dir, &config.log_filter)?),
        None => {
            logging::init_logging(&config.log_filter)?;
            None
        }
    };

    info!(
        "Starting conclave-hub v{} on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr
    );

    let hub = HubProcess::start(config.coordination.clone());
    hub.on_attach(attach_handler(|id| info!("Client attached as {id}")));

    let (shutdown, _) = broadcast::channel(1);
    let listener_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for interrupt, run until killed: {e}");
            std::future::pending::<()>().await;
        }
        info!("Interrupt received");
        let _ = shutdown.send(());
    });

    let served = ws::serve(config.listen_addr, Arc::clone(&hub), listener_shutdown).await;
    hub.stop();
    served?;
    info!("conclave-hub stopped");
    Ok(())
}
