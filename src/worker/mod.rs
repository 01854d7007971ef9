//! Backend bridge fronting one inference engine

pub mod compose;
pub mod driver;
pub mod engine;
pub mod multiplex;
pub mod process;
pub mod server;

pub use driver::{Driver, PrefillRoute};
pub use engine::{EngineClient, StreamEngine};
pub use process::{EngineProcess, MemoryProbe, NvidiaSmi, Supervisor};
pub use server::{main_router, side_router, WorkerState};

use crate::config::WorkerConfig;
use crate::Result;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start the engine (if managed), serve both listeners and register with
/// the gateway. Returns after `shutdown` fires.
pub async fn run(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    std::fs::create_dir_all(&config.output_dir)?;
    std::fs::create_dir_all(&config.temp_dir)?;

    let engine = EngineClient::new(
        config.engine_url(),
        Duration::from_secs(config.prefill_timeout),
        Duration::from_secs(config.decode_timeout),
    )?;
    let driver = Arc::new(Driver::new(Arc::new(engine), config.clone()));
    let process = EngineProcess::from_config(&config)?;
    let supervisor = Arc::new(Supervisor::new(driver, process, Arc::new(NvidiaSmi)));
    supervisor.start_engine().await?;

    let state = WorkerState::new(supervisor.clone());
    let main_addr = format!("{}:{}", config.host, config.port);
    let side_addr = format!("{}:{}", config.host, config.side_port());
    let main_listener = tokio::net::TcpListener::bind(&main_addr).await?;
    let side_listener = tokio::net::TcpListener::bind(&side_addr).await?;
    info!("Worker listening on http://{} (control on {})", main_addr, side_addr);

    if let Some(register_url) = config.register_url.clone() {
        let registration = server::registration(&config);
        tokio::spawn(async move {
            if let Err(e) = server::register_with_gateway(&register_url, &registration).await {
                error!("Gateway registration failed: {}", e);
            }
        });
    } else {
        warn!("No register_url configured, the gateway must register this worker");
    }

    let main = axum::serve(main_listener, main_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let side = axum::serve(side_listener, side_router(state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();

    let result = tokio::try_join!(main, side);
    supervisor.stop_engine().await;
    result?;
    info!("Worker stopped");
    Ok(())
}
