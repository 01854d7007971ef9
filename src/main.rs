use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use parley::config::Settings;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Streaming multimodal session gateway")]
struct Cli {
    /// TOML settings file
    #[arg(long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Login API, media sessions and the service pool
    Gateway(GatewayArgs),
    /// Bridge in front of one inference engine
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct GatewayArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Start in duplex mode
    #[arg(long)]
    duplex: bool,
    #[arg(long, env = "MODEL_DIR")]
    model_dir: Option<PathBuf>,
    #[arg(long, env = "ENGINE_BINARY")]
    engine_binary: Option<PathBuf>,
    #[arg(long, env = "ENGINE_PORT")]
    engine_port: Option<u16>,
    /// Gateway base URL to register with
    #[arg(long, env = "REGISTER_URL")]
    register_url: Option<String>,
    #[arg(long, env = "ADVERTISE_IP")]
    advertise_ip: Option<String>,
    #[arg(long, env = "GPU_MEMORY_CHECK")]
    gpu_memory_check: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        on_signal.cancel();
    });

    match cli.command {
        Command::Gateway(args) => {
            if let Some(host) = args.host {
                settings.server.host = host;
            }
            if let Some(port) = args.port {
                settings.server.port = port;
            }
            settings.validate()?;
            info!("Starting parley gateway");
            parley::gateway::run(settings, shutdown).await?;
        }
        Command::Worker(args) => {
            let worker = &mut settings.worker;
            if let Some(host) = args.host {
                worker.host = host;
            }
            if let Some(port) = args.port {
                worker.port = port;
            }
            if args.duplex {
                worker.duplex = true;
            }
            if let Some(dir) = args.model_dir {
                worker.model_dir = dir;
            }
            if args.engine_binary.is_some() {
                worker.engine_binary = args.engine_binary;
            }
            if args.engine_port.is_some() {
                worker.engine_port = args.engine_port;
            }
            if args.register_url.is_some() {
                worker.register_url = args.register_url;
            }
            if args.advertise_ip.is_some() {
                worker.advertise_ip = args.advertise_ip;
            }
            if let Some(enabled) = args.gpu_memory_check {
                worker.gpu_check_enabled = enabled;
            }
            settings.validate()?;
            info!(duplex = settings.worker.duplex, "Starting parley worker");
            parley::worker::run(settings.worker, shutdown).await?;
        }
    }

    Ok(())
}
