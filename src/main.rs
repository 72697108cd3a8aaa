use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use fahctl::{Controller, ControllerConfig, ControlError, DEFAULT_PORT, Frame, PowerLevel, sync_callback};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "fahctl")]
#[command(about = "Monitor and control a Folding@home client over its command server")]
#[command(version = "0.1.0")]
struct Cli {
    /// Address of the Folding@home client
    #[arg(long, default_value = "localhost", global = true)]
    host: String,

    /// Command server port
    #[arg(long, default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Command server password
    #[arg(long, global = true)]
    password: Option<String>,

    /// Read timeout in seconds
    #[arg(long, default_value = "15", global = true)]
    read_timeout: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream reports as JSON lines until interrupted
    Monitor {
        /// Seconds between two reports
        #[arg(long, default_value = "5")]
        update_rate: u64,

        /// Exit when the connection is lost instead of reconnecting
        #[arg(long)]
        no_reconnect: bool,
    },

    /// Pause all slots, or one slot
    Pause {
        #[arg(long)]
        slot: Option<u32>,
    },

    /// Unpause all slots, or one slot
    Unpause {
        #[arg(long)]
        slot: Option<u32>,
    },

    /// Ask the client to request a new work server assignment
    RequestWs,

    /// Shut the client down
    Shutdown,

    /// Set the folding power
    Power {
        #[arg(value_enum)]
        level: PowerArg,
    },
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum PowerArg {
    Light,
    Medium,
    Full,
}

impl From<PowerArg> for PowerLevel {
    fn from(value: PowerArg) -> Self {
        match value {
            PowerArg::Light => PowerLevel::Light,
            PowerArg::Medium => PowerLevel::Medium,
            PowerArg::Full => PowerLevel::Full,
        }
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_frame(frame: &Frame) {
    match serde_json::to_string(frame) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize frame: {}", e),
    }
}

async fn monitor(config: ControllerConfig) -> Result<()> {
    let controller = Controller::new(config);
    controller.register_callback(sync_callback(print_frame));
    controller.on_disconnect(|| tracing::warn!("Disconnected from command server"));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    match controller.run(cancel).await {
        Ok(()) | Err(ControlError::Cancelled) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn send_once(config: ControllerConfig, command: Commands) -> Result<()> {
    let timeout = config.connect_timeout;
    let controller = Controller::new(config);
    controller.try_connect(timeout).await?;

    match command {
        Commands::Pause { slot } => controller.pause(slot).await?,
        Commands::Unpause { slot } => controller.unpause(slot).await?,
        Commands::RequestWs => controller.request_work_server_assignment().await?,
        Commands::Shutdown => controller.shutdown().await?,
        Commands::Power { level } => controller.set_power_level(level.into()).await?,
        Commands::Monitor { .. } => return Err(anyhow!("monitor is not a one-shot command")),
    }

    controller.cleanup().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = ControllerConfig::new(cli.host)
        .with_port(cli.port)
        .with_read_timeout(Duration::from_secs(cli.read_timeout));
    if let Some(password) = cli.password {
        config = config.with_password(password);
    }

    match cli.command {
        Commands::Monitor {
            update_rate,
            no_reconnect,
        } => {
            let config = config
                .with_update_rate(update_rate)
                .with_reconnect(!no_reconnect);
            monitor(config).await
        }
        command => send_once(config, command).await,
    }
}
