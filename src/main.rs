use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tuya_local::config::Config;
use tuya_local::{DeviceClient, QueryOptions, SetRequest};

#[derive(Parser)]
#[command(version, about = "Control Tuya devices on the local network")]
struct Cli {
    /// Device name or id from the devices file.
    #[arg(short, long)]
    device: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read device state.
    Query {
        /// Print the full response.
        #[arg(long)]
        schema: bool,
        /// Print a single data point.
        #[arg(long)]
        dps: Option<String>,
    },
    /// Write a data point. VALUE is parsed as JSON, falling back to a string.
    Set {
        #[arg(long)]
        dps: Option<String>,
        value: String,
    },
    On,
    Off,
    Toggle,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let device = match config.device(cli.device.as_deref()) {
        Ok(d) => d.clone(),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Using device {} ({}) at {}",
        device.name,
        device.identity.id,
        device.identity.ip.as_deref().unwrap_or("<no ip>"),
    );

    let cancel = CancellationToken::new();
    let client = match DeviceClient::new(device.identity, config.client) {
        Ok(c) => c.with_cancellation(cancel.clone()),
        Err(e) => {
            error!("Invalid device {}: {}", device.name, e);
            std::process::exit(1);
        }
    };

    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, cancelling");
            watcher.cancel();
        }
    });

    let result = match cli.command {
        Command::Query { schema, dps } => client.query(&QueryOptions { schema, dps }).await,
        Command::Set { dps, value } => {
            let value = parse_value(&value);
            let request = match dps {
                Some(index) => SetRequest::SetByIndex { index, value },
                None => SetRequest::SetDefault { value },
            };
            client.update(request).await.map(|()| Value::Bool(true))
        }
        Command::On => client.on().await,
        Command::Off => client.off().await,
        Command::Toggle => client.toggle().await,
    };

    match result {
        Ok(value) => println!("{value}"),
        Err(e) => {
            error!("Request to {} failed: {}", device.name, e);
            std::process::exit(1);
        }
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
