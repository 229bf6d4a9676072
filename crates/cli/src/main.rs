use clap::{Parser, Subcommand};
use gateway_client::config::{self, ClientConfig};
use gateway_client::{ClientBuilder, GatewayClient};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gwctl")]
#[command(about = "Gateway RPC client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default client config file if none exists.
    Init {
        /// Config file path (default: GATEWAY_CLIENT_CONFIG or ~/.gateway-client/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Connect, send one request, and print the response payload as JSON.
    Call {
        /// RPC method name (e.g. "status").
        method: String,

        /// Request params as a JSON value.
        #[arg(long, short, value_name = "JSON")]
        params: Option<String>,

        /// Config file path (default: GATEWAY_CLIENT_CONFIG or ~/.gateway-client/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway WebSocket URL (overrides config).
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// How long to wait for the handshake before giving up.
        #[arg(long, default_value_t = 5000, value_name = "MS")]
        wait_ms: u64,
    },

    /// Stay connected and print every gateway event until Ctrl-C.
    Watch {
        /// Config file path (default: GATEWAY_CLIENT_CONFIG or ~/.gateway-client/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway WebSocket URL (overrides config).
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("gwctl {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Call {
            method,
            params,
            config,
            url,
            wait_ms,
        }) => {
            if let Err(e) = run_call(config, url, method, params, wait_ms).await {
                log::error!("call failed: {:#}", e);
                eprintln!("error: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch { config, url }) => {
            if let Err(e) = run_watch(config, url).await {
                log::error!("watch failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    if config::init_config(&path)? {
        println!("wrote default configuration to {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

fn load_builder(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<ClientBuilder> {
    let (config, path): (ClientConfig, PathBuf) = config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    let builder = ClientBuilder::from_config(&config);
    Ok(match url {
        Some(url) => builder.url(url),
        None => builder,
    })
}

async fn run_call(
    config_path: Option<PathBuf>,
    url: Option<String>,
    method: String,
    params: Option<String>,
    wait_ms: u64,
) -> anyhow::Result<()> {
    let params = params
        .map(|p| serde_json::from_str::<serde_json::Value>(&p))
        .transpose()
        .map_err(|e| anyhow::anyhow!("--params is not valid JSON: {}", e))?;

    let client = load_builder(config_path, url)?.build();
    client.start();
    let result = client
        .request_when_ready(method, params, Duration::from_millis(wait_ms))
        .await;
    client.stop();

    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn run_watch(config_path: Option<PathBuf>, url: Option<String>) -> anyhow::Result<()> {
    let client: GatewayClient = load_builder(config_path, url)?
        .on_open(|| eprintln!("-- connected"))
        .on_close(|code, reason| eprintln!("-- disconnected ({}): {}", code, reason))
        .on_event(|evt| {
            let line = serde_json::to_string(evt).unwrap_or_else(|_| evt.event.clone());
            println!("{}", line);
        })
        .build();
    client.start();

    tokio::signal::ctrl_c().await?;
    client.stop();
    Ok(())
}
