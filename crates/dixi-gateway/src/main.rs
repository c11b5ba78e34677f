//! Dixi - gesture-driven projection assistant gateway

use clap::{Parser, Subcommand};
use dixi_core::config::BindMode;
use dixi_core::{DixiConfig, ExpiringCache};
use dixi_gateway::{start_gateway, VisionClient};
use dixi_llm::InferenceOrchestrator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "dixi.toml";

#[derive(Parser)]
#[command(name = "dixi", about = "Dixi gesture assistant - gateway and tools")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Config file (missing file = defaults)
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        #[arg(short, long)]
        port: Option<u16>,
        /// `lan` or `loopback`
        #[arg(short, long)]
        bind: Option<String>,
        /// Emit logs as JSON lines
        #[arg(long)]
        log_json: bool,
    },
    /// Probe the inference providers and the vision service
    Status {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            config,
            port,
            bind,
            log_json,
        }) => {
            init_tracing(log_json);
            let mut config = load_config(&config);
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(bind) = bind {
                config.gateway.bind = BindMode::parse(&bind);
            }
            start_gateway(config).await?;
        }

        Some(Commands::Status { config }) => {
            let config = load_config(&config);
            let cache = Arc::new(ExpiringCache::new(1, config.cache.ttl()));
            let orchestrator = InferenceOrchestrator::from_config(&config, cache);
            let vision = VisionClient::new(&config.vision.base_url, config.timeouts.capture());

            let status = serde_json::json!({
                "inference": orchestrator.status().await,
                "vision": {
                    "url": config.vision.base_url,
                    "healthy": vision.health().await,
                },
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Some(Commands::Config { config }) => {
            let mut config = load_config(&config);
            if config.gemini.api_key.is_some() {
                config.gemini.api_key = Some("<redacted>".into());
            }
            print!("{}", config.to_toml());
        }

        Some(Commands::Version) => {
            println!("dixi v{}", env!("CARGO_PKG_VERSION"));
        }

        // No subcommand = serve with defaults
        None => {
            init_tracing(false);
            start_gateway(load_config(Path::new(DEFAULT_CONFIG))).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> DixiConfig {
    let mut config = DixiConfig::load(path);
    config.apply_env();
    config
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dixi=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
