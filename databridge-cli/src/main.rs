use clap::{Parser, Subcommand, ValueEnum};
use databridge_client::{ApiSettings, FeedRetriever, HttpClientFactory};
use databridge_core::error::ErrorClass;
use databridge_core::{BridgeConfig, BridgeError, BridgeResult, DataBridge, Shutdown, shutdown_signal};
use databridge_storage::{build_cache, build_store};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "databridge", version = "0.3.0")]
#[command(about = "Databridge - continuous synchronization from a resource feed into a document store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge until SIGINT/SIGTERM
    Run {
        /// Configuration file (YAML, or TOML by extension)
        #[arg(long)]
        config: PathBuf,
        #[arg(long, value_enum, default_value = "json")]
        log_format: LogFormat,
        /// Filter directive, overridden by RUST_LOG
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Load and validate a configuration file, then print it
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LogFormat {
    Json,
    Pretty,
}

fn init_logging(format: LogFormat, level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match level.parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

fn exit_code(e: &BridgeError) -> ExitCode {
    match e.class() {
        ErrorClass::Config => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

fn load(path: &Path) -> BridgeResult<BridgeConfig> {
    let config = BridgeConfig::load_from_file(path)?;
    config.validate()?;
    Ok(config)
}

async fn run(config: BridgeConfig) -> BridgeResult<()> {
    let store = build_store(&config).await?;
    let cache = build_cache(&config).await?;
    let feeder = Arc::new(FeedRetriever::from_config(&config)?);
    let factory = Arc::new(HttpClientFactory::new(ApiSettings::from_config(&config)));

    let bridge = DataBridge::new(config, feeder, factory, store)?.with_cache(cache);

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.trigger();
    });

    bridge.run(shutdown).await
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            log_format,
            log_level,
        } => {
            init_logging(log_format, &log_level);
            let config = match load(&config) {
                Ok(config) => config,
                Err(e) => {
                    error!(error = %e, "Invalid configuration");
                    return exit_code(&e);
                }
            };

            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "Failed to start runtime");
                    return ExitCode::from(1);
                }
            };
            match runtime.block_on(run(config)) {
                Ok(()) => {
                    info!("Databridge stopped");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Databridge failed");
                    exit_code(&e)
                }
            }
        }
        Commands::CheckConfig { config } => match load(&config) {
            Ok(mut config) => {
                if !config.resources_api_token.is_empty() {
                    config.resources_api_token = "***".to_string();
                }
                match serde_json::to_string_pretty(&config) {
                    Ok(rendered) => {
                        println!("{}", rendered);
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        ExitCode::from(1)
                    }
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                exit_code(&e)
            }
        },
    }
}
