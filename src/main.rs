use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use log::{info, warn};

use modbus_tcp_manager::config::Config;
use modbus_tcp_manager::services::ApiService;
use modbus_tcp_manager::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("modbus-tcp-manager")
        .version(VERSION)
        .about("Web API for operating industrial Modbus TCP devices")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to TOML configuration file"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("ADDR")
                .help("HTTP server bind address"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("HTTP server port"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    let default_level = if matches.get_flag("verbose") {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => {
            info!("📋 Loading configuration from {}", path);
            Config::from_file(path)?
        }
        None => {
            warn!("⚙️  No configuration file given, using defaults");
            Config::default()
        }
    };
    config.apply_matches(&matches)?;

    info!("🚀 Starting Modbus TCP Manager v{}", VERSION);

    let mut api = ApiService::new(config.clone());
    api.start().await?;
    info!(
        "🌐 API available at http://{}:{}",
        config.server.host, config.server.port
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown signal received");

    api.stop().await;
    info!("👋 Goodbye!");
    Ok(())
}
