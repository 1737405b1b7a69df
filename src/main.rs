//! MCT2032 device core binary
//!
//! Runs the command engine over a UDP control link with a simulated radio,
//! filesystem capture storage, a fixed scan table and a logging script
//! executor.

use mct_core::{
    daemon::{ConfigManager, DaemonConfig, DeviceBuilder, FsStorage, UdpTransport},
    frame::MacAddress,
    host::LogExecutor,
    phy::SimRadio,
    scan::{NetworkInfo, SecurityType, StaticScanner},
    MctError, Result,
};
use clap::{Arg, Command};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    process,
    sync::Arc,
    time::Duration,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration file path
const DEFAULT_CONFIG_PATH: &str = "mct-core.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("mct-core")
        .version(env!("CARGO_PKG_VERSION"))
        .about("MCT2032 command engine and radio frame subsystem")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (.toml, .json, .yaml)")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Address to bind the control link to"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("UDP port of the control link")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("storage-root")
                .short('s')
                .long("storage-root")
                .value_name("DIR")
                .help("Directory capture files are written under"),
        )
        .arg(
            Arg::new("channel")
                .long("channel")
                .value_name("CHANNEL")
                .help("Initial radio channel (1-14)")
                .value_parser(clap::value_parser!(u8)),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let manager = load_configuration(&config_path)?;
    let source = manager.config_path().map(Path::to_path_buf);
    let mut config = manager.into_config();

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.transport.bind_address = bind.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.transport.port = *port;
    }
    if let Some(root) = matches.get_one::<String>("storage-root") {
        config.storage.root = PathBuf::from(root);
        config.storage.enabled = true;
    }
    if let Some(channel) = matches.get_one::<u8>("channel") {
        config.radio.default_channel = *channel;
    }

    init_logging(&config.logging.level, &config.logging.format)?;
    info!("Starting {} v{}", config.general.device_name, env!("CARGO_PKG_VERSION"));
    match source {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file, using defaults"),
    }

    match run_device(config).await {
        Ok(()) => {
            info!("Device shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Device error: {}", e);
            process::exit(1);
        }
    }
}

/// Initialize logging system
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| MctError::Config(format!("Invalid log level '{}': {}", level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match format {
        "compact" => builder.compact().init(),
        "text" => builder.with_file(true).with_line_number(true).init(),
        other => {
            return Err(MctError::Config(format!("Invalid log format '{}'", other)));
        }
    }

    Ok(())
}

/// Load configuration, falling back to defaults when the file is absent
fn load_configuration(path: &Path) -> Result<ConfigManager> {
    if !path.exists() {
        return Ok(ConfigManager::new());
    }
    ConfigManager::load_from_file(path)
}

/// Networks reported by the simulated scanner
fn demo_networks() -> Vec<NetworkInfo> {
    vec![
        NetworkInfo::new("HomeNet", MacAddress([0x02, 0x11, 0x22, 0x33, 0x44, 0x55]), 6, -42, SecurityType::Wpa2),
        NetworkInfo::new("CoffeeShop", MacAddress([0x02, 0x66, 0x77, 0x88, 0x99, 0xAA]), 1, -67, SecurityType::Open),
        NetworkInfo::new("Office-5F", MacAddress([0x02, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]), 11, -71, SecurityType::WpaWpa2),
        NetworkInfo::new("", MacAddress([0x02, 0xBB, 0xCC, 0xDD, 0xEE, 0x02]), 11, -80, SecurityType::Wpa3),
    ]
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}

async fn run_device(config: DaemonConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.transport.bind_address, config.transport.port)
        .parse()
        .map_err(|e| MctError::Config(format!("Invalid bind address: {}", e)))?;
    let transport = UdpTransport::bind(addr, config.transport.recv_buffer_size).await?;
    info!("Control link listening on {}", transport.local_addr()?);

    let mut builder = DeviceBuilder::new()
        .with_radio(Arc::new(SimRadio::new()))
        .with_transport(Arc::new(transport))
        .with_executor(Arc::new(LogExecutor::new(Duration::from_millis(20))))
        .with_scanner(Arc::new(StaticScanner::new(demo_networks(), Duration::from_secs(2))));

    if config.storage.enabled {
        match FsStorage::new(config.storage.root.clone()) {
            Ok(storage) => builder = builder.with_storage(Arc::new(storage)),
            Err(e) => warn!("Capture storage disabled: {}", e),
        }
    }

    let mut device = builder.with_config(config).build()?;
    device.run(shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_CONFIG_PATH, "mct-core.toml");
    }

    #[test]
    fn test_load_nonexistent_config() {
        let manager = load_configuration(Path::new("/nonexistent/mct-core.toml")).unwrap();
        assert!(manager.config_path().is_none());
        assert_eq!(manager.get_config().general.device_name, "MCT2032");
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let err = init_logging("info", "xml").unwrap_err();
        assert!(matches!(err, MctError::Config(_)));
    }

    #[test]
    fn test_demo_networks() {
        let networks = demo_networks();
        assert_eq!(networks.len(), 4);
        assert!(networks[3].hidden);
    }
}
