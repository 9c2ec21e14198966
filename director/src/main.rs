//! Supercompose director - Entry Point
//!
//! Reconciles docker-compose deployments on remote nodes and tracks their
//! containers.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use supercompose_director::app::options::AppOptions;
use supercompose_director::app::run::run;
use supercompose_director::errors::DirectorError;
use supercompose_director::filesys::file::File;
use supercompose_director::logs::{init_logging, LogOptions};
use supercompose_director::mqtt::client::{MqttAddress, MqttClient};
use supercompose_director::mqtt::topics::Notification;
use supercompose_director::storage::layout::StorageLayout;
use supercompose_director::storage::settings::Settings;
use supercompose_director::utils::version_info;

use tracing::{error, info};
use uuid::Uuid;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Retrieve the settings file
    let layout = StorageLayout::default();
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {}: {}", settings_file.path().display(), e);
                return;
            }
        }
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    // Publish a notification and exit
    for (flag, make) in [
        ("notify", Notification::NodeChanged as fn(Uuid) -> Notification),
        ("notify-info", Notification::NodeInfo as fn(Uuid) -> Notification),
    ] {
        if let Some(node_id) = cli_args.get(flag) {
            if let Err(e) = notify(&settings, node_id, make).await {
                error!("Failed to publish notification: {}", e);
                std::process::exit(1);
            }
            return;
        }
    }

    if let Err(e) = layout.setup().await {
        error!("Failed to set up {}: {}", layout.base_dir.display(), e);
        return;
    }

    let options = match AppOptions::from_settings(&settings, &layout) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid settings: {}", e);
            return;
        }
    };

    info!("Running supercompose director {} with options: {:?}", version.version, options);
    let result = run(options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the director: {e}");
    }
}

async fn notify(
    settings: &Settings,
    node_id: &str,
    make: fn(Uuid) -> Notification,
) -> Result<(), DirectorError> {
    let node_id = Uuid::parse_str(node_id)
        .map_err(|e| DirectorError::ConfigError(format!("Invalid node id {}: {}", node_id, e)))?;
    let address = MqttAddress {
        host: settings.mqtt_broker.host.clone(),
        port: settings.mqtt_broker.port,
        use_tls: settings.mqtt_broker.tls,
        ca_cert_path: settings.mqtt_broker.ca_cert_path.clone(),
    };
    let client = MqttClient::new(&address, &format!("supercompose-notify-{}", Uuid::new_v4())).await?;
    client.notify_once(make(node_id), NOTIFY_TIMEOUT).await?;
    info!("Published notification for node {}", node_id);
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
