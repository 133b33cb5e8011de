//! Stackwatch - Entry Point
//!
//! A continuous deployment controller that watches git repositories and
//! container registries and redeploys a Portainer-managed swarm stack when
//! anything observable changes.

use std::collections::HashMap;
use std::env;
use std::path::Path;

use stackwatch::app::options::AppOptions;
use stackwatch::app::run::run;
use stackwatch::config;
use stackwatch::logs::{init_logging, LogOptions};
use stackwatch::utils::version_info;

use tracing::{error, info};

const DEFAULT_CONFIG: &str = "config-prod.yaml";

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
        println!("{}", serde_json::to_string_pretty(&version).unwrap());
        return;
    }

    // Load and validate the configuration
    let config_path = cli_args
        .get("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG);
    let settings = match config::load(Path::new(config_path)).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.main.log_level.clone(),
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    info!(
        "Running stackwatch {} with config {}",
        version.version, config_path
    );
    let options = AppOptions::default();
    if let Err(e) = run(settings, options, await_shutdown_signal()).await {
        error!("Failed to run stackwatch: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

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
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
