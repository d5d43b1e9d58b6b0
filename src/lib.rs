pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
pub mod utils;

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn data_dir() -> PathBuf {
    std::env::var("PONTIS_DATA_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn run() {
    let data_dir = data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("Failed to create data directory {:?}: {}", data_dir, e);
        std::process::exit(1);
    }
    modules::system::logger::init_logger(&data_dir);

    let mut config = match modules::system::config::load_app_config(&data_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("[E-CONFIG] {}", e);
            std::process::exit(1);
        }
    };
    config.apply_env_overrides();
    config.ensure_generated_secrets();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let state = match proxy::server::build_state(config, &data_dir) {
            Ok(state) => state,
            Err(e) => {
                error!("[E-STARTUP] {}", e);
                std::process::exit(1);
            }
        };
        info!(
            "Starting pontis on {}:{} ({} credentials loaded)",
            state.config.host,
            state.config.port,
            state.pool.len().await
        );

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        });

        if let Err(e) = proxy::server::run_server(state, cancel).await {
            error!("[E-RUNTIME] {}", e);
            std::process::exit(1);
        }
    });
}
