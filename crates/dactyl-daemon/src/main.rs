//! Dactyl Daemon - Main entry point
//!
//! The daemon publishes one controller per fingerprint scanner, stores
//! enrolled templates, and serves clients over a unix socket.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dactyl_core::DeviceId;
use dactyl_daemon::access::{Permissive, SystemUsers};
use dactyl_daemon::hardware::{HotplugEvent, MockScanner};
use dactyl_daemon::{DaemonConfig, IpcServer, TemplateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dactyl_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting dactyl daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load or create config
    let config_path = std::env::var("DACTYL_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::config_dir()
                .unwrap_or_else(|| std::path::PathBuf::from("/etc"))
                .join("dactyl")
                .join("daemon.json")
        });

    let config = if config_path.exists() {
        DaemonConfig::load(&config_path)?
    } else {
        let config = DaemonConfig::default();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        config.save(&config_path)?;
        info!("Created default config at {:?}", config_path);
        config
    };

    config.ensure_directories()?;

    // Initialize components
    let store = Arc::new(TemplateStore::new(config.storage_path.clone()));
    let authority = Arc::new(Permissive);
    let user_db = Arc::new(SystemUsers);

    let (hotplug_tx, hotplug_rx) = mpsc::channel(8);
    let (idle_tx, mut idle_rx) = mpsc::channel(1);

    let registry = dactyl_daemon::registry::spawn_registry(
        store,
        authority,
        hotplug_rx,
        config.idle_timeout(),
        idle_tx,
    );

    // Development mode: publish simulated scanners. Real hardware
    // arrives through the same channel from the platform's device
    // notification source.
    for n in 0..config.simulated_devices {
        let scanner = MockScanner::new(
            DeviceId::new("mockdrv", format!("{n:04}")),
            format!("Simulated Sensor {n}"),
        );
        hotplug_tx
            .send(HotplugEvent::Added(Arc::new(scanner)))
            .await
            .ok();
    }

    let ipc_server = IpcServer::new(config.socket_path.clone(), registry, user_db);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server.run().await {
            error!("IPC server error: {}", e);
        }
    });

    info!("Daemon started successfully");

    // Wait for shutdown
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = idle_rx.recv() => {
            info!("Idle timeout reached, exiting");
        }
        _ = ipc_handle => {
            error!("IPC server exited unexpectedly");
        }
    }

    info!("Daemon shutting down");

    Ok(())
}

/// Helper module for dirs functionality
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
}
