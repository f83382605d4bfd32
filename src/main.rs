//! Headless entry point for the update subsystem.
//!
//! The GUI shell normally owns the coordinator and renders its events; this
//! binary wires the same pipeline to the log so the full check → download →
//! handoff flow can run unattended (`--check` forces an immediate manual
//! check, the heartbeat covers the rest).

use anyhow::Result;
use log::{error, info, warn};
use money_tracker::settings::{JsonFileSettings, SettingsStore};
use money_tracker::updater::{UpdateCoordinator, UpdateEvent, UpdaterConfig};
use std::sync::Arc;
use std::time::Duration;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let exe = std::env::current_exe()?;
    let install_dir = exe
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir());

    let settings = Arc::new(JsonFileSettings::load(install_dir.join("settings.json")));
    let mut config = UpdaterConfig::new(env!("CARGO_PKG_VERSION"), &install_dir);
    if let Some(username) = settings.get("username").filter(|u| !u.is_empty()) {
        config.username = username;
    }

    let coordinator = UpdateCoordinator::new(settings, config);
    let mut events = coordinator.subscribe();

    coordinator.start_heartbeat(HEARTBEAT_INTERVAL);
    if std::env::args().any(|a| a == "--check") {
        coordinator.check_now(true);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                coordinator.stop();
                return Ok(());
            }
            event = events.recv() => {
                let Ok(event) = event else { continue };
                match event {
                    UpdateEvent::UpdateAvailable(release) => {
                        info!(
                            "Update available: {} (force: {}){}",
                            release.version,
                            release.force_update,
                            release.notes.as_deref().map(|n| format!(" - {n}")).unwrap_or_default()
                        );
                        // Headless mode auto-confirms; the GUI asks first.
                        coordinator.begin_download(release);
                    }
                    UpdateEvent::UpToDate(msg) => info!("{msg}"),
                    UpdateEvent::CheckFailed(msg) => warn!("Update check failed: {msg}"),
                    UpdateEvent::CheckCompleted(result) => {
                        info!(
                            "Check completed: success={} update_found={}",
                            result.success, result.update_found
                        );
                    }
                    UpdateEvent::DownloadProgress { percent, bytes_read, .. } => {
                        match percent {
                            Some(p) => info!("Downloading... {p}%"),
                            None => info!("Downloading... {bytes_read} bytes"),
                        }
                    }
                    UpdateEvent::DownloadStatus(text) => info!("{text}"),
                    UpdateEvent::DownloadFinished(path) => {
                        info!("Update staged at {}", path.display());
                        if coordinator.finalize(&path).await.is_ok() {
                            std::process::exit(0);
                        }
                    }
                    UpdateEvent::DownloadError(msg) => error!("Download failed: {msg}"),
                    UpdateEvent::DownloadCancelled => info!("Download cancelled"),
                    UpdateEvent::Installing(path) => {
                        info!("Handing off to the installer for {}", path.display());
                    }
                    UpdateEvent::RelaunchFailed(msg) => {
                        error!("Installer handoff failed, staying on the current version: {msg}");
                    }
                }
            }
        }
    }
}
