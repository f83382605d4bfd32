//! Orchestrates the update pipeline: heartbeat, checks, downloads, handoff.
//!
//! One coordinator instance owns the state the original kept in process-wide
//! globals: the current version, the resolved client identity, the pending
//! release and the active download. Collaborators receive it by `Arc`.

use crate::settings::SettingsStore;
use crate::updater::check::{self, CheckResult, ReleaseInfo, UpdateCheckClient};
use crate::updater::download::{
    CancelHandle, DownloadEngine, DownloadError, DownloadOutcome, DownloadStatus,
};
use crate::updater::events::{EventBus, UpdateEvent};
use crate::updater::identity::ClientIdentity;
use crate::updater::relaunch;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_SERVER_URL: &str = "https://updates.money-tracker.app";

/// Name of the staged artifact inside the install directory.
pub const UPDATE_FILE_NAME: &str = "update.tmp";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdaterState {
    Idle,
    Checking,
    Downloading,
    Installing,
}

pub struct UpdaterConfig {
    pub current_version: String,
    pub username: String,
    pub default_server_url: String,
    /// Directory holding the executable to be replaced; the staged
    /// `update.tmp` lands here too.
    pub install_dir: PathBuf,
    pub resource_cache_dir: PathBuf,
}

impl UpdaterConfig {
    pub fn new(current_version: impl Into<String>, install_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        Self {
            current_version: current_version.into(),
            username: "Unknown".to_owned(),
            default_server_url: DEFAULT_SERVER_URL.to_owned(),
            resource_cache_dir: install_dir.join("resources"),
            install_dir,
        }
    }
}

/// Registration of the download worker currently owning the staged file.
/// `done` resolves when that worker has fully terminated, cleanup included,
/// so a successor can safely reuse the same destination path.
struct ActiveDownload {
    cancel: CancelHandle,
    done: oneshot::Receiver<()>,
}

pub struct UpdateCoordinator {
    settings: Arc<dyn SettingsStore>,
    config: UpdaterConfig,
    client: UpdateCheckClient,
    engine: DownloadEngine,
    identity: ClientIdentity,
    events: EventBus,
    state: Mutex<UpdaterState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    active_download: Mutex<Option<ActiveDownload>>,
    /// At most one release is pending at a time; a fresh check supersedes
    /// any unconsumed prior result.
    pending: Mutex<Option<ReleaseInfo>>,
}

impl UpdateCoordinator {
    pub fn new(settings: Arc<dyn SettingsStore>, config: UpdaterConfig) -> Arc<Self> {
        Arc::new(Self {
            identity: ClientIdentity::new(settings.clone()),
            settings,
            config,
            client: UpdateCheckClient::new(),
            engine: DownloadEngine::new(),
            events: EventBus::new(),
            state: Mutex::new(UpdaterState::Idle),
            heartbeat: Mutex::new(None),
            active_download: Mutex::new(None),
            pending: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> UpdaterState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_release(&self) -> Option<ReleaseInfo> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, state: UpdaterState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn server_url(&self) -> String {
        check::normalized_server_url(self.settings.as_ref(), &self.config.default_server_url)
    }

    /// Schedules silent background checks. Calling it again replaces the
    /// previous timer, so repeated calls are safe.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // No mandatory check on launch; the first tick fires immediately
            // and is consumed here.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = this.check_now(false).await;
            }
        });
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Runs one check on a background task and emits the outcome events.
    ///
    /// Checks are idempotent reads, so a new call while another check is in
    /// flight just starts a fresh worker; downloads, by contrast, are
    /// exclusive (see [`Self::begin_download`]).
    pub fn check_now(self: &Arc<Self>, is_manual: bool) -> JoinHandle<CheckResult> {
        let this = self.clone();
        tokio::spawn(async move {
            this.set_state(UpdaterState::Checking);
            let initiator = if is_manual { "User" } else { "System" };
            info!("Update check initiated by {initiator}");

            let base_url = this.server_url();
            let client_id = this.identity.get_or_create();
            let result = this
                .client
                .check(
                    &this.settings,
                    &this.config.resource_cache_dir,
                    &base_url,
                    &client_id,
                    &this.config.current_version,
                    &this.config.username,
                    is_manual,
                )
                .await;

            {
                let mut pending = this.pending.lock().unwrap_or_else(|e| e.into_inner());
                *pending = result.release.clone();
            }

            if result.success {
                if let Some(release) = &result.release {
                    this.events.emit(UpdateEvent::UpdateAvailable(release.clone()));
                } else if is_manual {
                    this.events.emit(UpdateEvent::UpToDate(result.message.clone()));
                }
            } else {
                this.events.emit(UpdateEvent::CheckFailed(result.message.clone()));
            }
            this.events.emit(UpdateEvent::CheckCompleted(result.clone()));

            if this.state() == UpdaterState::Checking {
                this.set_state(UpdaterState::Idle);
            }
            result
        })
    }

    /// Downloads and verifies the release artifact into the install
    /// directory, re-emitting engine progress as events.
    ///
    /// Only one download runs per coordinator; an active one is cancelled
    /// before the new worker starts.
    pub fn begin_download(self: &Arc<Self>, release: ReleaseInfo) -> JoinHandle<DownloadOutcome> {
        let this = self.clone();
        tokio::spawn(async move {
            let cancel = CancelHandle::new();
            let (done_tx, done_rx) = oneshot::channel::<()>();
            // Dropped when this task ends, releasing the successor below.
            let _done_tx = done_tx;
            let previous = {
                let mut active = this.active_download.lock().unwrap_or_else(|e| e.into_inner());
                active.replace(ActiveDownload {
                    cancel: cancel.clone(),
                    done: done_rx,
                })
            };
            if let Some(prev) = previous {
                info!("Cancelling previous download before starting a new one");
                prev.cancel.cancel();
                // The superseded worker may still hold the staged file open
                // or be about to delete it; wait until it has fully wound
                // down before this one touches the same path.
                let _ = prev.done.await;
            }
            this.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
            this.set_state(UpdaterState::Downloading);

            let outcome = this.run_download(&release, &cancel).await;
            this.clear_active(&cancel);

            match &outcome {
                DownloadOutcome::Done(path) => {
                    info!("Download complete, staged at {}", path.display());
                    this.events.emit(UpdateEvent::DownloadFinished(path.clone()));
                }
                DownloadOutcome::Cancelled => {
                    info!("Download cancelled by user");
                    this.events.emit(UpdateEvent::DownloadCancelled);
                }
                DownloadOutcome::Failed(e) => {
                    warn!("Download failed: {e}");
                    this.events.emit(UpdateEvent::DownloadError(e.to_string()));
                }
            }
            if this.state() == UpdaterState::Downloading {
                this.set_state(UpdaterState::Idle);
            }
            outcome
        })
    }

    async fn run_download(&self, release: &ReleaseInfo, cancel: &CancelHandle) -> DownloadOutcome {
        let url = match &release.download_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => {
                // Defensive default, not a silent error: the conventional
                // endpoint exists on every release server.
                let fallback = format!("{}/download", self.server_url());
                warn!("Release omitted a download URL, using fallback {fallback}");
                fallback
            }
        };

        // Surface an unwritable install dir before spending bandwidth on a
        // download we could never apply.
        let probe = self.config.install_dir.join(".write_probe");
        if let Err(e) = std::fs::write(&probe, b"probe") {
            // Returned, not emitted here: the caller reports every failed
            // outcome exactly once.
            let msg = format!(
                "No write permission in {}: {e}. Run the application with sufficient privileges.",
                self.config.install_dir.display()
            );
            return DownloadOutcome::Failed(DownloadError::Io(msg));
        }
        let _ = std::fs::remove_file(&probe);

        let dest = self.config.install_dir.join(UPDATE_FILE_NAME);
        info!("Downloading {} to {}", url, dest.display());

        let events = self.events.clone();
        let mut last_status: Option<DownloadStatus> = None;
        self.engine
            .download(&url, &dest, release.signature.as_deref(), cancel, move |p| {
                if last_status != Some(p.status) {
                    last_status = Some(p.status);
                    let text = match p.status {
                        DownloadStatus::Connecting => "Connecting to the update server...",
                        DownloadStatus::InProgress => "Downloading the update...",
                        DownloadStatus::Verifying => "Verifying file integrity...",
                        DownloadStatus::Done => "Download finished.",
                        DownloadStatus::Failed => "Download failed.",
                        DownloadStatus::Cancelled => "Download cancelled.",
                    };
                    events.emit(UpdateEvent::DownloadStatus(text.to_owned()));
                }
                if p.status == DownloadStatus::InProgress {
                    events.emit(UpdateEvent::DownloadProgress {
                        percent: p.percent(),
                        bytes_read: p.bytes_read,
                        total_bytes: p.total_bytes,
                    });
                }
            })
            .await
    }

    fn clear_active(&self, mine: &CancelHandle) {
        let mut active = self.active_download.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_ref().is_some_and(|cur| cur.cancel.shares_flag(mine)) {
            *active = None;
        }
    }

    /// Forwards a cancellation request to the active download, if any.
    pub fn cancel_download(&self) {
        let active = self.active_download.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            current.cancel.cancel();
        }
    }

    /// Hands the staged artifact to the companion installer. On success the
    /// caller is expected to exit the process; on failure a
    /// [`UpdateEvent::RelaunchFailed`] is emitted and the current version
    /// keeps running.
    pub async fn finalize(&self, new_exe: &Path) -> anyhow::Result<()> {
        self.set_state(UpdaterState::Installing);
        self.events.emit(UpdateEvent::Installing(new_exe.to_path_buf()));

        let current_exe = std::env::current_exe()?;
        match relaunch::relaunch(&current_exe, new_exe, &self.server_url()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_state(UpdaterState::Idle);
                self.events.emit(UpdateEvent::RelaunchFailed(format!("{e:#}")));
                Err(e)
            }
        }
    }

    /// Shuts the subsystem down: stops the heartbeat and cancels any
    /// in-flight download so no background write survives process teardown.
    pub fn stop(&self) {
        let mut slot = self.heartbeat.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            info!("Heartbeat stopped");
        }
        drop(slot);
        self.cancel_download();
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
