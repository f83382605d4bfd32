//! Typed event bus between the update pipeline and its subscribers.
//!
//! The GUI layer is just one subscriber; the headless binary's log loop is
//! another. Events are immutable snapshots handed from worker tasks to
//! whoever is listening; nobody mutates shared state across the channel.

use crate::updater::check::{CheckResult, ReleaseInfo};
use std::path::PathBuf;
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub enum UpdateEvent {
    /// A newer (or force-flagged) release exists; awaiting user confirmation.
    UpdateAvailable(ReleaseInfo),
    /// Manual check found nothing; `String` is the user-facing message.
    UpToDate(String),
    /// The check itself failed, with a classified, user-facing message.
    CheckFailed(String),
    /// Every check ends with exactly one of these, manual or not.
    CheckCompleted(CheckResult),
    /// Emitted after each received chunk. `percent` is `None` when the
    /// server sent no `Content-Length`.
    DownloadProgress {
        percent: Option<u8>,
        bytes_read: u64,
        total_bytes: Option<u64>,
    },
    /// Human-readable phase text ("Connecting...", "Verifying...").
    DownloadStatus(String),
    /// Artifact downloaded and verified; path to the staged file.
    DownloadFinished(PathBuf),
    DownloadError(String),
    /// Deliberate abort; subscribers must not show an error dialog.
    DownloadCancelled,
    /// Handoff to the companion installer has begun; the process will exit.
    Installing(PathBuf),
    /// Spawning the companion installer failed; the app remains runnable.
    /// The message includes the diagnostic log path.
    RelaunchFailed(String),
}

/// Broadcast fan-out. Sending never blocks and never fails; events emitted
/// with no subscribers are simply dropped.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UpdateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: UpdateEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
