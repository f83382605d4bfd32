//! The self-update pipeline: check, confirm, download, verify, hand off.

pub mod check;
pub mod coordinator;
pub mod download;
pub mod events;
pub mod identity;
pub mod relaunch;
pub mod version;

pub use check::{CheckResult, ReleaseInfo, UpdateCheckClient};
pub use coordinator::{UpdateCoordinator, UpdaterConfig, UpdaterState};
pub use download::{CancelHandle, DownloadEngine, DownloadError, DownloadOutcome, DownloadStatus};
pub use events::UpdateEvent;
pub use identity::ClientIdentity;
