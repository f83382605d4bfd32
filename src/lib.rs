//! Self-update and release-deployment pipeline for the Money Tracker app.
//!
//! The GUI shell, the domain tabs, and the auth service are consumers of this
//! subsystem; they subscribe to [`updater::events::UpdateEvent`] and feed in
//! URLs and confirmations. Everything here runs on background tasks and never
//! blocks the embedding UI thread.

pub mod settings;
pub mod updater;
