//! Network round-trip for the update check: check-in telemetry, release
//! metadata query, and the resource-sync side channel.

use crate::settings::SettingsStore;
use crate::updater::version;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const CHECKIN_TIMEOUT: Duration = Duration::from_secs(3);
const INFO_TIMEOUT: Duration = Duration::from_secs(5);

pub const UP_TO_DATE_MESSAGE: &str =
    "You are running the latest version; no update is required.";

/// Release metadata as served by `GET {base}/update_info`.
#[derive(Clone, Debug, Deserialize)]
pub struct ReleaseInfo {
    pub version: String,
    #[serde(default)]
    pub download_url: Option<String>,
    /// SHA-256 hexdigest of the artifact, when the server computed one.
    #[serde(default)]
    pub signature: Option<String>,
    /// Mandates installing this release even if it is not newer. Used for
    /// forced rollbacks and reinstalls.
    #[serde(default)]
    pub force_update: bool,
    #[serde(default)]
    pub notes: Option<String>,
    /// Out-of-band resource map (`{resource_key: url}`), synced separately.
    #[serde(default)]
    pub resources: HashMap<String, String>,
}

/// Outcome of one check invocation, handed to subscribers and discarded.
#[derive(Clone, Debug)]
pub struct CheckResult {
    pub success: bool,
    pub update_found: bool,
    pub release: Option<ReleaseInfo>,
    pub message: String,
    pub is_manual: bool,
}

#[derive(Serialize)]
struct CheckinPayload<'a> {
    client_id: &'a str,
    version: &'a str,
    username: &'a str,
    status: &'a str,
}

/// Normalizes the configured server URL, persisting any fix so the warning
/// does not repeat on every heartbeat tick.
///
/// Fixes applied: trailing-slash trim, `https://localhost` downgraded to
/// plain HTTP (a common local-dev misconfiguration), and an accidentally
/// pasted `/dashboard` admin-console suffix stripped.
pub fn normalized_server_url(settings: &dyn SettingsStore, default_url: &str) -> String {
    let stored = settings
        .get("update_server_url")
        .filter(|u| !u.trim().is_empty());
    let original = stored.unwrap_or_else(|| default_url.to_owned());

    let mut url = original.trim().to_owned();
    if url.starts_with("https://127.0.0.1") || url.starts_with("https://localhost") {
        warn!("Correcting {url} to plain HTTP for a local server");
        url = url.replacen("https://", "http://", 1);
    }
    if url.contains("/dashboard") {
        url = url.replace("/dashboard", "");
    }
    url = url.trim_end_matches('/').to_owned();

    if url != original {
        settings.set("update_server_url", &url);
    }
    url
}

pub struct UpdateCheckClient {
    http: reqwest::Client,
    checkin_timeout: Duration,
    info_timeout: Duration,
}

impl UpdateCheckClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            checkin_timeout: CHECKIN_TIMEOUT,
            info_timeout: INFO_TIMEOUT,
        }
    }

    /// Shorter timeouts for tests that exercise the timeout classification.
    pub fn with_timeouts(checkin: Duration, info: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            checkin_timeout: checkin,
            info_timeout: info,
        }
    }

    /// One full check round-trip. Never fails: every outcome is reduced to
    /// a [`CheckResult`] the caller can surface as-is.
    #[allow(clippy::too_many_arguments)]
    pub async fn check(
        &self,
        settings: &Arc<dyn SettingsStore>,
        resource_cache_dir: &Path,
        base_url: &str,
        client_id: &str,
        current_version: &str,
        username: &str,
        is_manual: bool,
    ) -> CheckResult {
        // Fire-and-forget telemetry. A dead telemetry endpoint must never
        // block the version query.
        let checkin = self
            .http
            .post(format!("{base_url}/client_checkin"))
            .timeout(self.checkin_timeout)
            .json(&CheckinPayload {
                client_id,
                version: current_version,
                username,
                status: "Active",
            })
            .send()
            .await;
        if let Err(e) = checkin {
            warn!("Check-in failed (non-critical): {e}");
        }

        let response = match self
            .http
            .get(format!("{base_url}/update_info"))
            .timeout(self.info_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return self.failed(classify_transport_error(&e), is_manual),
        };

        if !response.status().is_success() {
            let msg = format!("Update server returned HTTP {}", response.status().as_u16());
            return self.failed(msg, is_manual);
        }

        let release: ReleaseInfo = match response.json().await {
            Ok(r) => r,
            Err(e) => return self.failed(format!("Malformed server response: {e}"), is_manual),
        };

        self.sync_resources(settings, resource_cache_dir, &release.resources);

        let newer = version::is_newer(&release.version, current_version);
        // Force bypasses the ordering check entirely so the server can push
        // rollbacks and reinstalls of the same version.
        let update_found = newer || release.force_update;
        info!(
            "Check result: server={} local={} force={} manual={}",
            release.version, current_version, release.force_update, is_manual
        );

        let message = if update_found {
            format!("Update available: {}", release.version)
        } else if is_manual {
            UP_TO_DATE_MESSAGE.to_owned()
        } else {
            String::new()
        };

        CheckResult {
            success: true,
            update_found,
            release: update_found.then_some(release),
            message,
            is_manual,
        }
    }

    fn failed(&self, message: String, is_manual: bool) -> CheckResult {
        CheckResult {
            success: false,
            update_found: false,
            release: None,
            message,
            is_manual,
        }
    }

    /// For each resource whose URL changed since the last sync, fetch and
    /// cache it on a detached task. Failures are logged only; this side
    /// channel never affects the update flow.
    fn sync_resources(
        &self,
        settings: &Arc<dyn SettingsStore>,
        cache_dir: &Path,
        resources: &HashMap<String, String>,
    ) {
        for (key, url) in resources {
            let last_key = format!("last_resource_url:{key}");
            if settings.get(&last_key).as_deref() == Some(url.as_str()) {
                continue;
            }
            let http = self.http.clone();
            let settings = settings.clone();
            let key = key.clone();
            let url = url.clone();
            let dest = cache_dir.join(&key);
            tokio::spawn(async move {
                if let Err(e) = fetch_resource(&http, &url, &dest).await {
                    warn!("Failed to sync resource {key}: {e}");
                    return;
                }
                settings.set(&format!("resource_path:{key}"), &dest.to_string_lossy());
                settings.set(&format!("last_resource_url:{key}"), &url);
                info!("Synced resource {key} from {url}");
            });
        }
    }
}

impl Default for UpdateCheckClient {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_resource(http: &reqwest::Client, url: &str, dest: &Path) -> anyhow::Result<()> {
    let response = http
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?
        .error_for_status()?;
    let bytes = response.bytes().await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}

/// Distinct, user-facing messages per failure class; the UI shows these
/// verbatim next to a retry affordance.
fn classify_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "The update server took too long to respond.".to_owned()
    } else if e.is_connect() {
        "Could not connect to the update server. Check your internet connection or the server URL setting."
            .to_owned()
    } else {
        format!("Unexpected error while contacting the update server: {e}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySettings(Mutex<Map<String, String>>);

    impl SettingsStore for MemorySettings {
        fn get(&self, key: &str) -> Option<String> {
            self.0.lock().unwrap().get(key).cloned()
        }
        fn set(&self, key: &str, value: &str) {
            self.0.lock().unwrap().insert(key.into(), value.into());
        }
    }

    #[test]
    fn trims_trailing_slash() {
        let s = MemorySettings::default();
        s.set("update_server_url", "http://example.com/");
        assert_eq!(normalized_server_url(&s, "unused"), "http://example.com");
    }

    #[test]
    fn downgrades_local_https() {
        let s = MemorySettings::default();
        s.set("update_server_url", "https://localhost:5000");
        assert_eq!(normalized_server_url(&s, "unused"), "http://localhost:5000");
        // The fix must be persisted so it is not re-applied every tick.
        assert_eq!(
            s.get("update_server_url").as_deref(),
            Some("http://localhost:5000")
        );
    }

    #[test]
    fn strips_dashboard_suffix() {
        let s = MemorySettings::default();
        s.set("update_server_url", "http://example.com/dashboard");
        assert_eq!(normalized_server_url(&s, "unused"), "http://example.com");
    }

    #[test]
    fn falls_back_to_default_url() {
        let s = MemorySettings::default();
        assert_eq!(
            normalized_server_url(&s, "http://fallback.example"),
            "http://fallback.example"
        );
    }

    #[test]
    fn release_info_tolerates_minimal_payload() {
        let release: ReleaseInfo = serde_json::from_str(r#"{"version": "2.1.0"}"#).unwrap();
        assert_eq!(release.version, "2.1.0");
        assert!(release.download_url.is_none());
        assert!(!release.force_update);
        assert!(release.resources.is_empty());
    }
}
