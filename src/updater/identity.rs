//! Stable per-machine identifier for check-in correlation.
//!
//! Purely analytics: a degraded (random) id weakens server-side dedup but
//! never blocks update checks, so nothing in here returns an error.

use crate::settings::SettingsStore;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::process::Command;
use std::sync::{Arc, OnceLock};

const FALLBACK_KEY: &str = "client_id_fallback";

pub struct ClientIdentity {
    settings: Arc<dyn SettingsStore>,
    cached: OnceLock<String>,
}

impl ClientIdentity {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            cached: OnceLock::new(),
        }
    }

    /// Resolves the machine id, computing it at most once per process.
    ///
    /// Resolution order: hostname + arch + platform machine UUID; then
    /// hostname + arch + NIC-MAC node id; then a random UUID persisted so
    /// later processes sharing the settings store stay stable.
    pub fn get_or_create(&self) -> String {
        self.cached
            .get_or_init(|| {
                let id = self.resolve();
                // Mirrored for support/debugging, never read back.
                self.settings.set("client_id", &id);
                id
            })
            .clone()
    }

    fn resolve(&self) -> String {
        let host = hostname().unwrap_or_default();
        let platform = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);

        if let Some(uuid) = machine_uuid() {
            debug!("Client id derived from platform machine UUID");
            return digest(&[&host, &platform, &uuid]);
        }

        if let Some(node) = mac_node_id() {
            debug!("Client id derived from NIC MAC node id");
            return digest(&[&host, &platform, &node]);
        }

        if let Some(existing) = self.settings.get(FALLBACK_KEY) {
            return existing;
        }

        warn!("No hardware identifier available, generating random client id");
        let random = uuid::Uuid::new_v4().to_string();
        let id = digest(&[&random]);
        self.settings.set(FALLBACK_KEY, &id);
        id
    }
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn hostname() -> Option<String> {
    for var in ["COMPUTERNAME", "HOSTNAME"] {
        if let Ok(name) = std::env::var(var)
            && !name.trim().is_empty()
        {
            return Some(name.trim().to_owned());
        }
    }
    command_line("hostname", &[])
}

/// Best-effort platform machine UUID; `None` when the tool or file is
/// missing, which just moves us down the fallback chain.
fn machine_uuid() -> Option<String> {
    match std::env::consts::OS {
        "windows" => command_line(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "Get-CimInstance -Class Win32_ComputerSystemProduct | Select-Object -ExpandProperty UUID",
            ],
        )
        .or_else(|| {
            command_line("wmic", &["csproduct", "get", "uuid"])
                .and_then(|out| out.lines().nth(1).map(|l| l.trim().to_owned()))
                .filter(|s| !s.is_empty())
        }),
        "linux" => std::fs::read_to_string("/etc/machine-id")
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty()),
        "macos" => command_line("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"]).and_then(|out| {
            out.lines()
                .find(|l| l.contains("IOPlatformUUID"))
                .and_then(|l| l.split('"').nth(3))
                .map(str::to_owned)
        }),
        _ => None,
    }
}

/// MAC address of the first non-loopback interface, if discoverable.
fn mac_node_id() -> Option<String> {
    if std::env::consts::OS == "linux" {
        let entries = std::fs::read_dir("/sys/class/net").ok()?;
        for entry in entries.flatten() {
            if entry.file_name() == "lo" {
                continue;
            }
            if let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) {
                let mac = mac.trim();
                if !mac.is_empty() && mac != "00:00:00:00:00:00" {
                    return Some(mac.to_owned());
                }
            }
        }
        return None;
    }

    let output = if std::env::consts::OS == "windows" {
        command_line("getmac", &["/FO", "CSV", "/NH"])?
    } else {
        command_line("ifconfig", &["-a"])?
    };
    output
        .split_whitespace()
        .flat_map(|tok| tok.split(','))
        .map(|tok| tok.trim_matches('"'))
        .find(|tok| looks_like_mac(tok))
        .map(str::to_owned)
}

fn looks_like_mac(s: &str) -> bool {
    let sep = if s.contains(':') { ':' } else { '-' };
    let octets: Vec<&str> = s.split(sep).collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
        && s != "00:00:00:00:00:00"
}

fn command_line(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemorySettings(Mutex<HashMap<String, String>>);

    impl SettingsStore for MemorySettings {
        fn get(&self, key: &str) -> Option<String> {
            self.0.lock().unwrap().get(key).cloned()
        }
        fn set(&self, key: &str, value: &str) {
            self.0.lock().unwrap().insert(key.into(), value.into());
        }
    }

    #[test]
    fn stable_within_a_process() {
        let identity = ClientIdentity::new(Arc::new(MemorySettings::default()));
        let a = identity.get_or_create();
        let b = identity.get_or_create();
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn stable_across_instances_sharing_a_store() {
        // Hardware-derived ids are deterministic; the random fallback is
        // persisted. Either way two instances over one store must agree.
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
        let a = ClientIdentity::new(settings.clone()).get_or_create();
        let b = ClientIdentity::new(settings).get_or_create();
        assert_eq!(a, b);
    }

    #[test]
    fn persisted_fallback_is_reused() {
        let settings: Arc<dyn SettingsStore> = Arc::new(MemorySettings::default());
        settings.set(FALLBACK_KEY, "previously-persisted-id");
        let identity = ClientIdentity::new(settings.clone());
        // Only observable when the hardware paths fail, but the persisted
        // value must survive untouched either way.
        let _ = identity.get_or_create();
        assert_eq!(
            settings.get(FALLBACK_KEY).as_deref(),
            Some("previously-persisted-id")
        );
    }

    #[test]
    fn mac_detection() {
        assert!(looks_like_mac("aa:bb:cc:dd:ee:ff"));
        assert!(looks_like_mac("AA-BB-CC-00-11-22"));
        assert!(!looks_like_mac("00:00:00:00:00:00"));
        assert!(!looks_like_mac("not-a-mac"));
        assert!(!looks_like_mac("aa:bb:cc:dd:ee"));
    }
}
