//! Handoff to the companion installer process.
//!
//! A running executable cannot overwrite itself on common OSes, so the swap
//! is delegated to a small separate binary that waits for this process to
//! exit, replaces the file on disk and relaunches it. Because this process
//! exits right after spawning its successor, every step is recorded in a
//! diagnostic log under the OS temp dir for post-mortem debugging.

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use log::{info, warn};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

const PARENT_SEARCH_DEPTH: usize = 3;
const EMERGENCY_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

fn installer_file_name() -> &'static str {
    if cfg!(windows) { "updater.exe" } else { "updater" }
}

/// Append-only diagnostic trail for the handoff, mirrored to the normal log.
struct HandoffLog {
    path: PathBuf,
    file: Option<std::fs::File>,
}

impl HandoffLog {
    fn create() -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        let path = std::env::temp_dir().join(format!("money_tracker_update_{}.log", &short[..8]));
        let file = std::fs::File::create(&path).ok();
        Self { path, file }
    }

    fn line(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!("[Handoff] {msg}");
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(file, "{} - {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), msg);
        }
    }
}

/// Locates or provisions the companion installer, spawns it detached with
/// `(current_exe, new_exe, pid)` and returns once the spawn has settled.
/// The caller exits the process afterwards.
///
/// Every failure here is loud: the alternative is an application that can
/// never update itself again, with no way to roll back from inside.
pub async fn relaunch(current_exe: &Path, new_exe: &Path, server_base_url: &str) -> Result<()> {
    let mut log = HandoffLog::create();
    log.line("--- Update handoff started ---");

    let current_exe = std::fs::canonicalize(current_exe).unwrap_or_else(|_| current_exe.to_path_buf());
    let new_exe = std::fs::canonicalize(new_exe).unwrap_or_else(|_| new_exe.to_path_buf());
    let pid = std::process::id();
    log.line(format!("Current exe: {}", current_exe.display()));
    log.line(format!("New exe:     {}", new_exe.display()));
    log.line(format!("PID:         {pid}"));

    let installer = resolve_installer(&current_exe, server_base_url, &mut log)
        .await
        .ok_or_else(|| {
            log.line("FATAL: installer binary not found by any strategy");
            anyhow!(
                "Installer binary '{}' not found. Diagnostic log: {}",
                installer_file_name(),
                log.path.display()
            )
        })?;
    log.line(format!("Resolved installer: {}", installer.display()));

    let mut cmd = Command::new(&installer);
    cmd.arg(&current_exe)
        .arg(&new_exe)
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = installer.parent() {
        cmd.current_dir(dir);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        cmd.creation_flags(DETACHED_PROCESS);
    }

    match cmd.spawn() {
        Ok(child) => {
            log.line(format!("Installer spawned, child pid {}", child.id()));
        }
        Err(e) => {
            log.line(format!("FATAL: failed to spawn installer: {e}"));
            return Err(anyhow!(
                "Failed to launch the installer: {e}. Diagnostic log: {}",
                log.path.display()
            ));
        }
    }

    log.line("--- Application exiting to allow the update ---");
    // Let the spawn settle before the caller tears the process down.
    tokio::time::sleep(Duration::from_secs(1)).await;
    Ok(())
}

/// Ordered resolution strategies, each a plain "found or not" probe. No
/// exceptions for the expected not-found cases.
async fn resolve_installer(
    current_exe: &Path,
    server_base_url: &str,
    log: &mut HandoffLog,
) -> Option<PathBuf> {
    let exe_dir = current_exe.parent()?.to_path_buf();

    if let Some(path) = bundled_installer(&exe_dir, log) {
        return Some(path);
    }
    if let Some(path) = sibling_installer(&exe_dir, log) {
        return Some(path);
    }
    if let Some(path) = parent_installer(&exe_dir, log) {
        return Some(path);
    }
    emergency_download(server_base_url, log).await
}

/// A copy bundled with the application's embedded resources. Copied to a
/// temp scratch path so it survives this process's exit and any cleanup of
/// the install directory.
fn bundled_installer(exe_dir: &Path, log: &mut HandoffLog) -> Option<PathBuf> {
    let bundled = exe_dir.join("resources").join(installer_file_name());
    log.line(format!("Checking bundled path: {}", bundled.display()));
    if !bundled.exists() {
        return None;
    }
    let scratch = scratch_path();
    match std::fs::copy(&bundled, &scratch) {
        Ok(_) => {
            log.line(format!("Copied bundled installer to {}", scratch.display()));
            Some(scratch)
        }
        Err(e) => {
            log.line(format!("Failed to copy bundled installer: {e}, using it in place"));
            Some(bundled)
        }
    }
}

fn sibling_installer(exe_dir: &Path, log: &mut HandoffLog) -> Option<PathBuf> {
    let sibling = exe_dir.join(installer_file_name());
    log.line(format!("Checking sibling path: {}", sibling.display()));
    sibling.exists().then_some(sibling)
}

/// Bounded walk up the directory tree, tolerating unusual install layouts.
fn parent_installer(exe_dir: &Path, log: &mut HandoffLog) -> Option<PathBuf> {
    let mut dir = exe_dir.parent();
    for level in 0..PARENT_SEARCH_DEPTH {
        let parent = dir?;
        let candidate = parent.join(installer_file_name());
        log.line(format!("Searching parent level {level}: {}", candidate.display()));
        if candidate.exists() {
            return Some(candidate);
        }
        dir = parent.parent();
    }
    None
}

/// Last-resort recovery: pull the installer binary from the update server.
async fn emergency_download(server_base_url: &str, log: &mut HandoffLog) -> Option<PathBuf> {
    let url = format!("{server_base_url}/download?file={}", installer_file_name());
    log.line(format!("Installer missing everywhere, emergency download from {url}"));

    let response = match reqwest::Client::new()
        .get(&url)
        .timeout(EMERGENCY_DOWNLOAD_TIMEOUT)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            log.line(format!("Emergency download error: {e}"));
            return None;
        }
    };
    if !response.status().is_success() {
        log.line(format!("Emergency download failed: HTTP {}", response.status().as_u16()));
        return None;
    }
    let bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => {
            log.line(format!("Emergency download read error: {e}"));
            return None;
        }
    };

    let dest = scratch_path();
    if let Err(e) = std::fs::write(&dest, &bytes) {
        log.line(format!("Failed to write downloaded installer: {e}"));
        return None;
    }
    if let Err(e) = make_executable(&dest) {
        warn!("Could not mark downloaded installer executable: {e}");
    }
    log.line(format!("Emergency download successful: {}", dest.display()));
    Some(dest)
}

fn scratch_path() -> PathBuf {
    let short = uuid::Uuid::new_v4().simple().to_string();
    let suffix = if cfg!(windows) { ".exe" } else { "" };
    std::env::temp_dir().join(format!("updater_{}{suffix}", &short[..8]))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sibling_installer_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let installer = dir.path().join(installer_file_name());
        std::fs::write(&installer, b"stub").unwrap();

        let mut log = HandoffLog::create();
        let found = sibling_installer(dir.path(), &mut log);
        assert_eq!(found, Some(installer));
    }

    #[tokio::test]
    async fn parent_search_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let deep = root.path().join("a/b/c/d/e");
        std::fs::create_dir_all(&deep).unwrap();
        // Installer sits four levels above the exe dir, one past the bound.
        std::fs::write(root.path().join("a").join(installer_file_name()), b"stub").unwrap();

        let mut log = HandoffLog::create();
        assert_eq!(parent_installer(&deep, &mut log), None);

        // Within three levels it is found.
        let shallow = root.path().join("a/b/c/d");
        let found = parent_installer(&shallow, &mut log);
        assert_eq!(found, Some(root.path().join("a").join(installer_file_name())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn handoff_spawns_installer_with_current_new_and_pid() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("money-tracker");
        let staged = dir.path().join("update.tmp");
        std::fs::write(&app, b"old").unwrap();
        std::fs::write(&staged, b"new").unwrap();

        // Fake installer that records its argv and exits.
        let args_file = dir.path().join("argv.txt");
        let installer = dir.path().join(installer_file_name());
        std::fs::write(
            &installer,
            format!("#!/bin/sh\necho \"$1|$2|$3\" > {}\n", args_file.display()),
        )
        .unwrap();
        make_executable(&installer).unwrap();

        relaunch(&app, &staged, "http://127.0.0.1:1").await.unwrap();

        let recorded = std::fs::read_to_string(&args_file).unwrap();
        let parts: Vec<&str> = recorded.trim().split('|').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].ends_with("money-tracker"));
        assert!(parts[1].ends_with("update.tmp"));
        assert_eq!(parts[2], std::process::id().to_string());
    }

    #[tokio::test]
    async fn missing_installer_fails_loudly_with_log_path() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        std::fs::write(&app, b"old").unwrap();

        // No installer anywhere and the emergency server is unreachable.
        let err = relaunch(&app, &dir.path().join("new"), "http://127.0.0.1:1")
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not found"), "got: {msg}");
        assert!(msg.contains(".log"), "error must point at the diagnostic log: {msg}");
    }

    #[tokio::test]
    async fn bundled_installer_survives_in_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let resources = dir.path().join("resources");
        std::fs::create_dir_all(&resources).unwrap();
        std::fs::write(resources.join(installer_file_name()), b"bundled").unwrap();

        let mut log = HandoffLog::create();
        let found = bundled_installer(dir.path(), &mut log).unwrap();
        // The scratch copy must live outside the install dir.
        assert!(!found.starts_with(dir.path()));
        assert_eq!(std::fs::read(&found).unwrap(), b"bundled");
        let _ = std::fs::remove_file(found);
    }
}
