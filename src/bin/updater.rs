//! Companion installer that replaces the main executable after it exits.
//! Needed because a running executable cannot overwrite or delete itself on
//! common OSes. Invoked as: `updater <target_exe> <update_file> <pid>`.
//!
//! All progress is appended to `money_tracker_updater.log` in the OS temp
//! dir; by the time anything goes wrong here the parent process is gone, so
//! that file is the only post-mortem trail.

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use log::{error, info, warn};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const MAX_WAIT: Duration = Duration::from_secs(30);
const REPLACE_ATTEMPTS: u32 = 5;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 4 {
        error!("Usage: {} <target_exe> <update_file> <pid>", args[0]);
        std::process::exit(1);
    }

    let target_exe = PathBuf::from(&args[1]);
    let update_file = PathBuf::from(&args[2]);
    let pid: u32 = match args[3].parse() {
        Ok(pid) => pid,
        Err(e) => {
            error!("Invalid pid argument '{}': {e}", args[3]);
            std::process::exit(1);
        }
    };

    let mut log = FileLog::open();
    log.line(format!(
        "Updater started. Target: {}, Update: {}, PID: {pid}",
        target_exe.display(),
        update_file.display()
    ));

    wait_for_parent_exit(pid, &target_exe, &mut log);

    if let Err(e) = sanity_check(&update_file) {
        log.line(format!("FATAL: {e}"));
        std::process::exit(1);
    }

    if let Err(e) = replace_with_retries(&update_file, &target_exe, &mut log) {
        log.line(format!("FATAL: update failed: {e}"));
        // A leftover staged file would be picked up as stale state later.
        if update_file.exists() {
            match fs::remove_file(&update_file) {
                Ok(()) => log.line("Cleaned up leftover update file"),
                Err(e) => log.line(format!("Failed to clean up update file: {e}")),
            }
        }
        std::process::exit(1);
    }
    log.line("Executable replaced successfully");

    match launch_detached(&target_exe) {
        Ok(()) => log.line("Updated application relaunched"),
        Err(e) => {
            log.line(format!("Update applied, but relaunch failed: {e}"));
            std::process::exit(1);
        }
    }
}

/// Waits for the parent to exit, bounded by [`MAX_WAIT`].
///
/// Process liveness alone is not enough on Windows: the file can stay
/// locked briefly after the process disappears, so the definitive test is
/// a rename round-trip on the target itself. A pid that already exited
/// short-circuits immediately.
fn wait_for_parent_exit(pid: u32, target_exe: &Path, log: &mut FileLog) {
    log.line(format!("Waiting for process {pid} to exit..."));
    let start = Instant::now();

    while start.elapsed() < MAX_WAIT {
        if process_alive(pid) {
            thread::sleep(Duration::from_millis(500));
            continue;
        }
        if !target_exe.exists() || file_unlocked(target_exe) {
            log.line("Process exited and target file is unlocked");
            return;
        }
        log.line("Process gone but file still locked, retrying...");
        thread::sleep(Duration::from_millis(500));
    }
    warn!("Timed out waiting for process {pid}, proceeding anyway");
    log.line("WARN: wait timed out, proceeding anyway");
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(windows)]
fn process_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
        .unwrap_or(false)
}

/// The ultimate lock test: if we can rename the file and rename it back,
/// nothing holds it open.
fn file_unlocked(path: &Path) -> bool {
    let probe = path.with_extension("lockprobe");
    if fs::rename(path, &probe).is_err() {
        return false;
    }
    if let Err(e) = fs::rename(&probe, path) {
        // Should not happen; leave a loud trace rather than a missing exe.
        error!("Failed to undo lock probe rename for {}: {e}", path.display());
    }
    true
}

fn sanity_check(update_file: &Path) -> Result<()> {
    let meta = fs::metadata(update_file)
        .with_context(|| format!("Update file missing: {}", update_file.display()))?;
    if meta.len() == 0 {
        return Err(anyhow!("Update file is empty: {}", update_file.display()));
    }
    Ok(())
}

fn replace_with_retries(update_file: &Path, target_exe: &Path, log: &mut FileLog) -> Result<()> {
    let mut last_err = anyhow!("no attempts made");
    for attempt in 1..=REPLACE_ATTEMPTS {
        match replace_once(update_file, target_exe, log) {
            Ok(()) => return Ok(()),
            Err(e) => {
                log.line(format!("Attempt {attempt}/{REPLACE_ATTEMPTS} failed: {e:#}"));
                last_err = e;
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    Err(last_err)
}

/// One backup-swap-verify cycle. On a failed swap the backup is rolled
/// back so the old version keeps working.
fn replace_once(update_file: &Path, target_exe: &Path, log: &mut FileLog) -> Result<()> {
    let backup = target_exe.with_extension("bak");

    if target_exe.exists() {
        if backup.exists()
            && let Err(e) = fs::remove_file(&backup)
        {
            log.line(format!("Could not remove old backup: {e}, overwriting"));
        }
        fs::rename(target_exe, &backup).context("Failed to move current executable aside")?;
    }

    // Rename first; fall back to copy+delete for cross-filesystem moves.
    let moved = fs::rename(update_file, target_exe).or_else(|_| {
        fs::copy(update_file, target_exe)
            .and_then(|_| fs::remove_file(update_file))
            .context("Failed to copy update into place")
    });

    if let Err(e) = moved {
        rollback(&backup, target_exe, log);
        return Err(e);
    }

    let len = fs::metadata(target_exe).map(|m| m.len()).unwrap_or(0);
    if len == 0 {
        rollback(&backup, target_exe, log);
        return Err(anyhow!("Replaced executable is missing or empty"));
    }

    restore_exec_permissions(target_exe);
    if let Err(e) = fs::remove_file(&backup) {
        log.line(format!("Could not remove backup {}: {e}", backup.display()));
    }
    log.line(format!("Replacement verified, final size {len} bytes"));
    Ok(())
}

fn rollback(backup: &Path, target_exe: &Path, log: &mut FileLog) {
    if !backup.exists() {
        return;
    }
    log.line("Attempting rollback...");
    if target_exe.exists()
        && let Err(e) = fs::remove_file(target_exe)
    {
        log.line(format!("Failed to remove partial target during rollback: {e}"));
    }
    match fs::rename(backup, target_exe) {
        Ok(()) => log.line("Rollback successful"),
        Err(e) => {
            error!("CRITICAL: rollback failed, installation may be broken: {e}");
            log.line(format!("CRITICAL: rollback failed: {e}"));
        }
    }
}

#[cfg(unix)]
fn restore_exec_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o755);
        if let Err(e) = fs::set_permissions(path, perms) {
            warn!("Could not set executable permissions on {}: {e}", path.display());
        }
    }
}

#[cfg(not(unix))]
fn restore_exec_permissions(_path: &Path) {}

fn launch_detached(target_exe: &Path) -> Result<()> {
    let mut cmd = Command::new(target_exe);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    if let Some(dir) = target_exe.parent() {
        cmd.current_dir(dir);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        cmd.creation_flags(DETACHED_PROCESS);
    }
    cmd.spawn()
        .with_context(|| format!("Failed to start {}", target_exe.display()))?;
    Ok(())
}

/// Timestamped append-only log in the temp dir, mirrored to env_logger.
struct FileLog {
    file: Option<fs::File>,
}

impl FileLog {
    fn open() -> Self {
        let path = std::env::temp_dir().join("money_tracker_updater.log");
        let file = fs::OpenOptions::new().create(true).append(true).open(&path).ok();
        Self { file }
    }

    fn line(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!("{msg}");
        if let Some(file) = self.file.as_mut() {
            let _ = writeln!(file, "{} - {}", Local::now().format("%Y-%m-%d %H:%M:%S"), msg);
        }
    }
}
