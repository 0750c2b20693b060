//! Process liveness checks.

use std::path::Path;
use std::time::Duration;

/// Upper bound on a working-directory scan.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(2);

/// Parent links followed before giving up on an ancestry walk.
const MAX_ANCESTRY: usize = 64;

/// Check whether a process with `pid` exists.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Check whether any other process has its working directory inside `dir`.
///
/// This process and its descendants (plugins it spawned, for instance) do not
/// count. Gives up and reports `false` after [`SCAN_TIMEOUT`].
pub async fn process_in_dir(dir: &Path) -> bool {
    let Ok(dir) = dir.canonicalize() else {
        return false;
    };
    match tokio::time::timeout(SCAN_TIMEOUT, scan(dir)).await {
        Ok(found) => found,
        Err(_) => {
            log::debug!("Process scan timed out");
            false
        }
    }
}

#[cfg(target_os = "linux")]
async fn scan(dir: std::path::PathBuf) -> bool {
    tokio::task::spawn_blocking(move || scan_proc(&dir)).await.unwrap_or(false)
}

/// Whether `pid` is `ancestor` or one of its descendants.
#[cfg_attr(not(unix), allow(dead_code))]
fn descends_from(pid: u32, ancestor: u32, parent_of: impl Fn(u32) -> Option<u32>) -> bool {
    let mut current = pid;
    for _ in 0..MAX_ANCESTRY {
        if current == ancestor {
            return true;
        }
        match parent_of(current) {
            Some(parent) if parent > 1 && parent != current => current = parent,
            _ => return false,
        }
    }
    false
}

#[cfg(target_os = "linux")]
fn scan_proc(dir: &Path) -> bool {
    let own = std::process::id();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|pid| {
            std::fs::read_link(format!("/proc/{}/cwd", pid)).is_ok_and(|cwd| cwd.starts_with(dir))
        })
        .any(|pid| !descends_from(pid, own, proc_parent))
}

/// Parent pid from `/proc/<pid>/stat` (the field after the state).
#[cfg(target_os = "linux")]
fn proc_parent(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn scan(dir: std::path::PathBuf) -> bool {
    use std::collections::HashMap;

    let output = tokio::process::Command::new("lsof")
        .args(["-a", "-d", "cwd", "-FpRn"])
        .kill_on_drop(true)
        .output()
        .await;
    let Ok(output) = output else {
        return false;
    };

    // Field output: `p<pid>`, then `R<ppid>`, then `n<cwd>` per process.
    let mut parents = HashMap::new();
    let mut candidates = Vec::new();
    let mut current = 0u32;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.parse().unwrap_or(0);
        } else if let Some(ppid) = line.strip_prefix('R') {
            if let Ok(ppid) = ppid.parse::<u32>() {
                parents.insert(current, ppid);
            }
        } else if let Some(path) = line.strip_prefix('n')
            && Path::new(path).starts_with(&dir)
        {
            candidates.push(current);
        }
    }

    let own = std::process::id();
    candidates
        .into_iter()
        .any(|pid| pid != 0 && !descends_from(pid, own, |p| parents.get(&p).copied()))
}

#[cfg(not(unix))]
async fn scan(_dir: std::path::PathBuf) -> bool {
    false
}
