//! Process liveness and identity probing.

use crate::types::{Result, SpawnKitError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::time::{Duration, Instant};

/// Like `waitpid(pid, WNOHANG)` but waits at most `timeout_ms` for the
/// process to exit, polling at 10 ms. Returns `None` on timeout.
pub fn timed_waitpid(pid: Pid, timeout_ms: u64) -> Result<Option<WaitStatus>> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(status) => return Ok(Some(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Whether a process with this PID exists and is not a zombie.
///
/// Some environments do not reliably reap adopted zombie processes, so a
/// plain `kill(pid, 0)` check would report a long-dead child as alive.
pub fn os_process_exists(pid: Pid) -> bool {
    match kill(pid, None) {
        Ok(()) => !is_zombie(pid),
        Err(e) => e != Errno::ESRCH,
    }
}

fn is_zombie(pid: Pid) -> bool {
    let status = match fs::read_to_string(format!("/proc/{}/status", pid.as_raw())) {
        Ok(status) => status,
        // Don't know; assume not.
        Err(_) => return false,
    };
    status
        .lines()
        .any(|line| line.starts_with("State:") && line.contains("Z ("))
}

/// Real UID of a process, from `/proc/<pid>/status`. `Ok(None)` means the
/// process does not exist.
pub fn process_uid(pid: Pid) -> Result<Option<u32>> {
    let path = format!("/proc/{}/status", pid.as_raw());
    let status = match fs::read_to_string(&path) {
        Ok(status) => status,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            let real_uid = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u32>().ok());
            return match real_uid {
                Some(uid) => Ok(Some(uid)),
                None => Err(SpawnKitError::Process(format!(
                    "Cannot parse the Uid line of {}",
                    path
                ))),
            };
        }
    }
    Err(SpawnKitError::Process(format!(
        "No Uid line found in {}",
        path
    )))
}

/// Kill a process and reap it if it is our child. Used on error paths to
/// guarantee no spawned process outlives a failed spawn attempt.
pub fn kill_and_waitpid(pid: Pid) {
    // kill(-1)/kill(0) address whole process groups; never signal those.
    if pid.as_raw() <= 1 {
        return;
    }
    let _ = kill(pid, Signal::SIGKILL);
    // Reaping fails with ECHILD for processes forked by a preloader; the
    // preloader reaps those itself.
    let _ = timed_waitpid(pid, 1000);
}

/// Terminate a process politely: SIGTERM, a short grace period, then
/// SIGKILL, then reap.
pub fn terminate_with_grace(pid: Pid, grace_ms: u64) {
    if pid.as_raw() <= 1 {
        return;
    }
    let _ = kill(pid, Signal::SIGTERM);
    let deadline = Instant::now() + Duration::from_millis(grace_ms);
    while Instant::now() < deadline {
        if !os_process_exists(pid) {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if os_process_exists(pid) {
        let _ = kill(pid, Signal::SIGKILL);
    }
    let _ = timed_waitpid(pid, 1000);
}

/// Guard that kills and reaps a child unless cleared. Ensures a spawned
/// process never survives an error path.
pub struct ChildGuard {
    pid: Option<Pid>,
}

impl ChildGuard {
    pub fn new(pid: Pid) -> ChildGuard {
        ChildGuard { pid: Some(pid) }
    }

    /// The spawn succeeded; the process is handed over to the caller.
    pub fn clear(&mut self) {
        self.pid = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid.take() {
            log::debug!("Reaping abandoned spawn child {}", pid);
            kill_and_waitpid(pid);
        }
    }
}
