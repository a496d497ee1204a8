//! Forking and executing the environment setupper.
//!
//! Shared by the direct spawner and the preloader start path: both produce
//! a child running `<agent> spawn-env-setupper <workdir> --before` with its
//! stdin on one pipe and its combined stdout/stderr on another.

use crate::handshake::HandshakeSession;
use crate::journey::JourneyStep;
use crate::types::SpawnKitError;
use crate::errors::SpawnError;
use nix::unistd::{fork, pipe, ForkResult};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};

pub(crate) struct ForkedChild {
    pub pid: i32,
    pub stdin: File,
    pub stdout_and_err: File,
}

/// Fork and exec the environment setupper for this session's work dir.
///
/// Journey bookkeeping: marks `SPAWNING_KIT_FORK_SUBPROCESS` and
/// `SUBPROCESS_BEFORE_FIRST_EXEC` in progress, settles the fork step, and
/// on failure resets the subprocess step since no subprocess ever existed.
pub(crate) fn fork_env_setupper(
    session: &mut HandshakeSession,
) -> Result<ForkedChild, Box<SpawnError>> {
    let _ = session
        .journey
        .set_step_in_progress(JourneyStep::SpawningKitForkSubprocess, false);
    let _ = session
        .journey
        .set_step_in_progress(JourneyStep::SubprocessBeforeFirstExec, false);

    let exec = match prepare_exec_args(session) {
        Ok(exec) => exec,
        Err(e) => return Err(fail_fork(session, &e)),
    };
    let pipes = match create_stdio_pipes() {
        Ok(pipes) => pipes,
        Err(e) => return Err(fail_fork(session, &e)),
    };

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // SAFETY: between fork and exec only async-signal-safe calls are
            // allowed. Everything here is raw libc on pre-built buffers.
            unsafe {
                reset_signal_handlers_and_mask();
                libc::dup2(pipes.stdin_read.as_raw_fd(), 0);
                libc::dup2(pipes.out_write.as_raw_fd(), 1);
                libc::dup2(pipes.out_write.as_raw_fd(), 2);
                close_descriptors_above_stderr();
                libc::execvp(exec.argv[0].as_ptr(), exec.argv_ptrs.as_ptr());
                let msg = b"Error: cannot execute the spawn environment setupper\n";
                libc::write(2, msg.as_ptr().cast(), msg.len());
                libc::_exit(1)
            }
        }
        Ok(ForkResult::Parent { child }) => {
            let _ = session
                .journey
                .set_step_performed(JourneyStep::SpawningKitForkSubprocess, false);
            drop(pipes.stdin_read);
            drop(pipes.out_write);
            Ok(ForkedChild {
                pid: child.as_raw(),
                stdin: File::from(pipes.stdin_write),
                stdout_and_err: File::from(pipes.out_read),
            })
        }
        Err(e) => {
            let err = SpawnKitError::Process(format!("Cannot fork a new process: {}", e));
            Err(fail_fork(session, &err))
        }
    }
}

fn fail_fork(session: &mut HandshakeSession, err: &SpawnKitError) -> Box<SpawnError> {
    let _ = session
        .journey
        .set_step_not_started(JourneyStep::SubprocessBeforeFirstExec, true);
    session.fail_step(JourneyStep::SpawningKitForkSubprocess, err)
}

struct StdioPipes {
    stdin_read: OwnedFd,
    stdin_write: OwnedFd,
    out_read: OwnedFd,
    out_write: OwnedFd,
}

fn create_stdio_pipes() -> Result<StdioPipes, SpawnKitError> {
    let (stdin_read, stdin_write) = pipe()?;
    let (out_read, out_write) = pipe()?;
    Ok(StdioPipes {
        stdin_read,
        stdin_write,
        out_read,
        out_write,
    })
}

pub(crate) struct ExecArgs {
    pub argv: Vec<CString>,
    pub argv_ptrs: Vec<*const libc::c_char>,
}

pub(crate) fn prepare_exec_args(session: &HandshakeSession) -> Result<ExecArgs, SpawnKitError> {
    let agent_path = match &session.config.agent_path {
        Some(path) => path.clone(),
        None => std::env::current_exe()?,
    };
    let agent = agent_path
        .to_str()
        .ok_or_else(|| SpawnKitError::Config("agent path is not valid UTF-8".to_string()))?;
    let work_dir = session
        .work_dir
        .path()
        .to_str()
        .ok_or_else(|| SpawnKitError::Config("work dir path is not valid UTF-8".to_string()))?;

    let argv: Vec<CString> = [agent, "spawn-env-setupper", work_dir, "--before"]
        .iter()
        .map(|arg| {
            CString::new(*arg)
                .map_err(|_| SpawnKitError::Config(format!("argument contains NUL: {}", arg)))
        })
        .collect::<Result<_, _>>()?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());
    Ok(ExecArgs { argv, argv_ptrs })
}

/// Restore default signal dispositions and an empty signal mask.
/// Async-signal-safe.
unsafe fn reset_signal_handlers_and_mask() {
    for signum in 1..32 {
        if signum == libc::SIGKILL || signum == libc::SIGSTOP {
            continue;
        }
        libc::signal(signum, libc::SIG_DFL);
    }
    let mut set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut());
}

/// Close every descriptor above stderr. Prefers close_range, falls back to
/// a bounded close loop. Async-signal-safe.
unsafe fn close_descriptors_above_stderr() {
    #[cfg(target_os = "linux")]
    {
        const SYS_CLOSE_RANGE: libc::c_long = 436;
        if libc::syscall(SYS_CLOSE_RANGE, 3, libc::c_uint::MAX, 0) == 0 {
            return;
        }
    }
    for fd in 3..1024 {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnConfig;
    use crate::journey::JourneyType;
    use std::path::PathBuf;

    #[test]
    fn exec_args_follow_the_setupper_contract() {
        let config = SpawnConfig {
            app_root: "/tmp/app".to_string(),
            app_env: "production".to_string(),
            start_command: "true".to_string(),
            agent_path: Some(PathBuf::from("/usr/local/bin/agent")),
            ..SpawnConfig::default()
        };
        let session = HandshakeSession::new(config, JourneyType::SpawnDirectly).unwrap();
        let exec = prepare_exec_args(&session).unwrap();
        assert_eq!(exec.argv[0].to_str().unwrap(), "/usr/local/bin/agent");
        assert_eq!(exec.argv[1].to_str().unwrap(), "spawn-env-setupper");
        assert_eq!(exec.argv[3].to_str().unwrap(), "--before");
        assert_eq!(exec.argv_ptrs.len(), 5);
        assert!(exec.argv_ptrs[4].is_null());
    }
}
