//! System-level helpers for the environment setupper: account lookups,
//! ulimits, the CPU resource jail, and environment dumps.

use nix::unistd::{getegid, geteuid, getuid, Gid, Group, Uid, User};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// The account the child will switch to, resolved from the configured
/// user/group names with a numeric fallback.
pub struct ResolvedAccount {
    pub uid: Uid,
    pub gid: Gid,
    /// The passwd entry, when the configured user exists in the user
    /// database. A purely numeric fallback has no entry.
    pub entry: Option<User>,
}

impl ResolvedAccount {
    pub fn shell(&self) -> PathBuf {
        match &self.entry {
            Some(entry) => entry.shell.clone(),
            None => PathBuf::from("/bin/sh"),
        }
    }
}

pub fn looks_like_positive_number(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
}

/// Look up a user by name. A lookup miss for a numeric-looking name falls
/// back to the literal UID with a warning instead of a hard error.
pub fn resolve_user(name: &str) -> Result<(Uid, Option<User>), String> {
    match User::from_name(name) {
        Ok(Some(entry)) => Ok((entry.uid, Some(entry))),
        Ok(None) | Err(_) if looks_like_positive_number(name) => {
            eprintln!(
                "Warning: no system user database entry for user '{}'; \
                 using it as a numeric UID",
                name
            );
            match name.parse::<u32>() {
                Ok(uid) => Ok((Uid::from_raw(uid), None)),
                Err(_) => Err(format!("user '{}' is out of range for a UID", name)),
            }
        }
        Ok(None) => Err(format!(
            "Cannot look up the system user database entry for user '{}'",
            name
        )),
        Err(e) => Err(format!(
            "Cannot look up the system user database entry for user '{}': {}",
            name, e
        )),
    }
}

/// Look up a group by name with the same numeric fallback as
/// [`resolve_user`]. With no group configured, the user's primary group is
/// used, or the current effective group as a last resort.
pub fn resolve_group(name: Option<&str>, user_entry: &Option<User>) -> Result<Gid, String> {
    let name = match name {
        Some(name) => name,
        None => {
            return Ok(user_entry
                .as_ref()
                .map(|entry| entry.gid)
                .unwrap_or_else(getegid));
        }
    };
    match Group::from_name(name) {
        Ok(Some(entry)) => Ok(entry.gid),
        Ok(None) | Err(_) if looks_like_positive_number(name) => {
            eprintln!(
                "Warning: no system group database entry for group '{}'; \
                 using it as a numeric GID",
                name
            );
            match name.parse::<u32>() {
                Ok(gid) => Ok(Gid::from_raw(gid)),
                Err(_) => Err(format!("group '{}' is out of range for a GID", name)),
            }
        }
        Ok(None) => Err(format!(
            "Cannot look up the system group database entry for group '{}'",
            name
        )),
        Err(e) => Err(format!(
            "Cannot look up the system group database entry for group '{}': {}",
            name, e
        )),
    }
}

/// Shell of the user we are currently running as; `/bin/sh` when the user
/// database has no answer.
pub fn current_user_shell() -> PathBuf {
    match User::from_uid(getuid()) {
        Ok(Some(entry)) => entry.shell,
        Ok(None) | Err(_) => {
            eprintln!(
                "Warning: cannot look up the system user database entry for \
                 UID {}; defaulting the shell to /bin/sh",
                getuid()
            );
            PathBuf::from("/bin/sh")
        }
    }
}

/// A login shell pass-through is only done when explicitly requested and
/// the user's shell is one we know honors `-lc`.
pub fn should_load_shell_envvars(requested: bool, shell: &Path) -> bool {
    if !requested {
        return false;
    }
    matches!(
        shell.file_name().and_then(|n| n.to_str()),
        Some("bash") | Some("zsh") | Some("ksh")
    )
}

/// Apply the configured file descriptor ulimit. Returns whether a limit was
/// applied; failure is reported on stderr but not fatal.
pub fn apply_fd_ulimit(limit: Option<u64>) -> bool {
    let limit = match limit {
        Some(limit) => limit,
        None => return false,
    };
    let rlim = libc::rlimit {
        rlim_cur: limit as libc::rlim_t,
        rlim_max: limit as libc::rlim_t,
    };
    loop {
        // SAFETY: plain syscall on a stack-allocated struct.
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
        if rc == 0 {
            return true;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        eprintln!(
            "Error: unable to set the file descriptor ulimit to {}: {}",
            limit, err
        );
        return false;
    }
}

/// Process-attach interfaces a CPU resource jail may expose, probed in
/// order of preference (unified cgroup hierarchy before legacy).
const JAIL_ATTACH_INTERFACES: &[&str] = &["cgroup.procs", "tasks"];

/// Confine this process to the configured CPU resource jail before the
/// credential switch drops the privilege to do so. The jail is a cgroup
/// directory; this process's PID goes into whichever attach interface the
/// jail exposes.
pub fn enter_cpu_jail(jail_dir: &Path) -> Result<(), String> {
    let attach_file = JAIL_ATTACH_INTERFACES
        .iter()
        .map(|interface| jail_dir.join(interface))
        .find(|candidate| candidate.exists())
        .ok_or_else(|| {
            format!(
                "'{}' does not look like a CPU resource jail: it exposes \
                 none of the known process attach interfaces ({})",
                jail_dir.display(),
                JAIL_ATTACH_INTERFACES.join(", ")
            )
        })?;
    std::fs::write(&attach_file, std::process::id().to_string()).map_err(|e| {
        format!(
            "cannot move this process into the CPU resource jail via '{}': {}",
            attach_file.display(),
            e
        )
    })
}

/// Username of the current process, for diagnostics.
pub fn process_user_name() -> String {
    match User::from_uid(geteuid()) {
        Ok(Some(entry)) => entry.name,
        _ => geteuid().to_string(),
    }
}

/// Group name of the current process, for diagnostics.
pub fn process_group_name() -> String {
    match Group::from_gid(getegid()) {
        Ok(Some(entry)) => entry.name,
        _ => getegid().to_string(),
    }
}

/// Every ancestor of `path` from the filesystem root down, ending with
/// `path` itself. The root directory is omitted.
pub fn infer_parent_directories(path: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = path.ancestors().map(Path::to_path_buf).collect();
    dirs.reverse();
    dirs.retain(|dir| dir != Path::new("/") && !dir.as_os_str().is_empty());
    dirs
}

pub fn dump_envvars(envdump_dir: &Path) {
    let mut out = String::new();
    for (key, value) in std::env::vars_os() {
        out.push_str(&key.to_string_lossy());
        out.push('=');
        out.push_str(&value.to_string_lossy());
        out.push('\n');
    }
    if let Err(e) = std::fs::write(envdump_dir.join("envvars"), out) {
        eprintln!("Warning: cannot dump environment variables: {}", e);
    }
}

pub fn dump_user_info(envdump_dir: &Path) {
    dump_command_output(envdump_dir.join("user_info"), "id", &[]);
}

pub fn dump_ulimits(envdump_dir: &Path) {
    dump_command_output(envdump_dir.join("ulimits"), "sh", &["-c", "ulimit -a"]);
}

pub fn dump_all_environment_info(envdump_dir: &Path) {
    dump_envvars(envdump_dir);
    dump_user_info(envdump_dir);
    dump_ulimits(envdump_dir);
}

fn dump_command_output(target: PathBuf, program: &str, args: &[&str]) {
    let file = match File::create(&target) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: cannot create {}: {}", target.display(), e);
            return;
        }
    };
    let result = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        eprintln!("Warning: cannot run {} for {}: {}", program, target.display(), e);
        let _ = File::create(&target).and_then(|mut f| f.write_all(b""));
    }
}
