//! The child-side environment setupper.
//!
//! This runs as its own program between fork and the application exec,
//! because the work it does (user database lookups, environment dumps,
//! ulimit and credential changes) is not async-signal-safe and therefore
//! cannot happen directly between `fork()` and `exec()` in the supervisor.
//!
//! It is invoked twice per direct spawn: once in `--before` mode right
//! after the fork, and once in `--after` mode on the far side of the
//! optional login shell. Every step is recorded into the work dir so the
//! supervisor can reconstruct what happened even when this process dies.

pub mod system;

use crate::config::SetupArgs;
use crate::errors::ErrorCategory;
use crate::journey::{JourneyStep, JourneyStepState};
use crate::time::monotonic_usec_coarse;
use system::ResolvedAccount;

use nix::unistd::{geteuid, initgroups, setgid, setuid};
use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

/// Which side of the optional login shell this invocation is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Before,
    After,
}

struct SetupContext {
    work_dir: PathBuf,
    mode: Mode,
    step: JourneyStep,
    start_time_usec: u64,
}

/// A fatal setup failure, materialized into the work dir before exit.
struct SetupFailure {
    category: ErrorCategory,
    summary: String,
    also_advanced: bool,
    problem_html: Option<String>,
    solution_html: Option<String>,
    /// True when the raiser already recorded the step state itself.
    step_recorded: bool,
}

impl SetupFailure {
    fn new(category: ErrorCategory, summary: impl Into<String>) -> SetupFailure {
        SetupFailure {
            category,
            summary: summary.into(),
            also_advanced: true,
            problem_html: None,
            solution_html: None,
            step_recorded: false,
        }
    }

    fn os(summary: impl Into<String>) -> SetupFailure {
        SetupFailure::new(ErrorCategory::OperatingSystemError, summary)
    }

    fn internal(summary: impl Into<String>) -> SetupFailure {
        SetupFailure::new(ErrorCategory::InternalError, summary)
    }
}

/// Entry point of the `spawn-env-setupper` role. Success paths exec into
/// the next stage and never return; any returned exit code is a failure
/// that has already been materialized into the work dir.
pub fn run(work_dir: &Path, mode: Mode) -> i32 {
    let context = SetupContext {
        work_dir: work_dir.to_path_buf(),
        mode,
        step: match mode {
            Mode::Before => JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
            Mode::After => JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
        },
        start_time_usec: monotonic_usec_coarse(),
    };

    std::env::set_var("IN_PASSENGER", "1");
    std::env::set_var("PASSENGER_SPAWN_WORK_DIR", &context.work_dir);

    record_step_complete(
        &context,
        JourneyStep::SubprocessBeforeFirstExec,
        JourneyStepState::Performed,
        context.start_time_usec,
    );
    record_step_in_progress(&context, context.step);

    match setup_and_exec(&context) {
        Err(failure) => {
            eprintln!("Error: {}", failure.summary);
            if !failure.step_recorded {
                record_step_complete(
                    &context,
                    context.step,
                    JourneyStepState::Errored,
                    context.start_time_usec,
                );
            }
            record_error_category(&context, failure.category);
            record_error_summary(&context, &failure.summary, failure.also_advanced);
            if let Some(html) = failure.problem_html {
                record_problem_description_html(&context, &html);
            }
            if let Some(html) = failure.solution_html {
                record_solution_description_html(&context, &html);
            }
            1
        }
        Ok(()) => {
            // exec never returns on success, so reaching this is a bug.
            record_step_complete(
                &context,
                context.step,
                JourneyStepState::Errored,
                context.start_time_usec,
            );
            record_error_summary(
                &context,
                "end of the spawn environment setupper reached; this is a bug",
                true,
            );
            1
        }
    }
}

fn setup_and_exec(context: &SetupContext) -> Result<(), SetupFailure> {
    let args = read_args(context)?;
    apply_log_level(&args);
    let envdump = context.work_dir.join("envdump");
    system::dump_all_environment_info(&envdump);

    let mut shell = PathBuf::from("/bin/sh");
    if context.mode == Mode::Before {
        set_default_env_vars(&args);
        system::dump_envvars(&envdump);

        let should_switch_user = args.user.is_some() && geteuid().is_root();
        let mut account = None;
        if should_switch_user {
            let resolved = lookup_account(&args)?;
            shell = resolved.shell();
            account = Some(resolved);
        } else {
            shell = system::current_user_shell();
        }

        if system::apply_fd_ulimit(args.file_descriptor_ulimit) {
            system::dump_ulimits(&envdump);
        }

        if let Some(account) = account {
            if let Some(jail_dir) = &args.cpu_jail_dir {
                system::enter_cpu_jail(jail_dir).map_err(SetupFailure::internal)?;
            }
            switch_group(&account)?;
            system::dump_user_info(&envdump);

            switch_user(&account)?;
            system::dump_envvars(&envdump);
            system::dump_user_info(&envdump);
        }
    }

    set_current_working_directory(&args)?;
    system::dump_envvars(&envdump);

    if context.mode == Mode::After {
        set_default_env_vars(&args);
        set_given_env_vars(&args);
        system::dump_envvars(&envdump);
    }

    exec_next_command(context, &args, &shell)?;
    Ok(())
}

fn read_args(context: &SetupContext) -> Result<SetupArgs, SetupFailure> {
    let path = context.work_dir.join("args.json");
    let contents = fs::read_to_string(&path).map_err(|e| {
        SetupFailure::internal(format!("Cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        SetupFailure::internal(format!("Cannot parse {}: {}", path.display(), e))
    })
}

fn apply_log_level(args: &SetupArgs) {
    if let Some(level) = &args.log_level {
        if let Ok(level) = level.parse::<log::LevelFilter>() {
            log::set_max_level(level);
        }
    }
}

fn lookup_account(args: &SetupArgs) -> Result<ResolvedAccount, SetupFailure> {
    let user = args.user.as_deref().unwrap_or_default();
    let (uid, entry) = system::resolve_user(user).map_err(SetupFailure::os)?;
    let gid = system::resolve_group(args.group.as_deref(), &entry).map_err(SetupFailure::os)?;
    Ok(ResolvedAccount { uid, gid, entry })
}

/// Install supplementary groups and the primary group. Must happen before
/// the UID switch, which drops the privilege to do so.
fn switch_group(account: &ResolvedAccount) -> Result<(), SetupFailure> {
    if let Some(entry) = &account.entry {
        let name = CString::new(entry.name.as_str()).map_err(|_| {
            SetupFailure::internal(format!("user name '{}' contains a NUL byte", entry.name))
        })?;
        initgroups(&name, account.gid).map_err(|e| {
            SetupFailure::os(format!(
                "initgroups({}, {}) failed: {}",
                entry.name, account.gid, e
            ))
        })?;
    }
    setgid(account.gid)
        .map_err(|e| SetupFailure::os(format!("setgid({}) failed: {}", account.gid, e)))
}

fn switch_user(account: &ResolvedAccount) -> Result<(), SetupFailure> {
    setuid(account.uid)
        .map_err(|e| SetupFailure::os(format!("setuid({}) failed: {}", account.uid, e)))?;
    match &account.entry {
        Some(entry) => {
            std::env::set_var("USER", &entry.name);
            std::env::set_var("LOGNAME", &entry.name);
            std::env::set_var("SHELL", &entry.shell);
            std::env::set_var("HOME", &entry.dir);
        }
        None => {
            std::env::remove_var("USER");
            std::env::remove_var("LOGNAME");
            std::env::remove_var("SHELL");
            std::env::remove_var("HOME");
        }
    }
    Ok(())
}

/// Walk every ancestor of the app root to produce a precise diagnosis for
/// permission problems, then chdir into it.
fn set_current_working_directory(args: &SetupArgs) -> Result<(), SetupFailure> {
    let app_root = absolutize(Path::new(&args.app_root))
        .map_err(|e| SetupFailure::os(format!("Cannot resolve the current directory: {}", e)))?;

    for dir in system::infer_parent_directories(&app_root) {
        match fs::metadata(&dir) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let offending = dir
                    .parent()
                    .unwrap_or_else(|| Path::new("/"))
                    .display()
                    .to_string();
                let user = system::process_user_name();
                let group = system::process_group_name();
                let mut failure = SetupFailure::os(format!(
                    "Directory '{}' is inaccessible because of a filesystem \
                     permission error",
                    offending
                ));
                failure.also_advanced = false;
                failure.problem_html = Some(format!(
                    "<p>The application server tried to start the web application \
                     as user '{user}' and group '{group}'. To do this it must be \
                     able to access the application root directory '{app_root}'. \
                     However, the parent directory '{offending}' has wrong \
                     permissions, preventing this process from accessing it.</p>",
                    user = crate::errors::escape_html(&user),
                    group = crate::errors::escape_html(&group),
                    app_root = crate::errors::escape_html(&app_root.display().to_string()),
                    offending = crate::errors::escape_html(&offending),
                ));
                failure.solution_html = Some(format!(
                    "<p class=\"sole-solution\">Please fix the permissions of the \
                     directory '{}' so that it is accessible by user '{}' and \
                     group '{}'.</p>",
                    crate::errors::escape_html(&app_root.display().to_string()),
                    crate::errors::escape_html(&user),
                    crate::errors::escape_html(&group),
                ));
                return Err(failure);
            }
            Err(e) => {
                return Err(SetupFailure::os(format!(
                    "Unable to stat() directory '{}': {}",
                    dir.display(),
                    e
                )));
            }
        }
    }

    std::env::set_current_dir(&app_root).map_err(|e| {
        let user = system::process_user_name();
        let group = system::process_group_name();
        let mut failure = SetupFailure::os(format!(
            "Unable to change the working directory to '{}': {}",
            app_root.display(),
            e
        ));
        let flavor = if e.kind() == std::io::ErrorKind::PermissionDenied {
            "filesystem permission error"
        } else {
            "filesystem error"
        };
        failure.problem_html = Some(format!(
            "<p>The application server tried to start the web application as \
             user '{}' and group '{}', with a working directory of '{}'. \
             However, it encountered a {} while doing this.</p>",
            crate::errors::escape_html(&user),
            crate::errors::escape_html(&group),
            crate::errors::escape_html(&app_root.display().to_string()),
            flavor,
        ));
        failure
    })?;

    // The app root may contain symlinks. getcwd() resolves them, but login
    // shells advertise the logical, unresolved path through PWD; do the
    // same so the application sees the path it was deployed under.
    std::env::set_var("PWD", &app_root);
    Ok(())
}

fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn set_default_env_vars(args: &SetupArgs) {
    std::env::set_var("PYTHONUNBUFFERED", "1");
    if let Some(node_libdir) = &args.node_libdir {
        std::env::set_var("NODE_PATH", node_libdir);
    }
    for key in [
        "RAILS_ENV",
        "RACK_ENV",
        "WSGI_ENV",
        "NODE_ENV",
        "PASSENGER_APP_ENV",
    ] {
        std::env::set_var(key, &args.app_env);
    }
    if let Some(port) = args.expected_start_port {
        std::env::set_var("PORT", port.to_string());
    }
    if args.base_uri != "/" {
        std::env::set_var("RAILS_RELATIVE_URL_ROOT", &args.base_uri);
        std::env::set_var("RACK_BASE_URI", &args.base_uri);
        std::env::set_var("PASSENGER_BASE_URI", &args.base_uri);
    } else {
        std::env::remove_var("RAILS_RELATIVE_URL_ROOT");
        std::env::remove_var("RACK_BASE_URI");
        std::env::remove_var("PASSENGER_BASE_URI");
    }
}

fn set_given_env_vars(args: &SetupArgs) {
    for (key, value) in &args.environment_variables {
        std::env::set_var(key, value);
    }
}

/// Exec the next stage: the login shell or the `--after` re-invocation in
/// `--before` mode, the application's start command in `--after` mode.
fn exec_next_command(
    context: &SetupContext,
    args: &SetupArgs,
    shell: &Path,
) -> Result<(), SetupFailure> {
    let mut command: Vec<String> = Vec::new();
    let next_step;

    match context.mode {
        Mode::Before => {
            if system::should_load_shell_envvars(args.load_shell_envvars, shell) {
                next_step = JourneyStep::SubprocessOsShell;
                command.push(shell.display().to_string());
                command.push("-lc".to_string());
                command.push("exec \"$@\"".to_string());
                command.push("spawn-env-setupper-shell".to_string());
            } else {
                next_step = JourneyStep::SubprocessSpawnEnvSetupperAfterShell;
            }
            command.push(args.agent_path.display().to_string());
            command.push("spawn-env-setupper".to_string());
            command.push(context.work_dir.display().to_string());
            command.push("--after".to_string());
        }
        Mode::After => {
            next_step = if args.starts_using_wrapper {
                JourneyStep::SubprocessExecWrapper
            } else {
                JourneyStep::SubprocessAppLoadOrExec
            };
            command.push("/bin/sh".to_string());
            command.push("-c".to_string());
            command.push(args.start_command.clone());
        }
    }

    let argv: Vec<CString> = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_str()).map_err(|_| {
                SetupFailure::internal(format!("command argument contains a NUL byte: {}", arg))
            })
        })
        .collect::<Result<_, _>>()?;

    let next_step_start = monotonic_usec_coarse();
    record_step_complete(
        context,
        context.step,
        JourneyStepState::Performed,
        context.start_time_usec,
    );
    record_step_in_progress(context, next_step);

    // Only returns on failure.
    let err = match nix::unistd::execvp(&argv[0], &argv) {
        Err(e) => e,
        Ok(infallible) => match infallible {},
    };

    record_step_complete(context, next_step, JourneyStepState::Errored, next_step_start);
    let mut failure = SetupFailure::os(format!(
        "Unable to execute command '{}': {}",
        command.join(" "),
        err
    ));
    failure.step_recorded = true;
    Err(failure)
}

// Work dir recording. Failures to record are reported on stderr but never
// abort: a partially recorded journey is more useful than none.

fn warn_on_error(what: &str, result: std::io::Result<()>) {
    if let Err(e) = result {
        eprintln!("Warning: cannot record {}: {}", what, e);
    }
}

fn record_step_in_progress(context: &SetupContext, step: JourneyStep) {
    let dir = context
        .work_dir
        .join("response/steps")
        .join(step.as_str_lower());
    warn_on_error(
        "step state",
        fs::create_dir_all(&dir).and_then(|_| {
            fs::write(dir.join("state"), JourneyStepState::InProgress.as_str())
        }),
    );
}

fn record_step_complete(
    context: &SetupContext,
    step: JourneyStep,
    state: JourneyStepState,
    start_time_usec: u64,
) {
    let now = monotonic_usec_coarse();
    let dir = context
        .work_dir
        .join("response/steps")
        .join(step.as_str_lower());
    warn_on_error(
        "step state",
        fs::create_dir_all(&dir).and_then(|_| fs::write(dir.join("state"), state.as_str())),
    );
    warn_on_error(
        "step duration",
        fs::write(
            dir.join("duration"),
            now.saturating_sub(start_time_usec).to_string(),
        ),
    );
}

fn record_error_category(context: &SetupContext, category: ErrorCategory) {
    warn_on_error(
        "error category",
        fs::write(
            context.work_dir.join("response/error/category"),
            category.as_str(),
        ),
    );
}

fn record_error_summary(context: &SetupContext, summary: &str, also_advanced: bool) {
    warn_on_error(
        "error summary",
        fs::write(context.work_dir.join("response/error/summary"), summary),
    );
    if also_advanced {
        warn_on_error(
            "advanced problem details",
            fs::write(
                context
                    .work_dir
                    .join("response/error/advanced_problem_details"),
                summary,
            ),
        );
    }
}

fn record_problem_description_html(context: &SetupContext, html: &str) {
    warn_on_error(
        "problem description",
        fs::write(
            context
                .work_dir
                .join("response/error/problem_description.html"),
            html,
        ),
    );
}

fn record_solution_description_html(context: &SetupContext, html: &str) {
    warn_on_error(
        "solution description",
        fs::write(
            context
                .work_dir
                .join("response/error/solution_description.html"),
            html,
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workdir::WorkDir;

    fn context_for(work_dir: &WorkDir, mode: Mode) -> SetupContext {
        SetupContext {
            work_dir: work_dir.path().to_path_buf(),
            mode,
            step: match mode {
                Mode::Before => JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
                Mode::After => JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
            },
            start_time_usec: monotonic_usec_coarse(),
        }
    }

    #[test]
    fn missing_args_json_is_an_internal_error() {
        let work_dir = WorkDir::create().unwrap();
        let context = context_for(&work_dir, Mode::Before);
        let failure = read_args(&context).unwrap_err();
        assert_eq!(failure.category, ErrorCategory::InternalError);
        assert!(failure.summary.contains("args.json"));
    }

    #[test]
    fn unparseable_args_json_is_an_internal_error() {
        let work_dir = WorkDir::create().unwrap();
        fs::write(work_dir.args_json_path(), "{not json").unwrap();
        let context = context_for(&work_dir, Mode::Before);
        let failure = read_args(&context).unwrap_err();
        assert_eq!(failure.category, ErrorCategory::InternalError);
    }

    #[test]
    fn step_records_land_in_the_work_dir() {
        let work_dir = WorkDir::create().unwrap();
        let context = context_for(&work_dir, Mode::Before);
        record_step_in_progress(&context, JourneyStep::SubprocessOsShell);
        let state = fs::read_to_string(
            work_dir
                .step_dir(JourneyStep::SubprocessOsShell)
                .join("state"),
        )
        .unwrap();
        assert_eq!(state, "STEP_IN_PROGRESS");

        record_step_complete(
            &context,
            JourneyStep::SubprocessOsShell,
            JourneyStepState::Performed,
            context.start_time_usec,
        );
        let state = fs::read_to_string(
            work_dir
                .step_dir(JourneyStep::SubprocessOsShell)
                .join("state"),
        )
        .unwrap();
        assert_eq!(state, "STEP_PERFORMED");
        let duration = fs::read_to_string(
            work_dir
                .step_dir(JourneyStep::SubprocessOsShell)
                .join("duration"),
        )
        .unwrap();
        assert!(duration.parse::<u64>().is_ok());
    }

    #[test]
    fn error_records_land_in_the_work_dir() {
        let work_dir = WorkDir::create().unwrap();
        let context = context_for(&work_dir, Mode::After);
        record_error_category(&context, ErrorCategory::OperatingSystemError);
        record_error_summary(&context, "setuid failed", true);

        assert_eq!(
            fs::read_to_string(work_dir.error_dir().join("category")).unwrap(),
            "OPERATING_SYSTEM_ERROR"
        );
        assert_eq!(
            fs::read_to_string(work_dir.error_dir().join("summary")).unwrap(),
            "setuid failed"
        );
        assert_eq!(
            fs::read_to_string(work_dir.error_dir().join("advanced_problem_details")).unwrap(),
            "setuid failed"
        );
    }

    #[test]
    fn default_env_vars_cover_the_framework_conventions() {
        let args = SetupArgs {
            app_root: "/tmp/app".to_string(),
            app_env: "staging".to_string(),
            integration_mode: "standalone".to_string(),
            base_uri: "/subapp".to_string(),
            user: None,
            group: None,
            file_descriptor_ulimit: None,
            cpu_jail_dir: None,
            environment_variables: Default::default(),
            start_command: "true".to_string(),
            starts_using_wrapper: false,
            load_shell_envvars: false,
            expected_start_port: Some(4567),
            node_libdir: Some("/opt/node_modules".to_string()),
            agent_path: PathBuf::from("/usr/bin/agent"),
            log_level: None,
        };
        set_default_env_vars(&args);
        assert_eq!(std::env::var("RAILS_ENV").unwrap(), "staging");
        assert_eq!(std::env::var("PASSENGER_APP_ENV").unwrap(), "staging");
        assert_eq!(std::env::var("PORT").unwrap(), "4567");
        assert_eq!(std::env::var("NODE_PATH").unwrap(), "/opt/node_modules");
        assert_eq!(std::env::var("RACK_BASE_URI").unwrap(), "/subapp");

        let args = SetupArgs {
            base_uri: "/".to_string(),
            ..args
        };
        set_default_env_vars(&args);
        assert!(std::env::var("RACK_BASE_URI").is_err());
    }
}
