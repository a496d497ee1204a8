//! The supervisor side of the post-fork handshake.
//!
//! After the child has been forked (directly or by a preloader), the
//! supervisor concurrently watches for the `response/finish` signal,
//! captures the child's stdio for later error attachment, monitors the
//! child for premature exit, and counts down the spawn deadline.

use crate::errors::{ErrorCategory, SpawnError};
use crate::handshake::session::HandshakeSession;
use crate::journey::{JourneyStep, JourneyStepState};
use crate::spawner::pipe_watcher::BackgroundIoCapturer;
use crate::spawner::process::{os_process_exists, terminate_with_grace};
use crate::time::consume_timeout;
use crate::types::{Socket, SpawnKitError, SpawnResult};
use nix::unistd::Pid;
use serde::Deserialize;
use std::fs;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL when a spawn times out.
const TERMINATION_GRACE_MS: u64 = 500;

/// Pause before harvesting stdio from a crashed child, so the capturer can
/// drain what the child wrote on its way out.
const CRASH_DRAIN_MS: u64 = 50;

#[derive(Debug, Deserialize)]
struct ResponseProperties {
    sockets: Vec<Socket>,
}

enum WatchOutcome {
    FinishSignalled,
    ChildExited,
    DeadlineExpired,
    Canceled,
}

/// Drive the handshake with a freshly spawned child until it reports
/// readiness, dies, or the deadline expires.
///
/// The caller has already marked `SPAWNING_KIT_HANDSHAKE_PERFORM` in
/// progress; this function settles that step on every path. Success is only
/// declared once `response/finish` exists, `properties.json` parsed, and
/// the child is still alive, verified in that order.
pub fn perform(
    session: &mut HandshakeSession,
    pid: i32,
    stdin: Option<File>,
    stdout_and_err: Option<File>,
) -> Result<SpawnResult, Box<SpawnError>> {
    let child = Pid::from_raw(pid);
    let capturer = stdout_and_err.map(BackgroundIoCapturer::start);

    match watch_child(session, child) {
        WatchOutcome::FinishSignalled => {
            handle_finish_signal(session, child, stdin, capturer)
        }
        WatchOutcome::ChildExited => Err(handle_premature_exit(session, capturer)),
        WatchOutcome::DeadlineExpired => Err(handle_deadline(session, child, capturer)),
        WatchOutcome::Canceled => Err(handle_cancellation(session, child, capturer)),
    }
}

fn watch_child(session: &mut HandshakeSession, child: Pid) -> WatchOutcome {
    let finish_path = session.work_dir.finish_path();
    loop {
        if session.timeout_usec == 0 {
            return WatchOutcome::DeadlineExpired;
        }
        if finish_path.exists() {
            return WatchOutcome::FinishSignalled;
        }
        if !os_process_exists(child) {
            return WatchOutcome::ChildExited;
        }
        if session.canceled() {
            return WatchOutcome::Canceled;
        }
        let started = Instant::now();
        std::thread::sleep(Duration::from_millis(10));
        consume_timeout(&mut session.timeout_usec, started);
    }
}

fn handle_finish_signal(
    session: &mut HandshakeSession,
    child: Pid,
    stdin: Option<File>,
    capturer: Option<BackgroundIoCapturer>,
) -> Result<SpawnResult, Box<SpawnError>> {
    match fs::read_to_string(session.work_dir.finish_path()) {
        Ok(contents) => {
            if contents.trim() != "1" {
                log::warn!(
                    "Spawned process {} wrote an unexpected finish signal: {:?}",
                    child,
                    contents
                );
            }
        }
        Err(e) => log::warn!("Cannot read finish signal from work dir: {}", e),
    }

    let properties = match read_response_properties(&session.work_dir.properties_path()) {
        Ok(properties) => properties,
        Err(e) => {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawningKitHandshakePerform, true);
            settle_in_progress_steps(session);
            let mut error =
                SpawnError::from_kit_error(&e, session.journey.clone(), &session.config);
            error.load_env_dump(&session.work_dir.envdump_dir());
            if let Some(capturer) = capturer {
                error.set_stdout_and_err_data(capturer.stop().1);
            }
            return Err(Box::new(error.finalize()));
        }
    };

    // A dying child may still have managed to write its response files.
    if !os_process_exists(child) {
        return Err(handle_premature_exit(session, capturer));
    }

    load_journey_state_from_response_dir(session, true);
    let _ = session
        .journey
        .set_step_performed(JourneyStep::SpawningKitHandshakePerform, false);
    settle_in_progress_steps(session);

    let stdout_and_err = capturer.and_then(|c| c.stop().0);
    Ok(SpawnResult {
        pid: child.as_raw(),
        sockets: properties.sockets,
        stdin,
        stdout_and_err,
    })
}

fn read_response_properties(path: &Path) -> Result<ResponseProperties, SpawnKitError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        SpawnKitError::Protocol(format!(
            "The spawned process signalled readiness without reporting its \
             properties ({}): {}",
            path.display(),
            e
        ))
    })?;
    let properties: ResponseProperties = serde_json::from_str(&contents).map_err(|e| {
        SpawnKitError::Protocol(format!(
            "The spawned process reported unparseable properties: {}",
            e
        ))
    })?;
    for socket in &properties.sockets {
        if socket.name.is_empty() || socket.address.is_empty() || socket.protocol.is_empty() {
            return Err(SpawnKitError::Protocol(
                "The spawned process reported a socket with missing fields".to_string(),
            ));
        }
        if socket.concurrency <= 0 {
            return Err(SpawnKitError::Protocol(format!(
                "The spawned process reported socket '{}' with a non-positive \
                 concurrency of {}",
                socket.name, socket.concurrency
            )));
        }
    }
    Ok(properties)
}

fn handle_premature_exit(
    session: &mut HandshakeSession,
    capturer: Option<BackgroundIoCapturer>,
) -> Box<SpawnError> {
    let stdio = capturer
        .map(|c| {
            std::thread::sleep(Duration::from_millis(CRASH_DRAIN_MS));
            c.stop().1
        })
        .unwrap_or_default();

    // The handshake mechanics themselves completed; the failure belongs to
    // whichever step the child recorded as errored.
    let _ = session
        .journey
        .set_step_performed(JourneyStep::SpawningKitHandshakePerform, true);
    load_journey_state_from_response_dir(session, false);
    ensure_failed_step(session);
    settle_in_progress_steps(session);

    let artifacts = read_error_artifacts(&session.work_dir.error_dir());
    let category = artifacts.category.unwrap_or(ErrorCategory::InternalError);
    let mut error = session.make_error(category);
    error.set_summary(
        artifacts
            .summary
            .unwrap_or_else(|| "The application process exited prematurely".to_string()),
    );
    if let Some(advanced) = artifacts.advanced_problem_details {
        error.set_advanced_problem_details(advanced);
    }
    if let Some(html) = artifacts.problem_html {
        error.set_problem_description_html(html);
    }
    if let Some(html) = artifacts.solution_html {
        error.set_solution_description_html(html);
    }
    error.set_stdout_and_err_data(stdio);
    Box::new(error.finalize())
}

fn handle_deadline(
    session: &mut HandshakeSession,
    child: Pid,
    capturer: Option<BackgroundIoCapturer>,
) -> Box<SpawnError> {
    log::warn!(
        "Spawned process {} did not report readiness within {} ms; terminating it",
        child,
        session.config.start_timeout_msec
    );
    terminate_with_grace(child, TERMINATION_GRACE_MS);

    let stdio = capturer.map(|c| c.stop().1).unwrap_or_default();
    let _ = session
        .journey
        .set_step_errored(JourneyStep::SpawningKitHandshakePerform, true);
    load_journey_state_from_response_dir(session, false);
    settle_in_progress_steps(session);

    let mut error = session.make_error(ErrorCategory::TimeoutError);
    error.set_summary(format!(
        "The application process failed to start within {} ms",
        session.config.start_timeout_msec
    ));
    error.set_advanced_problem_details(format!(
        "The process did not write response/finish before the {} ms deadline",
        session.config.start_timeout_msec
    ));
    error.set_solution_description_html(
        "<p class=\"sole-solution\">The timeout might be too short for this \
         application, or the application hangs during startup. Check the \
         application's startup log output, and raise the start timeout if \
         the application legitimately needs more time.</p>"
            .to_string(),
    );
    error.set_stdout_and_err_data(stdio);
    Box::new(error.finalize())
}

/// Adopt the step states and durations that the child (and, for smart
/// spawns, the preloader) recorded into `response/steps/`.
fn load_journey_state_from_response_dir(session: &mut HandshakeSession, success: bool) {
    let steps: Vec<JourneyStep> = session
        .journey
        .steps()
        .map(|(step, _)| step)
        .filter(|step| step.recorded_by_child())
        .collect();

    for step in steps {
        let dir = session.work_dir.step_dir(step);
        let state_text = match fs::read_to_string(dir.join("state")) {
            Ok(text) => text,
            Err(_) => continue,
        };
        let state = match JourneyStepState::from_str(state_text.trim()) {
            Ok(state) => state,
            Err(_) => {
                log::warn!(
                    "Ignoring unrecognized state {:?} recorded for step {}",
                    state_text.trim(),
                    step.as_str()
                );
                continue;
            }
        };
        let result = match state {
            JourneyStepState::NotStarted => Ok(()),
            JourneyStepState::Performed => session.journey.set_step_performed(step, true),
            JourneyStepState::Errored => {
                if success {
                    log::warn!(
                        "Spawn succeeded although step {} was recorded as errored",
                        step.as_str()
                    );
                    session.journey.set_step_performed(step, true)
                } else {
                    session.journey.set_step_errored(step, true)
                }
            }
            // A step still in progress when the child died is where it died.
            JourneyStepState::InProgress => {
                if success {
                    session.journey.set_step_performed(step, true)
                } else {
                    session.journey.set_step_errored(step, true)
                }
            }
        };
        if let Err(e) = result {
            log::warn!("Cannot adopt recorded state for {}: {}", step.as_str(), e);
        }

        if let Ok(duration_text) = fs::read_to_string(dir.join("duration")) {
            if let Ok(usec) = duration_text.trim().parse::<u64>() {
                let _ = session.journey.set_step_execution_duration(step, usec);
            }
        }
    }
}

/// A spawn failure must pin down a failed step. When the child died without
/// recording one, blame the first of its steps that never completed.
fn ensure_failed_step(session: &mut HandshakeSession) {
    if session.journey.first_failed_step().is_some() {
        return;
    }
    let step = session
        .journey
        .steps()
        .filter(|(step, _)| step.recorded_by_child())
        .find(|(_, info)| info.state != JourneyStepState::Performed)
        .map(|(step, _)| step);
    match step {
        Some(step) => {
            let _ = session.journey.set_step_errored(step, true);
        }
        None => {
            let _ = session
                .journey
                .set_step_errored(JourneyStep::SpawningKitHandshakePerform, true);
        }
    }
}

fn handle_cancellation(
    session: &mut HandshakeSession,
    child: Pid,
    capturer: Option<BackgroundIoCapturer>,
) -> Box<SpawnError> {
    log::info!("Spawn of process {} was interrupted; terminating it", child);
    terminate_with_grace(child, TERMINATION_GRACE_MS);

    let stdio = capturer.map(|c| c.stop().1).unwrap_or_default();
    let _ = session
        .journey
        .set_step_errored(JourneyStep::SpawningKitHandshakePerform, true);
    load_journey_state_from_response_dir(session, false);
    settle_in_progress_steps(session);

    let mut error = session.make_error(ErrorCategory::InternalError);
    error.set_summary("The spawn was interrupted before the application finished starting");
    error.set_stdout_and_err_data(stdio);
    Box::new(error.finalize())
}

/// No step may be left in progress once the spawn settles. Steps ordered
/// before the first failure were necessarily passed through; anything at or
/// after it died with the spawn.
fn settle_in_progress_steps(session: &mut HandshakeSession) {
    let first_failed = session.journey.first_failed_step();
    let in_progress: Vec<JourneyStep> = session
        .journey
        .steps()
        .filter(|(_, info)| info.state == JourneyStepState::InProgress)
        .map(|(step, _)| step)
        .collect();
    for step in in_progress {
        let failed = matches!(first_failed, Some(first) if step >= first);
        let result = if failed {
            session.journey.set_step_errored(step, true)
        } else {
            session.journey.set_step_performed(step, true)
        };
        if let Err(e) = result {
            log::warn!("Cannot settle in-progress step {}: {}", step.as_str(), e);
        }
    }
}

struct ErrorArtifacts {
    category: Option<ErrorCategory>,
    summary: Option<String>,
    advanced_problem_details: Option<String>,
    problem_html: Option<String>,
    solution_html: Option<String>,
}

fn read_error_artifacts(error_dir: &Path) -> ErrorArtifacts {
    let read = |name: &str| -> Option<String> {
        fs::read_to_string(error_dir.join(name))
            .ok()
            .map(|s| s.trim_end().to_string())
            .filter(|s| !s.is_empty())
    };
    let category = read("category").and_then(|text| match ErrorCategory::from_str(&text) {
        Ok(category) => Some(category),
        Err(_) => {
            log::warn!("Ignoring unrecognized error category {:?}", text);
            None
        }
    });
    ErrorArtifacts {
        category,
        summary: read("summary"),
        advanced_problem_details: read("advanced_problem_details"),
        problem_html: read("problem_description.html"),
        solution_html: read("solution_description.html"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpawnConfig;
    use crate::journey::JourneyType;
    use std::process::Command;

    fn test_config(timeout_msec: u64) -> SpawnConfig {
        SpawnConfig {
            app_root: "/tmp/app".to_string(),
            app_env: "production".to_string(),
            start_command: "sleep 60".to_string(),
            start_timeout_msec: timeout_msec,
            ..SpawnConfig::default()
        }
    }

    fn session_with_child(
        timeout_msec: u64,
    ) -> (HandshakeSession, std::process::Child) {
        let mut session =
            HandshakeSession::new(test_config(timeout_msec), JourneyType::SpawnDirectly).unwrap();
        session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitHandshakePerform, true)
            .unwrap();
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        (session, child)
    }

    #[test]
    fn zero_deadline_errors_immediately_with_timeout_category() {
        let (mut session, mut child) = session_with_child(0);
        let pid = child.id() as i32;
        let error = perform(&mut session, pid, None, None).unwrap_err();
        assert_eq!(error.category(), ErrorCategory::TimeoutError);
        assert_eq!(
            error.journey().first_failed_step(),
            Some(JourneyStep::SpawningKitHandshakePerform)
        );
        // The child was terminated by the deadline handler.
        assert!(!os_process_exists(Pid::from_raw(pid)));
        let _ = child.wait();
    }

    #[test]
    fn finish_signal_with_valid_properties_succeeds() {
        let (mut session, mut child) = session_with_child(10_000);
        fs::write(
            session.work_dir.properties_path(),
            r#"{"sockets":[{"name":"main","address":"unix:/tmp/app.sock","protocol":"http","concurrency":1}]}"#,
        )
        .unwrap();
        fs::write(session.work_dir.finish_path(), "1").unwrap();

        let result = perform(&mut session, child.id() as i32, None, None).unwrap();
        assert_eq!(result.pid, child.id() as i32);
        assert_eq!(result.sockets.len(), 1);
        assert_eq!(result.sockets[0].address, "unix:/tmp/app.sock");
        assert_eq!(
            session
                .journey
                .step_info(JourneyStep::SpawningKitHandshakePerform)
                .unwrap()
                .state,
            JourneyStepState::Performed
        );
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn invalid_concurrency_is_a_protocol_error() {
        let (mut session, mut child) = session_with_child(10_000);
        fs::write(
            session.work_dir.properties_path(),
            r#"{"sockets":[{"name":"main","address":"unix:/s","protocol":"http","concurrency":0}]}"#,
        )
        .unwrap();
        fs::write(session.work_dir.finish_path(), "1").unwrap();

        let error = perform(&mut session, child.id() as i32, None, None).unwrap_err();
        assert_eq!(error.category(), ErrorCategory::InternalError);
        assert!(error.summary().contains("concurrency"));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn premature_exit_harvests_error_artifacts() {
        let mut session =
            HandshakeSession::new(test_config(10_000), JourneyType::SpawnDirectly).unwrap();
        session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitHandshakePerform, true)
            .unwrap();
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();

        let step_dir = session
            .work_dir
            .step_dir(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell);
        fs::create_dir_all(&step_dir).unwrap();
        fs::write(step_dir.join("state"), "STEP_ERRORED").unwrap();
        fs::write(step_dir.join("duration"), "120000").unwrap();
        fs::write(
            session.work_dir.error_dir().join("category"),
            "OPERATING_SYSTEM_ERROR",
        )
        .unwrap();
        fs::write(session.work_dir.error_dir().join("summary"), "setuid failed").unwrap();

        let error = perform(&mut session, child.id() as i32, None, None).unwrap_err();
        assert_eq!(error.category(), ErrorCategory::OperatingSystemError);
        assert_eq!(error.summary(), "setuid failed");
        assert_eq!(
            error.journey().first_failed_step(),
            Some(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell)
        );
        let info = error
            .journey()
            .step_info(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell)
            .unwrap();
        assert_eq!(info.usec_duration(), 120_000);
    }

    #[test]
    fn premature_exit_without_artifacts_defaults_to_internal_error() {
        let mut session =
            HandshakeSession::new(test_config(10_000), JourneyType::SpawnDirectly).unwrap();
        session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitHandshakePerform, true)
            .unwrap();
        let mut child = Command::new("true").spawn().unwrap();
        child.wait().unwrap();

        let error = perform(&mut session, child.id() as i32, None, None).unwrap_err();
        assert_eq!(error.category(), ErrorCategory::InternalError);
        assert!(error.summary().contains("exited prematurely"));
        // Some step must carry the blame even without child records.
        assert!(error.journey().first_failed_step().is_some());
    }
}
