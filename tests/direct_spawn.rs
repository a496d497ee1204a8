//! End-to-end direct spawn scenarios, driven by stub agent scripts.

mod common;

use common::{assert_no_step_in_progress, base_config, write_stub_agent};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use spawnkit::errors::ErrorCategory;
use spawnkit::journey::JourneyStep;
use spawnkit::spawner::process::os_process_exists;
use spawnkit::spawner::{DirectSpawner, Spawner};
use std::fs;
use std::time::Duration;

#[test]
fn happy_direct_spawn_reports_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_agent(
        dir.path(),
        "agent",
        r#"cat > "$WORK_DIR/response/properties.json" <<'EOF'
{"sockets":[{"name":"main","address":"unix:/tmp/app.sock","protocol":"http","concurrency":1}]}
EOF
printf 1 > "$WORK_DIR/response/finish"
read line"#,
    );

    let spawner = DirectSpawner::new(None);
    let result = spawner.spawn(&base_config(&agent)).unwrap();

    assert!(result.pid > 0);
    assert_eq!(result.sockets.len(), 1);
    assert_eq!(result.sockets[0].name, "main");
    assert_eq!(result.sockets[0].address, "unix:/tmp/app.sock");
    assert_eq!(result.sockets[0].protocol, "http");
    assert_eq!(result.sockets[0].concurrency, 1);
    assert!(result.stdin.is_some());
    assert!(os_process_exists(Pid::from_raw(result.pid)));

    let _ = kill(Pid::from_raw(result.pid), Signal::SIGKILL);
}

#[test]
fn crashing_child_surfaces_recorded_error_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_agent(
        dir.path(),
        "agent",
        r#"STEP_DIR="$WORK_DIR/response/steps/subprocess_spawn_env_setupper_before_shell"
mkdir -p "$STEP_DIR"
printf STEP_ERRORED > "$STEP_DIR/state"
printf 120000 > "$STEP_DIR/duration"
printf OPERATING_SYSTEM_ERROR > "$WORK_DIR/response/error/category"
printf 'setuid failed' > "$WORK_DIR/response/error/summary"
echo 'boom from child' >&2
exit 42"#,
    );

    let spawner = DirectSpawner::new(None);
    let error = spawner.spawn(&base_config(&agent)).unwrap_err();

    assert_eq!(error.category(), ErrorCategory::OperatingSystemError);
    assert_eq!(error.summary(), "setuid failed");
    assert_eq!(
        error.journey().first_failed_step(),
        Some(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell)
    );
    assert!(error.stdout_and_err_data().contains("boom from child"));
    assert_no_step_in_progress(error.journey());
}

#[test]
fn timeout_terminates_the_child() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    std::env::set_var("SPAWNKIT_TEST_TIMEOUT_PID_FILE", &pid_file);
    let agent = write_stub_agent(
        dir.path(),
        "agent",
        r#"echo $$ > "$SPAWNKIT_TEST_TIMEOUT_PID_FILE"
exec sleep 60"#,
    );

    let mut config = base_config(&agent);
    config.start_timeout_msec = 400;
    let spawner = DirectSpawner::new(None);
    let error = spawner.spawn(&config).unwrap_err();

    assert_eq!(error.category(), ErrorCategory::TimeoutError);
    assert_eq!(
        error.journey().first_failed_step(),
        Some(JourneyStep::SpawningKitHandshakePerform)
    );
    assert_no_step_in_progress(error.journey());

    // The deadline handler must have terminated the child.
    std::thread::sleep(Duration::from_millis(100));
    let child_pid: i32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    assert!(!os_process_exists(Pid::from_raw(child_pid)));
}

#[test]
fn unparseable_properties_fail_the_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_agent(
        dir.path(),
        "agent",
        r#"printf 'not json' > "$WORK_DIR/response/properties.json"
printf 1 > "$WORK_DIR/response/finish"
read line"#,
    );

    let spawner = DirectSpawner::new(None);
    let error = spawner.spawn(&base_config(&agent)).unwrap_err();

    assert_eq!(error.category(), ErrorCategory::InternalError);
    assert_eq!(
        error.journey().first_failed_step(),
        Some(JourneyStep::SpawningKitHandshakePerform)
    );
    assert_no_step_in_progress(error.journey());
}
