//! Shared helpers for spawn integration tests.
//!
//! The spawners exec `<agent> spawn-env-setupper <workdir> --before` in the
//! forked child. Tests substitute a shell script for the agent binary: the
//! script receives the work dir as `$2` and plays the child's side of the
//! handshake.

use spawnkit::config::SpawnConfig;
use spawnkit::journey::{Journey, JourneyStepState};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable stub agent script. `body` runs with `WORK_DIR` set
/// to the spawn work directory.
pub fn write_stub_agent(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!("#!/bin/sh\nWORK_DIR=\"$2\"\n{}\n", body);
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn base_config(agent: &Path) -> SpawnConfig {
    SpawnConfig {
        app_root: "/tmp/app".to_string(),
        app_env: "production".to_string(),
        start_command: "ruby start.rb".to_string(),
        start_timeout_msec: 10_000,
        agent_path: Some(agent.to_path_buf()),
        ..SpawnConfig::default()
    }
}

/// No step may be left dangling in progress once a spawn has returned.
pub fn assert_no_step_in_progress(journey: &Journey) {
    for (step, info) in journey.steps() {
        assert_ne!(
            info.state,
            JourneyStepState::InProgress,
            "step {} was left in progress",
            step.as_str()
        );
    }
}
