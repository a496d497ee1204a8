//! One-shot spawning: fork, exec the environment setupper, handshake.

use crate::config::SpawnConfig;
use crate::errors::SpawnError;
use crate::handshake::{perform, prepare, HandshakeSession};
use crate::journey::{JourneyStep, JourneyType};
use crate::spawner::fork::fork_env_setupper;
use crate::spawner::process::ChildGuard;
use crate::spawner::Spawner;
use crate::time::monotonic_usec;
use crate::types::SpawnResult;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Spawns application processes by forking and executing the environment
/// setupper, which in turn execs the application's start command. Every
/// spawn pays the full application load cost.
pub struct DirectSpawner {
    agent_path: Option<PathBuf>,
    last_used_usec: AtomicU64,
}

impl DirectSpawner {
    pub fn new(agent_path: Option<PathBuf>) -> DirectSpawner {
        DirectSpawner {
            agent_path,
            last_used_usec: AtomicU64::new(monotonic_usec()),
        }
    }
}

impl Spawner for DirectSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnResult, Box<SpawnError>> {
        self.last_used_usec.store(monotonic_usec(), Ordering::SeqCst);
        log::debug!("Spawning new process: app_root={}", config.app_root);

        let mut config = config.clone();
        if config.agent_path.is_none() {
            config.agent_path = self.agent_path.clone();
        }
        let mut session = HandshakeSession::new(config, JourneyType::SpawnDirectly)?;

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitPreparation, false);
        match session.config.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    log::warn!("Spawn configuration warning: {}", warning);
                }
            }
            Err(e) => return Err(session.fail_step(JourneyStep::SpawningKitPreparation, &e)),
        }
        prepare(&mut session)?;
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitPreparation, false);

        let child = fork_env_setupper(&mut session)?;
        let mut guard = ChildGuard::new(Pid::from_raw(child.pid));
        log::debug!(
            "Process forked for app_root={}: PID {}",
            session.config.app_root,
            child.pid
        );

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitHandshakePerform, false);
        let result = perform(
            &mut session,
            child.pid,
            Some(child.stdin),
            Some(child.stdout_and_err),
        )?;
        guard.clear();

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitFinish, false);
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitFinish, false);
        log::debug!(
            "Process spawning done: app_root={}, pid={}",
            session.config.app_root,
            result.pid
        );
        Ok(result)
    }

    fn last_used_usec(&self) -> u64 {
        self.last_used_usec.load(Ordering::SeqCst)
    }
}
