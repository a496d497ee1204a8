//! Per-spawn handshake state.

use crate::config::SpawnConfig;
use crate::errors::SpawnError;
use crate::journey::{Journey, JourneyStep, JourneyType};
use crate::types::SpawnKitError;
use crate::workdir::WorkDir;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything one spawn attempt needs, bundled so that no component keeps
/// hidden global state: the config, the mutable journey, the work dir, the
/// remaining-microseconds deadline, and the UID the spawned process is
/// expected to run as.
#[derive(Debug)]
pub struct HandshakeSession {
    pub config: SpawnConfig,
    pub journey: Journey,
    pub work_dir: WorkDir,
    /// Remaining budget for the whole spawn. Every blocking operation
    /// subtracts the time it consumed.
    pub timeout_usec: u64,
    /// UID the spawned process must end up with. Verified after smart
    /// spawns, recorded for diagnostics on direct spawns.
    pub expected_uid: u32,
    /// Cooperative cancellation flag, checked at every suspension point.
    cancel_flag: Arc<AtomicBool>,
}

impl HandshakeSession {
    /// Create the session state for one spawn attempt. Work dir creation is
    /// the only fallible part; a failure is reported as an errored
    /// preparation step.
    pub fn new(config: SpawnConfig, journey_type: JourneyType) -> Result<Self, Box<SpawnError>> {
        let journey = Journey::new(journey_type, config.starts_using_wrapper());
        let work_dir = match WorkDir::create() {
            Ok(work_dir) => work_dir,
            Err(e) => {
                let mut journey = journey;
                let _ = journey.set_step_errored(JourneyStep::SpawningKitPreparation, true);
                return Err(Box::new(
                    SpawnError::from_kit_error(&e, journey, &config).finalize(),
                ));
            }
        };
        let timeout_usec = config.start_timeout_msec.saturating_mul(1000);
        Ok(HandshakeSession {
            config,
            journey,
            work_dir,
            timeout_usec,
            expected_uid: nix::unistd::geteuid().as_raw(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle that lets another thread interrupt this spawn. Best effort:
    /// the flag is polled at the suspension points.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    pub fn canceled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Mark `step` errored (forcing if necessary) and convert an
    /// infrastructure error into a finalized [`SpawnError`] that carries the
    /// current journey snapshot. This is the annotation guard every
    /// failure path funnels through.
    pub fn fail_step(&mut self, step: JourneyStep, err: &SpawnKitError) -> Box<SpawnError> {
        let _ = self.journey.set_step_errored(step, true);
        let mut spawn_error = SpawnError::from_kit_error(err, self.journey.clone(), &self.config);
        spawn_error.load_env_dump(&self.work_dir.envdump_dir());
        Box::new(spawn_error.finalize())
    }

    /// Build a [`SpawnError`] of the given category against the current
    /// journey, with the work dir's environment dump attached.
    pub fn make_error(&self, category: crate::errors::ErrorCategory) -> SpawnError {
        let mut spawn_error = SpawnError::new(category, self.journey.clone(), &self.config);
        spawn_error.load_env_dump(&self.work_dir.envdump_dir());
        spawn_error
    }
}
