//! Spawn journey bookkeeping.
//!
//! A journey records every phase of a single spawn as a typed, ordered state
//! machine. Each participant (supervisor, preloader, subprocess) reports the
//! steps it owns; the supervisor assembles the global picture and uses it to
//! answer "where did this spawn die?".

use crate::time::monotonic_usec_coarse;
use crate::types::{Result, SpawnKitError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Which spawn flow this journey describes. Determines the step set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JourneyType {
    SpawnDirectly,
    StartPreloader,
    SpawnThroughPreloader,
}

impl JourneyType {
    pub fn as_str(self) -> &'static str {
        match self {
            JourneyType::SpawnDirectly => "SPAWN_DIRECTLY",
            JourneyType::StartPreloader => "START_PRELOADER",
            JourneyType::SpawnThroughPreloader => "SPAWN_THROUGH_PRELOADER",
        }
    }
}

impl FromStr for JourneyType {
    type Err = SpawnKitError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "SPAWN_DIRECTLY" => Ok(JourneyType::SpawnDirectly),
            "START_PRELOADER" => Ok(JourneyType::StartPreloader),
            "SPAWN_THROUGH_PRELOADER" => Ok(JourneyType::SpawnThroughPreloader),
            other => Err(SpawnKitError::Journey(format!(
                "Unknown journey type '{}'",
                other
            ))),
        }
    }
}

/// One phase of a spawn. The declaration order is the journey order;
/// `first_failed_step` relies on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JourneyStep {
    // Steps in the supervisor / spawning kit
    SpawningKitPreparation,
    SpawningKitForkSubprocess,
    SpawningKitConnectToPreloader,
    SpawningKitSendCommandToPreloader,
    SpawningKitReadResponseFromPreloader,
    SpawningKitParseResponseFromPreloader,
    SpawningKitProcessResponseFromPreloader,
    SpawningKitHandshakePerform,
    SpawningKitFinish,

    // Steps in the preloader, when spawning a worker process
    PreloaderPreparation,
    PreloaderForkSubprocess,
    PreloaderSendResponse,
    PreloaderFinish,

    // Steps in the subprocess
    SubprocessBeforeFirstExec,
    SubprocessSpawnEnvSetupperBeforeShell,
    SubprocessOsShell,
    SubprocessSpawnEnvSetupperAfterShell,
    SubprocessExecWrapper,
    SubprocessWrapperPreparation,
    SubprocessAppLoadOrExec,
    SubprocessPrepareAfterForkingFromPreloader,
    SubprocessListen,
    SubprocessFinish,
}

/// All steps in journey order. Used when merging step records that a child
/// process wrote into the work dir.
pub const ALL_STEPS: &[JourneyStep] = &[
    JourneyStep::SpawningKitPreparation,
    JourneyStep::SpawningKitForkSubprocess,
    JourneyStep::SpawningKitConnectToPreloader,
    JourneyStep::SpawningKitSendCommandToPreloader,
    JourneyStep::SpawningKitReadResponseFromPreloader,
    JourneyStep::SpawningKitParseResponseFromPreloader,
    JourneyStep::SpawningKitProcessResponseFromPreloader,
    JourneyStep::SpawningKitHandshakePerform,
    JourneyStep::SpawningKitFinish,
    JourneyStep::PreloaderPreparation,
    JourneyStep::PreloaderForkSubprocess,
    JourneyStep::PreloaderSendResponse,
    JourneyStep::PreloaderFinish,
    JourneyStep::SubprocessBeforeFirstExec,
    JourneyStep::SubprocessSpawnEnvSetupperBeforeShell,
    JourneyStep::SubprocessOsShell,
    JourneyStep::SubprocessSpawnEnvSetupperAfterShell,
    JourneyStep::SubprocessExecWrapper,
    JourneyStep::SubprocessWrapperPreparation,
    JourneyStep::SubprocessAppLoadOrExec,
    JourneyStep::SubprocessPrepareAfterForkingFromPreloader,
    JourneyStep::SubprocessListen,
    JourneyStep::SubprocessFinish,
];

impl JourneyStep {
    pub fn as_str(self) -> &'static str {
        match self {
            JourneyStep::SpawningKitPreparation => "SPAWNING_KIT_PREPARATION",
            JourneyStep::SpawningKitForkSubprocess => "SPAWNING_KIT_FORK_SUBPROCESS",
            JourneyStep::SpawningKitConnectToPreloader => "SPAWNING_KIT_CONNECT_TO_PRELOADER",
            JourneyStep::SpawningKitSendCommandToPreloader => {
                "SPAWNING_KIT_SEND_COMMAND_TO_PRELOADER"
            }
            JourneyStep::SpawningKitReadResponseFromPreloader => {
                "SPAWNING_KIT_READ_RESPONSE_FROM_PRELOADER"
            }
            JourneyStep::SpawningKitParseResponseFromPreloader => {
                "SPAWNING_KIT_PARSE_RESPONSE_FROM_PRELOADER"
            }
            JourneyStep::SpawningKitProcessResponseFromPreloader => {
                "SPAWNING_KIT_PROCESS_RESPONSE_FROM_PRELOADER"
            }
            JourneyStep::SpawningKitHandshakePerform => "SPAWNING_KIT_HANDSHAKE_PERFORM",
            JourneyStep::SpawningKitFinish => "SPAWNING_KIT_FINISH",
            JourneyStep::PreloaderPreparation => "PRELOADER_PREPARATION",
            JourneyStep::PreloaderForkSubprocess => "PRELOADER_FORK_SUBPROCESS",
            JourneyStep::PreloaderSendResponse => "PRELOADER_SEND_RESPONSE",
            JourneyStep::PreloaderFinish => "PRELOADER_FINISH",
            JourneyStep::SubprocessBeforeFirstExec => "SUBPROCESS_BEFORE_FIRST_EXEC",
            JourneyStep::SubprocessSpawnEnvSetupperBeforeShell => {
                "SUBPROCESS_SPAWN_ENV_SETUPPER_BEFORE_SHELL"
            }
            JourneyStep::SubprocessOsShell => "SUBPROCESS_OS_SHELL",
            JourneyStep::SubprocessSpawnEnvSetupperAfterShell => {
                "SUBPROCESS_SPAWN_ENV_SETUPPER_AFTER_SHELL"
            }
            JourneyStep::SubprocessExecWrapper => "SUBPROCESS_EXEC_WRAPPER",
            JourneyStep::SubprocessWrapperPreparation => "SUBPROCESS_WRAPPER_PREPARATION",
            JourneyStep::SubprocessAppLoadOrExec => "SUBPROCESS_APP_LOAD_OR_EXEC",
            JourneyStep::SubprocessPrepareAfterForkingFromPreloader => {
                "SUBPROCESS_PREPARE_AFTER_FORKING_FROM_PRELOADER"
            }
            JourneyStep::SubprocessListen => "SUBPROCESS_LISTEN",
            JourneyStep::SubprocessFinish => "SUBPROCESS_FINISH",
        }
    }

    /// Lowercase form used for `response/steps/<step>/` directory names.
    pub fn as_str_lower(self) -> String {
        self.as_str().to_ascii_lowercase()
    }

    /// Whether this step is recorded by the subprocess or the preloader
    /// rather than by the supervisor itself.
    pub fn recorded_by_child(self) -> bool {
        matches!(
            self,
            JourneyStep::PreloaderPreparation
                | JourneyStep::PreloaderForkSubprocess
                | JourneyStep::PreloaderSendResponse
                | JourneyStep::PreloaderFinish
                | JourneyStep::SubprocessBeforeFirstExec
                | JourneyStep::SubprocessSpawnEnvSetupperBeforeShell
                | JourneyStep::SubprocessOsShell
                | JourneyStep::SubprocessSpawnEnvSetupperAfterShell
                | JourneyStep::SubprocessExecWrapper
                | JourneyStep::SubprocessWrapperPreparation
                | JourneyStep::SubprocessAppLoadOrExec
                | JourneyStep::SubprocessPrepareAfterForkingFromPreloader
                | JourneyStep::SubprocessListen
                | JourneyStep::SubprocessFinish
        )
    }
}

impl FromStr for JourneyStep {
    type Err = SpawnKitError;

    fn from_str(value: &str) -> Result<Self> {
        for step in ALL_STEPS {
            if step.as_str() == value {
                return Ok(*step);
            }
        }
        Err(SpawnKitError::Journey(format!(
            "Unknown journey step '{}'",
            value
        )))
    }
}

/// State of a single journey step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JourneyStepState {
    NotStarted,
    InProgress,
    Performed,
    Errored,
}

impl JourneyStepState {
    pub fn as_str(self) -> &'static str {
        match self {
            JourneyStepState::NotStarted => "STEP_NOT_STARTED",
            JourneyStepState::InProgress => "STEP_IN_PROGRESS",
            JourneyStepState::Performed => "STEP_PERFORMED",
            JourneyStepState::Errored => "STEP_ERRORED",
        }
    }
}

impl FromStr for JourneyStepState {
    type Err = SpawnKitError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "STEP_NOT_STARTED" => Ok(JourneyStepState::NotStarted),
            "STEP_IN_PROGRESS" => Ok(JourneyStepState::InProgress),
            "STEP_PERFORMED" => Ok(JourneyStepState::Performed),
            "STEP_ERRORED" => Ok(JourneyStepState::Errored),
            other => Err(SpawnKitError::Journey(format!(
                "Unknown journey step state '{}'",
                other
            ))),
        }
    }
}

/// Per-step record. Times are coarse monotonic microseconds; both are zero
/// while the step has not started.
#[derive(Clone, Copy, Debug, Default)]
pub struct JourneyStepInfo {
    pub state: JourneyStepState,
    pub start_time_usec: u64,
    pub end_time_usec: u64,
}

impl Default for JourneyStepState {
    fn default() -> Self {
        JourneyStepState::NotStarted
    }
}

impl JourneyStepInfo {
    pub fn usec_duration(&self) -> u64 {
        self.end_time_usec.saturating_sub(self.start_time_usec)
    }
}

/// Ordered record of every step of one spawn.
///
/// The step set is fixed at construction from the journey type and the
/// `using_wrapper` flag. Transitions follow
/// `NOT_STARTED -> IN_PROGRESS -> {PERFORMED, ERRORED}`; a `force` flag
/// overrides the source-state check, e.g. when adopting a state another
/// process reported through the work dir.
#[derive(Clone, Debug)]
pub struct Journey {
    journey_type: JourneyType,
    using_wrapper: bool,
    steps: BTreeMap<JourneyStep, JourneyStepInfo>,
}

impl Journey {
    pub fn new(journey_type: JourneyType, using_wrapper: bool) -> Journey {
        let mut journey = Journey {
            journey_type,
            using_wrapper,
            steps: BTreeMap::new(),
        };
        match journey_type {
            JourneyType::SpawnDirectly | JourneyType::StartPreloader => {
                journey.fill_in_steps_for_direct_style_journey()
            }
            JourneyType::SpawnThroughPreloader => {
                journey.fill_in_steps_for_spawn_through_preloader_journey()
            }
        }
        journey
    }

    fn insert_step(&mut self, step: JourneyStep) {
        self.steps.insert(step, JourneyStepInfo::default());
    }

    fn fill_in_steps_for_direct_style_journey(&mut self) {
        self.insert_step(JourneyStep::SpawningKitPreparation);
        self.insert_step(JourneyStep::SpawningKitForkSubprocess);
        self.insert_step(JourneyStep::SpawningKitHandshakePerform);
        self.insert_step(JourneyStep::SpawningKitFinish);

        self.insert_step(JourneyStep::SubprocessBeforeFirstExec);
        self.insert_step(JourneyStep::SubprocessSpawnEnvSetupperBeforeShell);
        self.insert_step(JourneyStep::SubprocessOsShell);
        self.insert_step(JourneyStep::SubprocessSpawnEnvSetupperAfterShell);
        if self.using_wrapper {
            self.insert_step(JourneyStep::SubprocessExecWrapper);
            self.insert_step(JourneyStep::SubprocessWrapperPreparation);
        }
        self.insert_step(JourneyStep::SubprocessAppLoadOrExec);
        self.insert_step(JourneyStep::SubprocessListen);
        self.insert_step(JourneyStep::SubprocessFinish);
    }

    fn fill_in_steps_for_spawn_through_preloader_journey(&mut self) {
        self.insert_step(JourneyStep::SpawningKitPreparation);
        self.insert_step(JourneyStep::SpawningKitConnectToPreloader);
        self.insert_step(JourneyStep::SpawningKitSendCommandToPreloader);
        self.insert_step(JourneyStep::SpawningKitReadResponseFromPreloader);
        self.insert_step(JourneyStep::SpawningKitParseResponseFromPreloader);
        self.insert_step(JourneyStep::SpawningKitProcessResponseFromPreloader);
        self.insert_step(JourneyStep::SpawningKitHandshakePerform);
        self.insert_step(JourneyStep::SpawningKitFinish);

        self.insert_step(JourneyStep::PreloaderPreparation);
        self.insert_step(JourneyStep::PreloaderForkSubprocess);
        self.insert_step(JourneyStep::PreloaderSendResponse);
        self.insert_step(JourneyStep::PreloaderFinish);

        self.insert_step(JourneyStep::SubprocessPrepareAfterForkingFromPreloader);
        self.insert_step(JourneyStep::SubprocessListen);
        self.insert_step(JourneyStep::SubprocessFinish);
    }

    pub fn journey_type(&self) -> JourneyType {
        self.journey_type
    }

    pub fn using_wrapper(&self) -> bool {
        self.using_wrapper
    }

    pub fn has_step(&self, step: JourneyStep) -> bool {
        self.steps.contains_key(&step)
    }

    pub fn step_info(&self, step: JourneyStep) -> Result<&JourneyStepInfo> {
        self.steps.get(&step).ok_or_else(|| {
            SpawnKitError::Journey(format!("Invalid step {}", step.as_str()))
        })
    }

    fn step_info_mut(&mut self, step: JourneyStep) -> Result<&mut JourneyStepInfo> {
        self.steps.get_mut(&step).ok_or_else(|| {
            SpawnKitError::Journey(format!("Invalid step {}", step.as_str()))
        })
    }

    /// Iterate over all steps of this journey in order.
    pub fn steps(&self) -> impl Iterator<Item = (JourneyStep, &JourneyStepInfo)> {
        self.steps.iter().map(|(step, info)| (*step, info))
    }

    /// The first step in journey order whose state is errored, if any.
    pub fn first_failed_step(&self) -> Option<JourneyStep> {
        self.steps
            .iter()
            .find(|(_, info)| info.state == JourneyStepState::Errored)
            .map(|(step, _)| *step)
    }

    /// The step currently marked in progress, if any.
    pub fn current_step(&self) -> Option<JourneyStep> {
        self.steps
            .iter()
            .find(|(_, info)| info.state == JourneyStepState::InProgress)
            .map(|(step, _)| *step)
    }

    pub fn set_step_not_started(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let info = self.step_info_mut(step)?;
        if info.state == JourneyStepState::NotStarted
            || info.state == JourneyStepState::InProgress
            || force
        {
            info.state = JourneyStepState::NotStarted;
            info.start_time_usec = 0;
            info.end_time_usec = 0;
            Ok(())
        } else {
            Err(SpawnKitError::Journey(format!(
                "Unable to reset journey step {} because it already completed",
                step.as_str()
            )))
        }
    }

    pub fn set_step_in_progress(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let now = monotonic_usec_coarse();
        let info = self.step_info_mut(step)?;
        if info.state == JourneyStepState::InProgress {
            return Ok(());
        }
        if info.state == JourneyStepState::NotStarted || force {
            info.state = JourneyStepState::InProgress;
            // A forced transition must not overwrite a previously recorded end time.
            if info.end_time_usec == 0 {
                info.start_time_usec = now;
            }
            Ok(())
        } else {
            Err(SpawnKitError::Journey(format!(
                "Unable to change state for journey step {} because it was \
                 already in progress or completed",
                step.as_str()
            )))
        }
    }

    pub fn set_step_performed(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let now = monotonic_usec_coarse();
        let info = self.step_info_mut(step)?;
        if info.state == JourneyStepState::Performed {
            return Ok(());
        }
        if info.state == JourneyStepState::InProgress || force {
            info.state = JourneyStepState::Performed;
            if info.end_time_usec == 0 {
                info.end_time_usec = now;
            }
            Ok(())
        } else {
            Err(SpawnKitError::Journey(format!(
                "Unable to change state for journey step {} because it wasn't \
                 already in progress",
                step.as_str()
            )))
        }
    }

    pub fn set_step_errored(&mut self, step: JourneyStep, force: bool) -> Result<()> {
        let now = monotonic_usec_coarse();
        let info = self.step_info_mut(step)?;
        if info.state == JourneyStepState::Errored {
            return Ok(());
        }
        if info.state == JourneyStepState::InProgress || force {
            info.state = JourneyStepState::Errored;
            if info.end_time_usec == 0 {
                info.end_time_usec = now;
            }
            Ok(())
        } else {
            Err(SpawnKitError::Journey(format!(
                "Unable to change state for journey step {} because it wasn't \
                 already in progress",
                step.as_str()
            )))
        }
    }

    /// Adopt a duration that another process measured and transferred through
    /// the work dir. The local start/end pair is replaced by the override.
    pub fn set_step_execution_duration(
        &mut self,
        step: JourneyStep,
        usec_duration: u64,
    ) -> Result<()> {
        let info = self.step_info_mut(step)?;
        info.start_time_usec = 0;
        info.end_time_usec = usec_duration;
        Ok(())
    }

    /// Render as JSON: `{ type, steps: { STEP_NAME: { state, usec_duration } } }`.
    pub fn inspect_as_json(&self) -> Value {
        let mut steps = serde_json::Map::new();
        for (step, info) in &self.steps {
            steps.insert(
                step.as_str().to_string(),
                json!({
                    "state": info.state.as_str(),
                    "usec_duration": info.usec_duration(),
                }),
            );
        }
        json!({
            "type": self.journey_type.as_str(),
            "steps": steps,
        })
    }

    /// Rebuild a journey from its rendered form.
    ///
    /// The rendering carries durations, not start/end pairs, so the parsed
    /// journey stores each duration as an execution-duration override.
    pub fn from_json(doc: &Value) -> Result<Journey> {
        let type_str = doc
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SpawnKitError::Journey("Missing journey type".to_string()))?;
        let journey_type = type_str.parse::<JourneyType>()?;
        let steps = doc
            .get("steps")
            .and_then(Value::as_object)
            .ok_or_else(|| SpawnKitError::Journey("Missing journey steps".to_string()))?;

        let using_wrapper = steps.contains_key(JourneyStep::SubprocessExecWrapper.as_str());
        let mut journey = Journey::new(journey_type, using_wrapper);

        for (name, entry) in steps {
            let step = name.as_str().parse::<JourneyStep>()?;
            if !journey.has_step(step) {
                return Err(SpawnKitError::Journey(format!(
                    "Step {} does not belong to a {} journey",
                    name,
                    journey_type.as_str()
                )));
            }
            let state = entry
                .get("state")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    SpawnKitError::Journey(format!("Missing state for step {}", name))
                })?
                .parse::<JourneyStepState>()?;
            let duration = entry
                .get("usec_duration")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let info = journey.step_info_mut(step)?;
            info.state = state;
            info.start_time_usec = 0;
            info.end_time_usec = duration;
        }
        Ok(journey)
    }
}

/// Equality is over observable state: the step set, each step's state and
/// its duration. Raw start/end timestamps are process-local and excluded.
impl PartialEq for Journey {
    fn eq(&self, other: &Journey) -> bool {
        if self.journey_type != other.journey_type || self.steps.len() != other.steps.len() {
            return false;
        }
        self.steps.iter().zip(other.steps.iter()).all(|(a, b)| {
            a.0 == b.0
                && a.1.state == b.1.state
                && a.1.usec_duration() == b.1.usec_duration()
        })
    }
}

impl Eq for Journey {}
