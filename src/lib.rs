//! spawnkit: application worker process spawning
//!
//! Creates application worker processes on behalf of an application pool,
//! either by forking directly or through a long-lived preloader, while
//! recording every phase of the spawn for post-mortem diagnostics.

pub mod cli;
pub mod config;
pub mod envsetup;
pub mod errors;
pub mod handshake;
pub mod journey;
pub mod spawner;
pub mod time;
pub mod types;
pub mod workdir;

pub use config::SpawnConfig;
pub use errors::{ErrorCategory, SpawnError};
pub use journey::{Journey, JourneyStep, JourneyStepState, JourneyType};
pub use spawner::{DirectSpawner, SmartSpawner, Spawner};
pub use types::{Socket, SpawnKitError, SpawnResult};
pub use workdir::WorkDir;
