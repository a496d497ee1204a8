//! Spawner implementations.
//!
//! A spawner turns a [`SpawnConfig`] into a running application process.
//! [`direct::DirectSpawner`] pays the full application load cost on every
//! spawn; [`smart::SmartSpawner`] keeps a preloader around and asks it to
//! fork pre-loaded workers instead.

pub mod direct;
pub(crate) mod fork;
pub mod pipe_watcher;
pub mod process;
pub mod smart;

use crate::config::SpawnConfig;
use crate::errors::SpawnError;
use crate::types::SpawnResult;

pub use direct::DirectSpawner;
pub use smart::SmartSpawner;

/// Common interface of all spawners.
pub trait Spawner {
    /// Spawn one application process. On failure the returned error carries
    /// the journey snapshot and all harvested diagnostics.
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnResult, Box<SpawnError>>;

    /// Whether this spawner holds background resources worth cleaning up
    /// when the application pool evicts it.
    fn cleanable(&self) -> bool {
        false
    }

    /// Release background resources (e.g. stop a preloader).
    fn cleanup(&self) {}

    /// Monotonic microsecond timestamp of the last spawn activity.
    fn last_used_usec(&self) -> u64;
}
