//! Handshake preparation: populate the work dir with everything the child
//! needs before the first fork.

use crate::config::SetupArgs;
use crate::errors::SpawnError;
use crate::handshake::session::HandshakeSession;
use crate::journey::JourneyStep;
use crate::types::{Result, SpawnKitError};
use nix::unistd::{geteuid, User};
use std::fs;
use std::path::PathBuf;

/// Serialize the command inputs into `args.json`, make sure the response and
/// envdump subtrees exist, and resolve the UID the spawned process is
/// expected to run as. Idempotent with respect to the work dir layout.
///
/// On failure the preparation step is marked errored and a finalized
/// [`SpawnError`] is returned.
pub fn prepare(session: &mut HandshakeSession) -> std::result::Result<(), Box<SpawnError>> {
    match prepare_inner(session) {
        Ok(()) => Ok(()),
        Err(e) => Err(session.fail_step(JourneyStep::SpawningKitPreparation, &e)),
    }
}

fn prepare_inner(session: &mut HandshakeSession) -> Result<()> {
    session.work_dir.ensure_skeleton()?;
    session.expected_uid = resolve_expected_uid(&session.config.user)?;
    session.config.integration_mode = choose_integration_mode(&session.config.integration_mode);

    // The chosen mode travels with the config from here on, so it ends up
    // both in args.json and in every error report's diagnostics.
    let agent_path = resolve_agent_path(&session.config.agent_path)?;
    let args = SetupArgs::from_config(&session.config, &agent_path);
    let payload = serde_json::to_vec_pretty(&args)
        .map_err(|e| SpawnKitError::Config(format!("Cannot serialize args.json: {}", e)))?;
    fs::write(session.work_dir.args_json_path(), payload)?;
    Ok(())
}

/// The integration mode tags which outer server this spawn serves. Callers
/// that don't integrate with one get the standalone tag.
fn choose_integration_mode(configured: &str) -> String {
    if configured.is_empty() {
        log::debug!("No integration mode configured; running standalone");
        "standalone".to_string()
    } else {
        configured.to_string()
    }
}

/// The UID the application process must end up with.
///
/// A non-root supervisor cannot switch users, so the expectation is its own
/// effective UID. A root supervisor with a configured user resolves that
/// user, accepting a numeric value when the account does not exist.
pub fn resolve_expected_uid(configured_user: &Option<String>) -> Result<u32> {
    let euid = geteuid().as_raw();
    if euid != 0 {
        return Ok(euid);
    }
    let user = match configured_user {
        Some(user) => user,
        None => return Ok(euid),
    };
    match User::from_name(user) {
        Ok(Some(entry)) => Ok(entry.uid.as_raw()),
        Ok(None) | Err(_) => {
            if let Ok(numeric) = user.parse::<u32>() {
                log::warn!(
                    "No system user database entry for '{}'; using it as a numeric UID",
                    user
                );
                Ok(numeric)
            } else {
                Err(SpawnKitError::Config(format!(
                    "Cannot lookup system user database entry for user '{}'",
                    user
                )))
            }
        }
    }
}

fn resolve_agent_path(configured: &Option<PathBuf>) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(path.clone()),
        None => std::env::current_exe().map_err(|e| {
            SpawnKitError::Config(format!("Cannot determine the agent binary path: {}", e))
        }),
    }
}
