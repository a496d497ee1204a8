//! Spawn configuration and the argument bundle passed to the spawned child.

use crate::types::{Result, SpawnKitError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

fn default_base_uri() -> String {
    "/".to_string()
}

fn default_start_timeout_msec() -> u64 {
    90_000
}

/// Immutable description of the application to spawn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpawnConfig {
    /// Application root directory. The spawned process chdirs here.
    pub app_root: String,
    /// Application type tag, e.g. "rack", "wsgi", "node".
    #[serde(default)]
    pub app_type: String,
    /// Environment name, e.g. "production" or "development".
    pub app_env: String,
    /// How the supervisor integrates with the outer server, e.g. "nginx".
    /// Left empty, handshake preparation selects the standalone tag.
    #[serde(default)]
    pub integration_mode: String,
    /// System user to run the application as. Only honored when the
    /// supervisor runs as root.
    #[serde(default)]
    pub user: Option<String>,
    /// System group to run the application as.
    #[serde(default)]
    pub group: Option<String>,
    /// File descriptor ulimit to apply in the child before exec.
    #[serde(default)]
    pub file_descriptor_ulimit: Option<u64>,
    /// CPU resource jail (cgroup directory) to enter before switching users.
    #[serde(default)]
    pub cpu_jail_dir: Option<PathBuf>,
    /// Overall spawn deadline in milliseconds.
    #[serde(default = "default_start_timeout_msec")]
    pub start_timeout_msec: u64,
    /// Extra environment variables installed for the application.
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    /// Shell command that starts the application (or the preloader's child).
    pub start_command: String,
    /// Wrapper program that loads the application, when the app type needs
    /// one. Presence determines the wrapper steps in the journey.
    #[serde(default)]
    pub wrapper_command: Option<String>,
    /// Pass the application through the user's login shell so that shell
    /// profile environment is picked up.
    #[serde(default)]
    pub load_shell_envvars: bool,
    /// URI prefix the application is deployed under.
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
    /// Port the application is expected to listen on, exported as PORT.
    #[serde(default)]
    pub expected_start_port: Option<u16>,
    /// Node.js library directory, exported as NODE_PATH.
    #[serde(default)]
    pub node_libdir: Option<String>,
    /// Command that starts a preloader. Required for smart spawning only.
    #[serde(default)]
    pub preloader_command: Vec<String>,
    /// Path to the agent binary providing the `spawn-env-setupper` role.
    /// Defaults to the current executable.
    #[serde(default)]
    pub agent_path: Option<PathBuf>,
}

impl Default for SpawnConfig {
    fn default() -> Self {
        SpawnConfig {
            app_root: String::new(),
            app_type: String::new(),
            app_env: "production".to_string(),
            integration_mode: String::new(),
            user: None,
            group: None,
            file_descriptor_ulimit: None,
            cpu_jail_dir: None,
            start_timeout_msec: default_start_timeout_msec(),
            environment_variables: BTreeMap::new(),
            start_command: String::new(),
            wrapper_command: None,
            load_shell_envvars: false,
            base_uri: default_base_uri(),
            expected_start_port: None,
            node_libdir: None,
            preloader_command: Vec::new(),
            agent_path: None,
        }
    }
}

impl SpawnConfig {
    pub fn starts_using_wrapper(&self) -> bool {
        self.wrapper_command.is_some()
    }

    /// Validate the configuration. Hard violations are errors; recoverable
    /// oddities are returned as warnings for the caller to log.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if self.app_root.is_empty() {
            return Err(SpawnKitError::Config("app_root may not be empty".to_string()));
        }
        if !self.app_root.starts_with('/') {
            return Err(SpawnKitError::Config(format!(
                "app_root must be an absolute path, got '{}'",
                self.app_root
            )));
        }
        if self.app_env.is_empty() {
            return Err(SpawnKitError::Config("app_env may not be empty".to_string()));
        }
        if self.start_command.is_empty() {
            return Err(SpawnKitError::Config(
                "start_command may not be empty".to_string(),
            ));
        }
        if self.start_timeout_msec == 0 {
            warnings.push("start_timeout_msec is 0; every spawn will time out immediately".to_string());
        }
        if self.user.is_none() && self.group.is_some() {
            warnings.push("group is configured without user; it will be ignored".to_string());
        }
        if let Some(limit) = self.file_descriptor_ulimit {
            if limit < 3 {
                return Err(SpawnKitError::Config(format!(
                    "file_descriptor_ulimit must allow at least stdio (got {})",
                    limit
                )));
            }
        }
        Ok(warnings)
    }
}

/// The contents of `args.json`: everything the child-side environment
/// setupper needs, serialized by the supervisor during handshake
/// preparation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupArgs {
    pub app_root: String,
    pub app_env: String,
    #[serde(default)]
    pub integration_mode: String,
    #[serde(default = "default_base_uri")]
    pub base_uri: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub file_descriptor_ulimit: Option<u64>,
    #[serde(default)]
    pub cpu_jail_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
    pub start_command: String,
    #[serde(default)]
    pub starts_using_wrapper: bool,
    #[serde(default)]
    pub load_shell_envvars: bool,
    #[serde(default)]
    pub expected_start_port: Option<u16>,
    #[serde(default)]
    pub node_libdir: Option<String>,
    /// Binary that the `--before` invocation re-execs in `--after` mode.
    pub agent_path: PathBuf,
    #[serde(default)]
    pub log_level: Option<String>,
}

impl SetupArgs {
    pub fn from_config(config: &SpawnConfig, agent_path: &PathBuf) -> SetupArgs {
        SetupArgs {
            app_root: config.app_root.clone(),
            app_env: config.app_env.clone(),
            integration_mode: config.integration_mode.clone(),
            base_uri: config.base_uri.clone(),
            user: config.user.clone(),
            group: config.group.clone(),
            file_descriptor_ulimit: config.file_descriptor_ulimit,
            cpu_jail_dir: config.cpu_jail_dir.clone(),
            environment_variables: config.environment_variables.clone(),
            start_command: config.start_command.clone(),
            starts_using_wrapper: config.starts_using_wrapper(),
            load_shell_envvars: config.load_shell_envvars,
            expected_start_port: config.expected_start_port,
            node_libdir: config.node_libdir.clone(),
            agent_path: agent_path.clone(),
            log_level: std::env::var("RUST_LOG").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> SpawnConfig {
        SpawnConfig {
            app_root: "/var/www/app".to_string(),
            app_env: "production".to_string(),
            start_command: "ruby start.rb".to_string(),
            ..SpawnConfig::default()
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().unwrap().is_empty());
    }

    #[test]
    fn empty_app_root_is_rejected() {
        let config = SpawnConfig {
            app_root: String::new(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_app_root_is_rejected() {
        let config = SpawnConfig {
            app_root: "www/app".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_start_command_is_rejected() {
        let config = SpawnConfig {
            start_command: String::new(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_without_user_warns() {
        let config = SpawnConfig {
            group: Some("www-data".to_string()),
            ..valid_config()
        };
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("group"));
    }

    #[test]
    fn tiny_fd_ulimit_is_rejected() {
        let config = SpawnConfig {
            file_descriptor_ulimit: Some(2),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn setup_args_carry_wrapper_flag() {
        let config = SpawnConfig {
            wrapper_command: Some("/opt/loader".to_string()),
            ..valid_config()
        };
        let args = SetupArgs::from_config(&config, &PathBuf::from("/usr/bin/agent"));
        assert!(args.starts_using_wrapper);
        assert_eq!(args.agent_path, PathBuf::from("/usr/bin/agent"));
    }

    #[test]
    fn setup_args_carry_the_integration_mode() {
        let config = SpawnConfig {
            integration_mode: "nginx".to_string(),
            ..valid_config()
        };
        let args = SetupArgs::from_config(&config, &PathBuf::from("/usr/bin/agent"));
        assert_eq!(args.integration_mode, "nginx");
    }

    #[test]
    fn setup_args_round_trip_through_json() {
        let config = valid_config();
        let args = SetupArgs::from_config(&config, &PathBuf::from("/usr/bin/agent"));
        let json = serde_json::to_string_pretty(&args).unwrap();
        let parsed: SetupArgs = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.app_root, config.app_root);
        assert_eq!(parsed.start_command, config.start_command);
    }
}
