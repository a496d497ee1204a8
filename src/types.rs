/// Core types shared across the spawning kit.
use serde::{Deserialize, Serialize};
use std::fs::File;
use thiserror::Error;

/// A socket the spawned application reported in `response/properties.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Socket {
    /// Identifier chosen by the application, e.g. "main".
    pub name: String,
    /// Address in `unix:/path` or `tcp://host:port` form.
    pub address: String,
    /// Protocol spoken on this socket, e.g. "http" or "preloader".
    pub protocol: String,
    /// Number of concurrent requests the socket accepts. Must be positive.
    pub concurrency: i32,
}

/// Outcome of a successful spawn.
#[derive(Debug)]
pub struct SpawnResult {
    /// OS process ID of the spawned application process.
    pub pid: i32,
    /// Sockets the application listens on.
    pub sockets: Vec<Socket>,
    /// Write end of the process's stdin channel, if one was established.
    pub stdin: Option<File>,
    /// Read end of the process's combined stdout/stderr channel, if any.
    pub stdout_and_err: Option<File>,
}

impl SpawnResult {
    /// The socket advertising the preloader command protocol, if present.
    pub fn find_preloader_socket(&self) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.protocol == "preloader")
    }
}

/// Infrastructure error type for spawning kit internals.
///
/// This covers the plumbing: filesystem, syscalls, protocol and journey
/// bookkeeping. User-facing spawn failures are materialized separately as
/// [`crate::errors::SpawnError`] with full diagnostics attached.
#[derive(Error, Debug)]
pub enum SpawnKitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call error: {0}")]
    Syscall(#[from] nix::errno::Errno),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Journey error: {0}")]
    Journey(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for spawning kit operations.
pub type Result<T> = std::result::Result<T, SpawnKitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_round_trips_through_json() {
        let socket = Socket {
            name: "main".to_string(),
            address: "unix:/tmp/app.sock".to_string(),
            protocol: "http".to_string(),
            concurrency: 4,
        };
        let json = serde_json::to_string(&socket).unwrap();
        let parsed: Socket = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, socket);
    }

    #[test]
    fn find_preloader_socket_matches_protocol() {
        let result = SpawnResult {
            pid: 123,
            sockets: vec![
                Socket {
                    name: "main".to_string(),
                    address: "unix:/tmp/a.sock".to_string(),
                    protocol: "http".to_string(),
                    concurrency: 1,
                },
                Socket {
                    name: "control".to_string(),
                    address: "unix:/tmp/b.sock".to_string(),
                    protocol: "preloader".to_string(),
                    concurrency: 1,
                },
            ],
            stdin: None,
            stdout_and_err: None,
        };
        assert_eq!(result.find_preloader_socket().unwrap().name, "control");
    }
}
