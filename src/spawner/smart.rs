//! Spawning through a long-lived preloader process.
//!
//! The preloader loads the application code once and forks workers on
//! demand, which avoids paying the load cost on every spawn. The supervisor
//! talks to it over a line-delimited JSON protocol on the command socket the
//! preloader advertises during its own startup handshake.

use crate::config::SpawnConfig;
use crate::errors::{escape_html, load_annotations_from_dir, ErrorCategory, SpawnError};
use crate::handshake::{perform, prepare, HandshakeSession};
use crate::journey::{Journey, JourneyStep, JourneyType};
use crate::spawner::fork::fork_env_setupper;
use crate::spawner::pipe_watcher::{watch_and_log_output, BackgroundIoCapturer};
use crate::spawner::process::{
    kill_and_waitpid, os_process_exists, process_uid, timed_waitpid, ChildGuard,
};
use crate::spawner::Spawner;
use crate::time::{consume_timeout, monotonic_usec};
use crate::types::{SpawnKitError, SpawnResult};
use nix::unistd::Pid;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Upper bound on one preloader response line. Exceeding it is treated as a
/// preloader bug, not an I/O hiccup.
const MAX_RESPONSE_LINE_LEN: usize = 10240;

/// How long a preloader gets to exit after its stdin closes before it is
/// killed.
const PRELOADER_STOP_TIMEOUT_MS: u64 = 5000;

/// Preloader channel state. Guarded by the coarse spawner lock; populated
/// exactly while the preloader is up.
#[derive(Default)]
struct PreloaderChannel {
    socket_address: String,
    stdin: Option<File>,
    annotations: BTreeMap<String, String>,
}

/// Read-mostly fields queried by background supervisors. Guarded by the
/// fine lock so liveness probes never block an in-flight spawn.
struct SimpleFields {
    pid: i32,
    last_used_usec: u64,
}

/// Spawns application processes by asking a preloader to fork them.
///
/// Lifecycle: DOWN (no preloader) -> STARTING (inside `start_preloader`) ->
/// UP (command socket known). A crashed preloader is restarted at most once
/// per spawn call.
pub struct SmartSpawner {
    agent_path: Option<PathBuf>,
    config: SpawnConfig,
    channel: Mutex<PreloaderChannel>,
    simple: Mutex<SimpleFields>,
}

enum ForkCommandError {
    /// Connect/send/read failed with an I/O or OS error: the preloader is
    /// presumed dead and a single restart is warranted.
    Crashed {
        step: JourneyStep,
        err: SpawnKitError,
    },
    /// Anything else: surfaced directly, no restart.
    Fatal(Box<SpawnError>),
}

struct PreloaderForkResult {
    pid: i32,
    stdin: Option<File>,
    stdout_and_err: Option<File>,
    guard: ChildGuard,
}

impl SmartSpawner {
    /// `config` must carry a non-empty `preloader_command`.
    pub fn new(
        config: SpawnConfig,
        agent_path: Option<PathBuf>,
    ) -> Result<SmartSpawner, SpawnKitError> {
        if config.preloader_command.is_empty() {
            return Err(SpawnKitError::Config(
                "preloader_command may not be empty for smart spawning".to_string(),
            ));
        }
        Ok(SmartSpawner {
            agent_path,
            config,
            channel: Mutex::new(PreloaderChannel::default()),
            simple: Mutex::new(SimpleFields {
                pid: -1,
                last_used_usec: monotonic_usec(),
            }),
        })
    }

    fn lock_channel(&self) -> MutexGuard<'_, PreloaderChannel> {
        self.channel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_simple(&self) -> MutexGuard<'_, SimpleFields> {
        self.simple.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// PID of the running preloader, or -1 when it is down.
    pub fn preloader_pid(&self) -> i32 {
        self.lock_simple().pid
    }

    fn preloader_started(&self) -> bool {
        self.preloader_pid() != -1
    }

    fn touch_last_used(&self) {
        self.lock_simple().last_used_usec = monotonic_usec();
    }

    fn spawn_with_channel(
        &self,
        channel: &mut PreloaderChannel,
        config: &SpawnConfig,
    ) -> Result<SpawnResult, Box<SpawnError>> {
        if config.app_root != self.config.app_root {
            return Err(self.mismatch_error(config));
        }
        if !self.preloader_started() {
            self.start_preloader(channel)?;
        }

        let mut spawn_config = config.clone();
        if spawn_config.agent_path.is_none() {
            spawn_config.agent_path = self.agent_path.clone();
        }
        let mut session =
            HandshakeSession::new(spawn_config, JourneyType::SpawnThroughPreloader)?;

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

        let mut fork_result = self.invoke_fork_command(channel, &mut session)?;
        log::debug!(
            "Process forked for app_root={}: PID {}",
            session.config.app_root,
            fork_result.pid
        );

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitHandshakePerform, false);
        let result = perform(
            &mut session,
            fork_result.pid,
            fork_result.stdin.take(),
            fork_result.stdout_and_err.take(),
        )?;
        fork_result.guard.clear();

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

    fn mismatch_error(&self, config: &SpawnConfig) -> Box<SpawnError> {
        let mut journey =
            Journey::new(JourneyType::SpawnThroughPreloader, config.starts_using_wrapper());
        let _ = journey.set_step_errored(JourneyStep::SpawningKitPreparation, true);
        let err = SpawnKitError::Config(format!(
            "This spawner serves app_root '{}', not '{}'",
            self.config.app_root, config.app_root
        ));
        Box::new(SpawnError::from_kit_error(&err, journey, config).finalize())
    }

    /// Start the preloader and perform its startup handshake. On success the
    /// channel holds the command socket address, the preloader's stdin, and
    /// the annotations it dumped.
    fn start_preloader(
        &self,
        channel: &mut PreloaderChannel,
    ) -> Result<(), Box<SpawnError>> {
        log::debug!("Spawning new preloader: app_root={}", self.config.app_root);

        let mut config = self.config.clone();
        config.start_command = self.config.preloader_command.join(" ");
        if config.agent_path.is_none() {
            config.agent_path = self.agent_path.clone();
        }
        let mut session = HandshakeSession::new(config, JourneyType::StartPreloader)?;

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitPreparation, false);
        prepare(&mut session)?;
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitPreparation, false);

        let child = fork_env_setupper(&mut session)?;
        let mut guard = ChildGuard::new(Pid::from_raw(child.pid));
        log::debug!(
            "Preloader process forked for app_root={}: PID {}",
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

        let socket_address = match result.find_preloader_socket() {
            Some(socket) => socket.address.clone(),
            None => {
                let err = SpawnKitError::Protocol(
                    "The preloader did not advertise a command socket \
                     (no socket with protocol \"preloader\")"
                        .to_string(),
                );
                return Err(session.fail_step(JourneyStep::SpawningKitHandshakePerform, &err));
            }
        };

        guard.clear();
        channel.socket_address = socket_address.clone();
        channel.stdin = result.stdin;
        channel.annotations =
            load_annotations_from_dir(&session.work_dir.annotations_dir());
        self.lock_simple().pid = result.pid;

        if let Some(output) = result.stdout_and_err {
            watch_and_log_output(output, result.pid);
        }
        log::info!(
            "Preloader for {} started on PID {}, listening on {}",
            session.config.app_root,
            result.pid,
            socket_address
        );
        Ok(())
    }

    /// Stop the preloader: close its stdin as the graceful-stop signal, wait
    /// up to five seconds, escalate to SIGKILL, and unlink a UNIX-domain
    /// command socket.
    fn stop_preloader(&self, channel: &mut PreloaderChannel) {
        let pid = self.preloader_pid();
        if pid == -1 {
            return;
        }
        log::debug!("Stopping preloader with PID {}", pid);

        channel.stdin.take();
        match timed_waitpid(Pid::from_raw(pid), PRELOADER_STOP_TIMEOUT_MS) {
            Ok(Some(_)) => {}
            Ok(None) => {
                log::debug!("Preloader did not exit in time, killing it...");
                kill_and_waitpid(Pid::from_raw(pid));
            }
            Err(e) => {
                log::debug!("Cannot wait for preloader {}: {}", pid, e);
                if os_process_exists(Pid::from_raw(pid)) {
                    kill_and_waitpid(Pid::from_raw(pid));
                }
            }
        }

        // Unlink after the process has exited, so the preloader never sees
        // its socket file disappear while still serving.
        if let Some(path) = parse_unix_socket_path(&channel.socket_address) {
            let _ = std::fs::remove_file(path);
        }

        channel.socket_address.clear();
        channel.annotations.clear();
        self.lock_simple().pid = -1;
    }

    /// Ask the preloader to fork a worker. On an I/O-class failure the
    /// preloader is restarted and the command retried exactly once.
    fn invoke_fork_command(
        &self,
        channel: &mut PreloaderChannel,
        session: &mut HandshakeSession,
    ) -> Result<PreloaderForkResult, Box<SpawnError>> {
        match self.internal_invoke_fork_command(channel, session) {
            Ok(result) => Ok(result),
            Err(ForkCommandError::Fatal(e)) => Err(e),
            Err(ForkCommandError::Crashed { err, .. }) => {
                log::warn!("An error occurred while spawning a process: {}", err);
                log::warn!(
                    "The application preloader seems to have crashed, restarting \
                     it and trying again..."
                );

                // These steps will be redone by the retry; they must not read
                // as failed in the final journey.
                let _ = session
                    .journey
                    .set_step_not_started(JourneyStep::SpawningKitConnectToPreloader, true);
                let _ = session
                    .journey
                    .set_step_not_started(JourneyStep::SpawningKitSendCommandToPreloader, true);
                let _ = session
                    .journey
                    .set_step_not_started(JourneyStep::SpawningKitReadResponseFromPreloader, true);

                self.stop_preloader(channel);
                self.start_preloader(channel)?;

                match self.internal_invoke_fork_command(channel, session) {
                    Ok(result) => Ok(result),
                    Err(ForkCommandError::Fatal(e)) => Err(e),
                    Err(ForkCommandError::Crashed { step, err }) => {
                        self.stop_preloader(channel);
                        let _ = session.journey.set_step_errored(step, true);
                        let mut error =
                            session.make_error(ErrorCategory::infer_from(&err));
                        error.set_summary(format!("An application preloader crashed: {}", err));
                        error.set_problem_description_html(format!(
                            "<p>The application server tried to start the web \
                             application by communicating with a helper process \
                             called a \"preloader\". This helper process crashed \
                             unexpectedly, and restarting it did not help:</p>\
                             <pre>{}</pre>",
                            escape_html(&err.to_string())
                        ));
                        Err(Box::new(error.finalize()))
                    }
                }
            }
        }
    }

    fn internal_invoke_fork_command(
        &self,
        channel: &mut PreloaderChannel,
        session: &mut HandshakeSession,
    ) -> Result<PreloaderForkResult, ForkCommandError> {
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitConnectToPreloader, false);
        let mut stream = match CommandStream::connect(&channel.socket_address) {
            Ok(stream) => stream,
            Err(err) => {
                return Err(ForkCommandError::Crashed {
                    step: JourneyStep::SpawningKitConnectToPreloader,
                    err,
                })
            }
        };
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitConnectToPreloader, false);

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitSendCommandToPreloader, false);
        if let Err(err) = send_fork_command(session, &mut stream) {
            return Err(self.classify_io_failure(
                session,
                JourneyStep::SpawningKitSendCommandToPreloader,
                err,
            ));
        }
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitSendCommandToPreloader, false);

        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitReadResponseFromPreloader, false);
        let line = match read_fork_command_response(session, &mut stream) {
            Ok(line) => line,
            Err(err @ SpawnKitError::Protocol(_)) => {
                let _ = session.journey.set_step_errored(
                    JourneyStep::SpawningKitReadResponseFromPreloader,
                    false,
                );
                return Err(ForkCommandError::Fatal(self.preloader_bug_error(
                    session,
                    channel,
                    err.to_string(),
                )));
            }
            Err(err) => {
                return Err(self.classify_io_failure(
                    session,
                    JourneyStep::SpawningKitReadResponseFromPreloader,
                    err,
                ))
            }
        };
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitReadResponseFromPreloader, false);

        let doc = self.parse_fork_command_response(session, channel, &line)?;
        self.handle_fork_command_response(session, channel, &doc)
    }

    /// I/O and OS errors mean the preloader crashed; a timeout is a
    /// first-class spawn failure and never triggers a restart.
    fn classify_io_failure(
        &self,
        session: &mut HandshakeSession,
        step: JourneyStep,
        err: SpawnKitError,
    ) -> ForkCommandError {
        match err {
            SpawnKitError::Timeout(_) => ForkCommandError::Fatal(session.fail_step(step, &err)),
            err => ForkCommandError::Crashed { step, err },
        }
    }

    fn parse_fork_command_response(
        &self,
        session: &mut HandshakeSession,
        channel: &PreloaderChannel,
        line: &str,
    ) -> Result<Value, ForkCommandError> {
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitParseResponseFromPreloader, false);
        let doc: Value = match serde_json::from_str(line) {
            Ok(doc) => doc,
            Err(_) => {
                let _ = session.journey.set_step_errored(
                    JourneyStep::SpawningKitParseResponseFromPreloader,
                    false,
                );
                return Err(ForkCommandError::Fatal(self.preloader_bug_error(
                    session,
                    channel,
                    format!("The preloader process sent an unparseable response: {}", line),
                )));
            }
        };
        if !valid_fork_command_response(&doc) {
            let _ = session.journey.set_step_errored(
                JourneyStep::SpawningKitParseResponseFromPreloader,
                false,
            );
            return Err(ForkCommandError::Fatal(self.preloader_bug_error(
                session,
                channel,
                format!(
                    "The preloader process sent a response that does not match \
                     the expected structure: {}",
                    doc
                ),
            )));
        }
        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitParseResponseFromPreloader, false);
        Ok(doc)
    }

    fn handle_fork_command_response(
        &self,
        session: &mut HandshakeSession,
        channel: &PreloaderChannel,
        doc: &Value,
    ) -> Result<PreloaderForkResult, ForkCommandError> {
        let _ = session
            .journey
            .set_step_in_progress(JourneyStep::SpawningKitProcessResponseFromPreloader, false);

        if doc["result"] == "error" {
            let _ = session.journey.set_step_errored(
                JourneyStep::SpawningKitProcessResponseFromPreloader,
                false,
            );
            let message = doc["message"].as_str().unwrap_or("(no message)");
            let mut error = session.make_error(ErrorCategory::InternalError);
            self.add_preloader_annotations(&mut error, channel);
            error.set_summary(format!(
                "An error occurred while starting the web application: {}",
                message
            ));
            error.set_problem_description_html(format!(
                "<p>The application server tried to start the web application \
                 by communicating with a helper process called a \"preloader\". \
                 This helper process reported an error:</p><pre>{}</pre>",
                escape_html(message)
            ));
            return Err(ForkCommandError::Fatal(Box::new(error.finalize())));
        }

        let spawned_pid = doc["pid"].as_i64().unwrap_or(-1) as i32;
        let guard = ChildGuard::new(Pid::from_raw(spawned_pid));

        let stdin = self.open_response_fifo(session, "stdin", true)?;
        let stdout_and_err = self.open_response_fifo(session, "stdout_and_err", false)?;
        let capturer = stdout_and_err.map(BackgroundIoCapturer::start);

        // The preloader could report any PID. Verifying the process's UID
        // against the expected one catches both a confused preloader and a
        // child that died so fast its PID was never valid.
        match self.verify_spawned_uid(session, channel, spawned_pid, &capturer) {
            Ok(()) => {}
            Err(e) => return Err(ForkCommandError::Fatal(e)),
        }

        let _ = session
            .journey
            .set_step_performed(JourneyStep::SpawningKitProcessResponseFromPreloader, false);
        let stdout_and_err = capturer.and_then(|c| c.stop().0);
        Ok(PreloaderForkResult {
            pid: spawned_pid,
            stdin,
            stdout_and_err,
            guard,
        })
    }

    fn open_response_fifo(
        &self,
        session: &mut HandshakeSession,
        name: &str,
        for_writing: bool,
    ) -> Result<Option<File>, ForkCommandError> {
        let path = session.work_dir.response_dir().join(name);
        if !path.exists() {
            return Ok(None);
        }
        match open_fifo_with_timeout(&path, for_writing, &mut session.timeout_usec) {
            Ok(file) => Ok(Some(file)),
            Err(err) => {
                let fatal = session
                    .fail_step(JourneyStep::SpawningKitProcessResponseFromPreloader, &err);
                Err(ForkCommandError::Fatal(fatal))
            }
        }
    }

    fn verify_spawned_uid(
        &self,
        session: &mut HandshakeSession,
        channel: &PreloaderChannel,
        spawned_pid: i32,
        capturer: &Option<BackgroundIoCapturer>,
    ) -> Result<(), Box<SpawnError>> {
        let step = JourneyStep::SpawningKitProcessResponseFromPreloader;
        let uid = match process_uid(Pid::from_raw(spawned_pid)) {
            Ok(uid) => uid,
            Err(e) => {
                let mut error = *session.fail_step(step, &e);
                self.add_preloader_annotations(&mut error, channel);
                error.set_summary(format!(
                    "Unable to query the UID of spawned application process {}: {}",
                    spawned_pid, e
                ));
                return Err(Box::new(error));
            }
        };
        match uid {
            None => {
                let _ = session.journey.set_step_errored(step, false);
                let mut error = session.make_error(ErrorCategory::InternalError);
                self.add_preloader_annotations(&mut error, channel);
                error.set_summary(
                    "The application process spawned from the preloader seems to \
                     have exited prematurely"
                        .to_string(),
                );
                if let Some(capturer) = capturer {
                    // Give the child's last words a moment to arrive.
                    std::thread::sleep(Duration::from_millis(50));
                    error.set_stdout_and_err_data(capturer.data());
                }
                Err(Box::new(error.finalize()))
            }
            Some(uid) if uid != session.expected_uid => {
                let _ = session.journey.set_step_errored(step, false);
                let mut error = *self.preloader_bug_error(
                    session,
                    channel,
                    format!(
                        "The process that the preloader said it spawned, PID {}, \
                         has UID {}, but the expected UID is {}",
                        spawned_pid, uid, session.expected_uid
                    ),
                );
                if let Some(capturer) = capturer {
                    error.set_stdout_and_err_data(capturer.data());
                }
                Err(Box::new(error))
            }
            Some(_) => Ok(()),
        }
    }

    /// Build the standard "this is probably a bug in the preloader" error.
    fn preloader_bug_error(
        &self,
        session: &HandshakeSession,
        channel: &PreloaderChannel,
        summary: String,
    ) -> Box<SpawnError> {
        let mut error = session.make_error(ErrorCategory::InternalError);
        self.add_preloader_annotations(&mut error, channel);
        error.set_problem_description_html(format!(
            "<p>The application server tried to start the web application by \
             communicating with a helper process called a \"preloader\". \
             However, something went wrong with that communication:</p>\
             <pre>{}</pre>",
            escape_html(&summary)
        ));
        error.set_solution_description_html(
            "<p class=\"sole-solution\">This is probably a bug in the preloader \
             process. Please report it to the author of your application's \
             preloader.</p>"
                .to_string(),
        );
        error.set_summary(summary);
        Box::new(error.finalize())
    }

    fn add_preloader_annotations(&self, error: &mut SpawnError, channel: &PreloaderChannel) {
        for (key, value) in &channel.annotations {
            error.set_annotation(key, value, false);
        }
    }
}

impl Spawner for SmartSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnResult, Box<SpawnError>> {
        self.touch_last_used();
        let mut channel = self.lock_channel();
        match self.spawn_with_channel(&mut channel, config) {
            Ok(result) => Ok(result),
            Err(mut error) => {
                self.add_preloader_annotations(&mut error, &channel);
                Err(error)
            }
        }
    }

    fn cleanable(&self) -> bool {
        true
    }

    fn cleanup(&self) {
        self.touch_last_used();
        let mut channel = self.lock_channel();
        self.stop_preloader(&mut channel);
    }

    fn last_used_usec(&self) -> u64 {
        self.lock_simple().last_used_usec
    }
}

impl Drop for SmartSpawner {
    fn drop(&mut self) {
        let mut channel = self.lock_channel();
        self.stop_preloader(&mut channel);
    }
}

/// Stream connection to the preloader's command socket.
enum CommandStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl CommandStream {
    fn connect(address: &str) -> Result<CommandStream, SpawnKitError> {
        if let Some(path) = parse_unix_socket_path(address) {
            return Ok(CommandStream::Unix(UnixStream::connect(path)?));
        }
        if let Some(host_port) = address.strip_prefix("tcp://") {
            return Ok(CommandStream::Tcp(TcpStream::connect(host_port)?));
        }
        Err(SpawnKitError::Config(format!(
            "Unsupported command socket address '{}'",
            address
        )))
    }

    fn set_timeouts(&self, timeout_usec: u64) -> std::io::Result<()> {
        // A zero Duration would disable the timeout entirely.
        let timeout = Some(Duration::from_micros(timeout_usec.max(1)));
        match self {
            CommandStream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            CommandStream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }
}

impl Read for CommandStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            CommandStream::Unix(s) => s.read(buf),
            CommandStream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for CommandStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            CommandStream::Unix(s) => s.write(buf),
            CommandStream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            CommandStream::Unix(s) => s.flush(),
            CommandStream::Tcp(s) => s.flush(),
        }
    }
}

fn parse_unix_socket_path(address: &str) -> Option<&Path> {
    address.strip_prefix("unix:").map(Path::new)
}

fn map_stream_error(e: std::io::Error, what: &str) -> SpawnKitError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
            SpawnKitError::Timeout(format!("Timed out {}", what))
        }
        _ => SpawnKitError::Io(e),
    }
}

/// Send the single-line JSON spawn command.
fn send_fork_command(
    session: &mut HandshakeSession,
    stream: &mut CommandStream,
) -> Result<(), SpawnKitError> {
    let doc = json!({
        "command": "spawn",
        "work_dir": session.work_dir.path().to_string_lossy(),
    });
    let mut line = doc.to_string();
    line.push('\n');

    let started = Instant::now();
    stream.set_timeouts(session.timeout_usec)?;
    let result = stream
        .write_all(line.as_bytes())
        .and_then(|_| stream.flush())
        .map_err(|e| map_stream_error(e, "sending the spawn command to the preloader"));
    consume_timeout(&mut session.timeout_usec, started);
    result
}

/// Read exactly one response line, bounded to [`MAX_RESPONSE_LINE_LEN`]
/// bytes before the newline. An oversize line is a protocol violation.
fn read_fork_command_response(
    session: &mut HandshakeSession,
    stream: &mut CommandStream,
) -> Result<String, SpawnKitError> {
    let started = Instant::now();
    stream.set_timeouts(session.timeout_usec)?;
    let result = read_bounded_line(stream);
    consume_timeout(&mut session.timeout_usec, started);
    result
}

fn read_bounded_line(stream: &mut CommandStream) -> Result<String, SpawnKitError> {
    let mut line: Vec<u8> = Vec::new();
    let mut reader = BufReader::new(stream);
    loop {
        let buf = reader
            .fill_buf()
            .map_err(|e| map_stream_error(e, "reading the preloader's response"))?;
        if buf.is_empty() {
            return Err(SpawnKitError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "the preloader closed the connection before sending a response",
            )));
        }
        let newline_pos = buf.iter().position(|&b| b == b'\n');
        match newline_pos {
            Some(pos) => {
                line.extend_from_slice(&buf[..pos]);
                reader.consume(pos + 1);
                break;
            }
            None => {
                let n = buf.len();
                line.extend_from_slice(buf);
                reader.consume(n);
            }
        }
        if line.len() > MAX_RESPONSE_LINE_LEN {
            return Err(SpawnKitError::Protocol(
                "The preloader process sent a response that exceeds the maximum \
                 size limit"
                    .to_string(),
            ));
        }
    }
    if line.len() > MAX_RESPONSE_LINE_LEN {
        return Err(SpawnKitError::Protocol(
            "The preloader process sent a response that exceeds the maximum \
             size limit"
                .to_string(),
        ));
    }
    String::from_utf8(line).map_err(|_| {
        SpawnKitError::Protocol("The preloader response is not valid UTF-8".to_string())
    })
}

fn valid_fork_command_response(doc: &Value) -> bool {
    let obj = match doc.as_object() {
        Some(obj) => obj,
        None => return false,
    };
    match obj.get("result").and_then(Value::as_str) {
        Some("ok") => obj.get("pid").map(Value::is_i64).unwrap_or(false),
        Some("error") => obj.get("message").map(Value::is_string).unwrap_or(false),
        _ => false,
    }
}

/// Open a FIFO with a deadline. Blocking FIFO opens only return once the
/// peer opens the other end, so the open runs on a helper thread and the
/// caller waits on a channel; on timeout the helper is abandoned and exits
/// by itself when its open call eventually returns.
fn open_fifo_with_timeout(
    path: &Path,
    for_writing: bool,
    timeout_usec: &mut u64,
) -> Result<File, SpawnKitError> {
    let started = Instant::now();
    let (tx, rx) = crossbeam_channel::bounded(1);
    let path_buf = path.to_path_buf();
    std::thread::spawn(move || {
        let result = if for_writing {
            OpenOptions::new().write(true).open(&path_buf)
        } else {
            File::open(&path_buf)
        };
        let _ = tx.send(result);
    });

    let outcome = rx.recv_timeout(Duration::from_micros(*timeout_usec));
    consume_timeout(timeout_usec, started);
    match outcome {
        Ok(Ok(file)) => Ok(file),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(SpawnKitError::Timeout(format!(
            "Timeout opening FIFO {}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_validation_accepts_ok_with_pid() {
        let doc: Value = serde_json::from_str(r#"{"result":"ok","pid":123}"#).unwrap();
        assert!(valid_fork_command_response(&doc));
    }

    #[test]
    fn response_validation_accepts_error_with_message() {
        let doc: Value =
            serde_json::from_str(r#"{"result":"error","message":"boom"}"#).unwrap();
        assert!(valid_fork_command_response(&doc));
    }

    #[test]
    fn response_validation_rejects_structural_violations() {
        for raw in [
            r#"{"result":"ok"}"#,
            r#"{"result":"error"}"#,
            r#"{"result":"maybe","pid":1}"#,
            r#"{"pid":1}"#,
            r#"{"result":"ok","pid":"123"}"#,
            r#"{"result":"error","message":42}"#,
            r#"[1,2,3]"#,
        ] {
            let doc: Value = serde_json::from_str(raw).unwrap();
            assert!(!valid_fork_command_response(&doc), "accepted: {}", raw);
        }
    }

    #[test]
    fn response_line_of_exactly_the_limit_is_accepted() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            writer.write_all(&vec![b'x'; MAX_RESPONSE_LINE_LEN]).unwrap();
            writer.write_all(b"\n").unwrap();
        });
        let mut stream = CommandStream::Unix(reader);
        let line = read_bounded_line(&mut stream).unwrap();
        assert_eq!(line.len(), MAX_RESPONSE_LINE_LEN);
        handle.join().unwrap();
    }

    #[test]
    fn response_line_over_the_limit_is_a_protocol_error() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            writer
                .write_all(&vec![b'x'; MAX_RESPONSE_LINE_LEN + 1])
                .unwrap();
            writer.write_all(b"\n").unwrap();
        });
        let mut stream = CommandStream::Unix(reader);
        let err = read_bounded_line(&mut stream).unwrap_err();
        assert!(matches!(err, SpawnKitError::Protocol(_)));
        handle.join().unwrap();
    }

    #[test]
    fn eof_before_newline_is_an_io_error() {
        let (reader, mut writer) = UnixStream::pair().unwrap();
        writer.write_all(b"partial").unwrap();
        drop(writer);
        let mut stream = CommandStream::Unix(reader);
        let err = read_bounded_line(&mut stream).unwrap_err();
        assert!(matches!(err, SpawnKitError::Io(_)));
    }

    #[test]
    fn unix_socket_addresses_are_parsed() {
        assert_eq!(
            parse_unix_socket_path("unix:/tmp/cmd.sock"),
            Some(Path::new("/tmp/cmd.sock"))
        );
        assert_eq!(parse_unix_socket_path("tcp://127.0.0.1:4000"), None);
    }

    #[test]
    fn new_requires_a_preloader_command() {
        let config = SpawnConfig {
            app_root: "/tmp/app".to_string(),
            app_env: "production".to_string(),
            start_command: "true".to_string(),
            ..SpawnConfig::default()
        };
        assert!(SmartSpawner::new(config, None).is_err());
    }

    #[test]
    fn fresh_spawner_reports_preloader_down() {
        let config = SpawnConfig {
            app_root: "/tmp/app".to_string(),
            app_env: "production".to_string(),
            start_command: "true".to_string(),
            preloader_command: vec!["ruby".to_string(), "preloader.rb".to_string()],
            ..SpawnConfig::default()
        };
        let spawner = SmartSpawner::new(config, None).unwrap();
        assert_eq!(spawner.preloader_pid(), -1);
        assert!(!spawner.preloader_started());
    }
}
