//! End-to-end smart spawn scenarios.
//!
//! A stub agent script plays the preloader's startup handshake and a local
//! TCP listener plays the preloader's command socket. Using TCP keeps the
//! listener usable across a preloader restart, which unlinks UNIX sockets.

mod common;

use common::{assert_no_step_in_progress, base_config, write_stub_agent};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use spawnkit::errors::ErrorCategory;
use spawnkit::journey::{JourneyStep, JourneyStepState};
use spawnkit::spawner::{SmartSpawner, Spawner};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The stub preloader writes a properties.json advertising the command
/// socket address from the given environment variable, reports readiness,
/// and stays alive until its stdin closes.
fn write_stub_preloader(dir: &Path, port_var: &str) -> std::path::PathBuf {
    write_stub_agent(
        dir,
        "preloader-agent",
        &format!(
            r#"cat > "$WORK_DIR/response/properties.json" <<EOF
{{"sockets":[{{"name":"cmd","address":"tcp://127.0.0.1:${port_var}","protocol":"preloader","concurrency":1}}]}}
EOF
printf 1 > "$WORK_DIR/response/finish"
read line"#,
        ),
    )
}

fn smart_spawner(agent: &Path, port_var: &str, port: u16) -> SmartSpawner {
    std::env::set_var(port_var, port.to_string());
    let mut config = base_config(agent);
    config.preloader_command = vec!["ruby".to_string(), "preloader.rb".to_string()];
    SmartSpawner::new(config, None).unwrap()
}

fn read_request_line(stream: &mut TcpStream) -> String {
    let mut line = String::new();
    let mut reader = BufReader::new(stream);
    reader.read_line(&mut line).unwrap();
    line
}

/// Drain the connection until the client hangs up, so the client never
/// observes a reset while it is still reading.
fn hold_until_closed(mut stream: TcpStream) {
    let mut sink = [0u8; 256];
    while let Ok(n) = stream.read(&mut sink) {
        if n == 0 {
            break;
        }
    }
}

#[test]
fn oversized_preloader_response_is_a_preloader_bug() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_preloader(dir.path(), "SPAWNKIT_TEST_PORT_OVERSIZE");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let responder = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request_line(&mut stream);
        let garbage = vec![b'a'; 11_000];
        stream.write_all(&garbage).unwrap();
        stream.flush().unwrap();
        hold_until_closed(stream);
    });

    let spawner = smart_spawner(&agent, "SPAWNKIT_TEST_PORT_OVERSIZE", port);
    let error = spawner.spawn(&base_config(&agent)).unwrap_err();

    assert_eq!(error.category(), ErrorCategory::InternalError);
    assert!(
        error.summary().contains("exceeds the maximum size limit"),
        "summary was: {}",
        error.summary()
    );
    assert_eq!(
        error
            .journey()
            .step_info(JourneyStep::SpawningKitReadResponseFromPreloader)
            .unwrap()
            .state,
        JourneyStepState::Errored
    );
    assert_no_step_in_progress(error.journey());
    responder.join().unwrap();
}

#[test]
fn wrong_pid_uid_mismatch_is_a_preloader_bug() {
    if nix::unistd::geteuid().is_root() {
        // PID 1 runs as root, which would satisfy the expectation.
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_preloader(dir.path(), "SPAWNKIT_TEST_PORT_WRONGPID");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let responder = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request_line(&mut stream);
        stream
            .write_all(b"{\"result\":\"ok\",\"pid\":1}\n")
            .unwrap();
        stream.flush().unwrap();
        hold_until_closed(stream);
    });

    let spawner = smart_spawner(&agent, "SPAWNKIT_TEST_PORT_WRONGPID", port);
    let error = spawner.spawn(&base_config(&agent)).unwrap_err();

    assert_eq!(error.category(), ErrorCategory::InternalError);
    assert!(
        error.summary().contains("expected UID"),
        "summary was: {}",
        error.summary()
    );
    assert_eq!(
        error
            .journey()
            .step_info(JourneyStep::SpawningKitProcessResponseFromPreloader)
            .unwrap()
            .state,
        JourneyStepState::Errored
    );
    assert_no_step_in_progress(error.journey());
    responder.join().unwrap();
}

#[test]
fn preloader_reported_error_is_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_preloader(dir.path(), "SPAWNKIT_TEST_PORT_APPERR");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let responder = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request_line(&mut stream);
        stream
            .write_all(b"{\"result\":\"error\",\"message\":\"bundler blew up\"}\n")
            .unwrap();
        stream.flush().unwrap();
        hold_until_closed(stream);
    });

    let spawner = smart_spawner(&agent, "SPAWNKIT_TEST_PORT_APPERR", port);
    let error = spawner.spawn(&base_config(&agent)).unwrap_err();

    assert_eq!(error.category(), ErrorCategory::InternalError);
    assert!(error.summary().contains("bundler blew up"));
    assert_no_step_in_progress(error.journey());
    responder.join().unwrap();
}

#[test]
fn preloader_crash_triggers_exactly_one_restart() {
    let dir = tempfile::tempdir().unwrap();
    let agent = write_stub_preloader(dir.path(), "SPAWNKIT_TEST_PORT_RESTART");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let connections_seen = Arc::clone(&connections);

    let responder = std::thread::spawn(move || {
        // First connection: read the command, then hang up. The spawner
        // treats the EOF as a preloader crash and restarts it.
        let (mut stream, _) = listener.accept().unwrap();
        connections_seen.fetch_add(1, Ordering::SeqCst);
        read_request_line(&mut stream);
        drop(stream);

        // Second connection, after the restart: fork a worker for real.
        let (mut stream, _) = listener.accept().unwrap();
        connections_seen.fetch_add(1, Ordering::SeqCst);
        let request = read_request_line(&mut stream);
        let doc: serde_json::Value = serde_json::from_str(&request).unwrap();
        assert_eq!(doc["command"], "spawn");
        let work_dir = std::path::PathBuf::from(doc["work_dir"].as_str().unwrap());

        let worker = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(
            work_dir.join("response/properties.json"),
            r#"{"sockets":[{"name":"main","address":"tcp://127.0.0.1:1","protocol":"http","concurrency":4}]}"#,
        )
        .unwrap();
        std::fs::write(work_dir.join("response/finish"), "1").unwrap();
        stream
            .write_all(format!("{{\"result\":\"ok\",\"pid\":{}}}\n", worker.id()).as_bytes())
            .unwrap();
        stream.flush().unwrap();
        hold_until_closed(stream);
        worker.id() as i32
    });

    let spawner = smart_spawner(&agent, "SPAWNKIT_TEST_PORT_RESTART", port);
    let result = spawner.spawn(&base_config(&agent)).unwrap();
    let worker_pid = responder.join().unwrap();

    assert_eq!(result.pid, worker_pid);
    assert_eq!(result.sockets.len(), 1);
    assert_eq!(result.sockets[0].concurrency, 4);
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    assert!(spawner.preloader_pid() != -1);

    let _ = kill(Pid::from_raw(worker_pid), Signal::SIGKILL);
}
