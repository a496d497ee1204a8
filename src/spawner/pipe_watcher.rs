//! Background draining of child stdout/stderr pipes.

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::Read;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Upper bound on captured stdio kept in memory for error attachment.
pub const CAPTURE_LIMIT: usize = 512 * 1024;

/// Captures a child's combined stdout/stderr into a bounded in-memory
/// buffer so it can be attached to a spawn error. The reader thread polls
/// so that [`BackgroundIoCapturer::stop`] can reclaim the descriptor
/// without tearing down the process.
pub struct BackgroundIoCapturer {
    data: Arc<Mutex<Vec<u8>>>,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<File>>,
}

impl BackgroundIoCapturer {
    pub fn start(file: File) -> BackgroundIoCapturer {
        let data = Arc::new(Mutex::new(Vec::new()));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let thread_data = Arc::clone(&data);
        let thread_stop = Arc::clone(&stop_flag);
        let handle = std::thread::spawn(move || capture_loop(file, thread_data, thread_stop));
        BackgroundIoCapturer {
            data,
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Snapshot of the captured data so far.
    pub fn data(&self) -> String {
        let buffer = self.data.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Stop the reader thread and reclaim the descriptor together with
    /// everything captured. Returns `None` for the descriptor when the
    /// pipe already reached EOF.
    pub fn stop(mut self) -> (Option<File>, String) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let file = self.handle.take().and_then(|h| h.join().ok());
        let data = self.data();
        (file, data)
    }
}

impl Drop for BackgroundIoCapturer {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn capture_loop(mut file: File, data: Arc<Mutex<Vec<u8>>>, stop_flag: Arc<AtomicBool>) -> File {
    let mut buf = [0u8; 4096];
    loop {
        if stop_flag.load(Ordering::SeqCst) {
            return file;
        }
        let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
        let readable = match poll(&mut fds, PollTimeout::from(100u8)) {
            Ok(0) => false,
            Ok(_) => true,
            Err(nix::errno::Errno::EINTR) => false,
            Err(_) => return file,
        };
        if !readable {
            continue;
        }
        match file.read(&mut buf) {
            // EOF: writer side closed; keep the thread parked until stop so
            // the descriptor can still be reclaimed.
            Ok(0) => {
                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                return file;
            }
            Ok(n) => {
                let mut buffer = data.lock().unwrap_or_else(|e| e.into_inner());
                let remaining = CAPTURE_LIMIT.saturating_sub(buffer.len());
                buffer.extend_from_slice(&buf[..n.min(remaining)]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => return file,
        }
    }
}

/// Forward a preloader's output to the log, one line at a time, until the
/// pipe closes. Detached; runs for the preloader's lifetime.
pub fn watch_and_log_output(file: File, pid: i32) {
    std::thread::spawn(move || {
        let reader = std::io::BufReader::new(file);
        use std::io::BufRead;
        for line in reader.lines() {
            match line {
                Ok(line) => log::info!("Preloader {} output: {}", pid, line),
                Err(_) => break,
            }
        }
        log::debug!("Preloader {} output channel closed", pid);
    });
}
