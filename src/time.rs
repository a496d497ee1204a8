/// Monotonic clock helpers for journey timing and deadline accounting.
///
/// All timestamps are microseconds on a process-local monotonic scale.
/// Journey timings are truncated to 10 ms granularity so that timestamps
/// recorded by different participants compare sensibly.
use std::sync::OnceLock;
use std::time::Instant;

/// Granularity applied to journey timestamps, in microseconds.
pub const GRANULARITY_USEC: u64 = 10_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds elapsed since the process-local epoch.
pub fn monotonic_usec() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Like [`monotonic_usec`], truncated to 10 ms granularity.
pub fn monotonic_usec_coarse() -> u64 {
    (monotonic_usec() / GRANULARITY_USEC) * GRANULARITY_USEC
}

/// Subtract the time elapsed since `started` from a remaining-microseconds
/// deadline counter, saturating at zero.
pub fn consume_timeout(timeout_usec: &mut u64, started: Instant) {
    let elapsed = started.elapsed().as_micros() as u64;
    *timeout_usec = timeout_usec.saturating_sub(elapsed);
}
