//! Transfer progress statistics.
//!
//! A [`TransferInfo`] snapshot is the only piece of session state read from
//! outside the owning task (UI polling). The live state sits behind a mutex
//! held only for the duration of field copies and speed recomputation.

use crate::utils::fmt::UNKNOWN_INTERVAL;
use std::sync::{Arc, Mutex};
use std::time::Instant;

// ── Snapshot ─────────────────────────────────────────────────────────────────

/// Statistics about the transfer progress of one session.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub total_files: u32,
    pub transferred_files: u32,
    pub skipped_files: u32,

    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub skipped_bytes: u64,

    /// Total elapsed time since the connection attempt, milliseconds.
    pub elapsed_ms: u64,
    /// Time spent actively transferring, milliseconds.
    pub transfer_ms: u64,
    /// Time spent in pause mode, milliseconds.
    pub paused_ms: u64,

    /// Current transfer speed in bytes per second (infinite until known).
    pub current_speed: f64,

    /// Relative path of the file currently in transfer, if any.
    pub file_in_transfer: Option<String>,

    previous_bytes: u64,
    previous_ms: u64,
}

impl Default for TransferInfo {
    fn default() -> Self {
        Self {
            total_files: 0,
            transferred_files: 0,
            skipped_files: 0,
            total_bytes: 0,
            transferred_bytes: 0,
            skipped_bytes: 0,
            elapsed_ms: 0,
            transfer_ms: 0,
            paused_ms: 0,
            current_speed: f64::INFINITY,
            file_in_transfer: None,
            previous_bytes: 0,
            previous_ms: 0,
        }
    }
}

impl TransferInfo {
    pub fn remaining_files(&self) -> u32 {
        self.total_files - self.transferred_files - self.skipped_files
    }

    pub fn remaining_bytes(&self) -> u64 {
        self.total_bytes - self.transferred_bytes - self.skipped_bytes
    }

    /// Percentage of files already transferred or skipped (100 when empty).
    pub fn percentage_files(&self) -> f32 {
        if self.total_files > 0 {
            100.0 * (self.transferred_files + self.skipped_files) as f32 / self.total_files as f32
        } else {
            100.0
        }
    }

    /// Percentage of bytes already transferred or skipped.
    pub fn percentage_bytes(&self) -> f32 {
        if self.total_bytes > 0 {
            100.0 * (self.transferred_bytes + self.skipped_bytes) as f32 / self.total_bytes as f32
        } else {
            self.percentage_files()
        }
    }

    /// Average transfer speed in bytes per second.
    pub fn average_speed(&self) -> f64 {
        transfer_speed(self.transferred_bytes, self.transfer_ms)
    }

    /// Estimated remaining time in milliseconds, or [`UNKNOWN_INTERVAL`] when
    /// the average speed cannot be determined.
    pub fn remaining_time_ms(&self) -> u64 {
        let average = self.average_speed();
        if average == 0.0 || !average.is_finite() {
            return UNKNOWN_INTERVAL;
        }
        (1000.0 * self.remaining_bytes() as f64 / average) as u64
    }

    /// Recompute the current speed from the deltas since the previous call.
    fn recompute_current_speed(&mut self, reset: bool) {
        self.current_speed = if reset {
            f64::INFINITY
        } else {
            transfer_speed(
                self.transferred_bytes - self.previous_bytes,
                self.transfer_ms - self.previous_ms,
            )
        };
        self.previous_bytes = self.transferred_bytes;
        self.previous_ms = self.transfer_ms;
    }
}

/// Bytes over milliseconds as bytes per second (infinite when no time
/// elapsed).
fn transfer_speed(bytes: u64, milliseconds: u64) -> f64 {
    if milliseconds == 0 {
        return f64::INFINITY;
    }
    bytes as f64 * 1000.0 / milliseconds as f64
}

// ── Shared live state ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProgressState {
    info: TransferInfo,
    elapsed_since: Option<Instant>,
    transfer_since: Option<Instant>,
    paused_since: Option<Instant>,
}

impl ProgressState {
    /// Fold the running timers into the accumulated counters.
    fn settle_timers(&mut self) {
        let now = Instant::now();
        if let Some(started) = self.elapsed_since {
            self.info.elapsed_ms = (now - started).as_millis() as u64;
        }
        if let Some(since) = self.transfer_since.replace(now) {
            self.info.transfer_ms += (now - since).as_millis() as u64;
        } else {
            self.transfer_since = None;
        }
        if let Some(since) = self.paused_since.replace(now) {
            self.info.paused_ms += (now - since).as_millis() as u64;
        } else {
            self.paused_since = None;
        }
    }
}

/// Handle to the mutable progress of one session, shared between the session
/// task (writer) and external pollers (readers).
#[derive(Debug, Clone, Default)]
pub struct SharedProgress {
    state: Arc<Mutex<ProgressState>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot, updating timers and the current speed.
    pub fn snapshot(&self) -> TransferInfo {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.settle_timers();
        if state.transfer_since.is_some() {
            state.info.recompute_current_speed(false);
        }
        state.info.clone()
    }

    /// Record the advertised totals of the sharing request.
    pub fn set_totals(&self, total_files: u32, total_bytes: u64) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.info.total_files = total_files;
        state.info.total_bytes = total_bytes;
    }

    /// Start the total elapsed timer (connection attempt).
    pub fn start_elapsed(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.elapsed_since = Some(Instant::now());
    }

    /// Start measuring active transfer time.
    pub fn start_transfer(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.transfer_since = Some(Instant::now());
    }

    /// Enter pause: transfer time stops accumulating, pause time starts.
    pub fn pause(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.settle_timers();
        state.transfer_since = None;
        state.info.recompute_current_speed(true);
        state.paused_since = Some(Instant::now());
    }

    /// Exit pause: pause time stops accumulating, transfer time restarts.
    pub fn resume(&self, in_transfer: bool) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.settle_timers();
        state.paused_since = None;
        state.transfer_since = in_transfer.then(Instant::now);
    }

    /// Stop all timers (terminal state) and clear the file in transfer.
    pub fn finish(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.settle_timers();
        state.transfer_since = None;
        state.paused_since = None;
        state.info.file_in_transfer = None;
        state.info.recompute_current_speed(true);
    }

    pub fn set_file_in_transfer(&self, path: Option<String>) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.info.file_in_transfer = path;
    }

    pub fn add_transferred_bytes(&self, bytes: u64) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.info.transferred_bytes += bytes;
    }

    pub fn add_transferred_file(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.info.transferred_files += 1;
    }

    pub fn add_skipped(&self, files: u32, bytes: u64) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        state.info.skipped_files += files;
        state.info.skipped_bytes += bytes;
    }

    /// Mark everything not yet accounted for as skipped (session reject or
    /// abort).
    pub fn skip_remaining(&self) {
        let mut state = self.state.lock().expect("progress mutex poisoned");
        let files = state.info.remaining_files();
        let bytes = state.info.remaining_bytes();
        state.info.skipped_files += files;
        state.info.skipped_bytes += bytes;
    }
}
