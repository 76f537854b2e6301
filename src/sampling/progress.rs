//! Progress policy for sampling runs
//!
//! Converts (samples seen, samples wanted) into a percentage and keeps
//! elapsed-time readings monotonic within a run.

use tokio::time::Instant;

use super::error::{SamplingError, SamplingResult};

/// Compute the percentage of the target sample processed so far
///
/// An empty target is trivially complete. Otherwise the ratio is rounded up
/// and clamped to 100.
///
/// # Errors
///
/// `InvalidArgument` when either count is negative.
pub fn compute_percent(samples_processed: i64, samples_wanted: i64) -> SamplingResult<u8> {
    if samples_processed < 0 {
        return Err(SamplingError::InvalidArgument(format!(
            "samples processed must be non-negative, got {samples_processed}"
        )));
    }
    if samples_wanted < 0 {
        return Err(SamplingError::InvalidArgument(format!(
            "samples wanted must be non-negative, got {samples_wanted}"
        )));
    }
    if samples_wanted == 0 {
        return Ok(100);
    }

    let processed = samples_processed as i128 * 100;
    let wanted = samples_wanted as i128;
    let percent = (processed + wanted - 1) / wanted;
    Ok(percent.min(100) as u8)
}

/// Number of samples a run should expect to see
pub fn number_of_samples(count: u64, requested_sample_size: u64) -> u64 {
    count.min(requested_sample_size)
}

/// Milliseconds between two instants, zero if `now` precedes `start`
pub fn elapsed_ms(start: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(start).as_millis() as u64
}

/// Elapsed-time source for one run
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    last_elapsed_ms: u64,
}

impl ProgressTracker {
    /// Start tracking from now
    pub fn start() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(started: Instant) -> Self {
        Self {
            started,
            last_elapsed_ms: 0,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Elapsed milliseconds since the run started
    pub fn elapsed_ms(&mut self) -> u64 {
        self.elapsed_ms_at(Instant::now())
    }

    /// Elapsed milliseconds at `now`, never less than a previous reading
    pub fn elapsed_ms_at(&mut self, now: Instant) -> u64 {
        let elapsed = elapsed_ms(self.started, now);
        self.last_elapsed_ms = self.last_elapsed_ms.max(elapsed);
        self.last_elapsed_ms
    }
}

/// Format milliseconds as a short human-readable duration
pub fn format_elapsed(ms: u64) -> String {
    let secs = ms / 1000;
    let mins = secs / 60;
    let remaining_secs = secs % 60;

    if mins > 0 {
        format!("{}m {}s", mins, remaining_secs)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", ms)
    }
}
