//! Publisher statistics.
//!
//! The dispatcher is the only writer; `snapshot()` may be called from any
//! monitoring thread, so the fields sit behind a read-write lock. Nothing
//! else in the publisher crosses threads through shared state.

use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Smoothing window for the line-speed moving average, in seconds.
const SPEED_WINDOW_SECS: f64 = 5.0;

/// Seconds without any acknowledged lines before the speed reads zero.
const SPEED_IDLE_RESET_SECS: u64 = 10;

/// Point-in-time view of publisher activity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    /// Total lines acknowledged by remote collectors.
    pub published_lines: u64,
    /// Payloads currently in flight.
    pub pending_payloads: usize,
    /// Smoothed acknowledgment rate in lines per second.
    pub line_speed: f64,
    /// Endpoint failures caused by network or keepalive timeouts.
    pub timeouts: u64,
    /// Payload retransmissions after endpoint failures.
    pub retries: u64,
}

#[derive(Debug)]
struct Inner {
    line_count: u64,
    last_line_count: u64,
    line_speed: f64,
    seconds_no_ack: u64,
    last_measurement: Instant,
    pending_payloads: usize,
    timeout_count: u64,
    retry_count: u64,
}

/// Shared statistics block; cheap to clone, handed to the publisher handle.
#[derive(Debug, Clone)]
pub(crate) struct PublisherStats {
    inner: Arc<RwLock<Inner>>,
}

impl PublisherStats {
    pub(crate) fn new() -> Self {
        PublisherStats {
            inner: Arc::new(RwLock::new(Inner {
                line_count: 0,
                last_line_count: 0,
                line_speed: 0.0,
                seconds_no_ack: 0,
                last_measurement: Instant::now(),
                pending_payloads: 0,
                timeout_count: 0,
                retry_count: 0,
            })),
        }
    }

    pub(crate) fn add_lines(&self, lines: usize) {
        if let Ok(mut inner) = self.inner.write() {
            inner.line_count += lines as u64;
        }
    }

    pub(crate) fn set_pending_payloads(&self, pending: usize) {
        if let Ok(mut inner) = self.inner.write() {
            inner.pending_payloads = pending;
        }
    }

    pub(crate) fn incr_timeouts(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.timeout_count += 1;
        }
    }

    pub(crate) fn incr_retries(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.retry_count += 1;
        }
    }

    /// Recompute the line-speed average from the lines acknowledged since the
    /// previous tick. Called from the dispatcher's one-second stats timer.
    pub(crate) fn tick(&self) {
        let Ok(mut inner) = self.inner.write() else {
            return;
        };
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_measurement);
        let lines = inner.line_count - inner.last_line_count;

        let mut seconds_no_ack = inner.seconds_no_ack;
        inner.line_speed = calculate_speed(
            elapsed.as_secs_f64(),
            inner.line_speed,
            lines as f64,
            &mut seconds_no_ack,
        );
        inner.seconds_no_ack = seconds_no_ack;
        inner.last_line_count = inner.line_count;
        inner.last_measurement = now;
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        let inner = match self.inner.read() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        Snapshot {
            published_lines: inner.line_count,
            pending_payloads: inner.pending_payloads,
            line_speed: inner.line_speed,
            timeouts: inner.timeout_count,
            retries: inner.retry_count,
        }
    }
}

/// Exponentially-weighted moving average of lines per second.
///
/// An idle stretch longer than [`SPEED_IDLE_RESET_SECS`] snaps the average
/// back to zero instead of letting a stale rate linger on the snapshot.
fn calculate_speed(
    elapsed_secs: f64,
    average: f64,
    lines: f64,
    seconds_no_ack: &mut u64,
) -> f64 {
    if elapsed_secs <= 0.0 {
        return average;
    }

    if lines == 0.0 {
        *seconds_no_ack += elapsed_secs.round() as u64;
        if *seconds_no_ack >= SPEED_IDLE_RESET_SECS {
            *seconds_no_ack = SPEED_IDLE_RESET_SECS;
            return 0.0;
        }
    } else {
        *seconds_no_ack = 0;
    }

    let instant_speed = lines / elapsed_secs;
    if average == 0.0 {
        return instant_speed;
    }

    // Standard EWMA weighting: older measurements decay over the window.
    let weight = 1.0 - (-elapsed_secs / SPEED_WINDOW_SECS).exp();
    average + (instant_speed - average) * weight
}
