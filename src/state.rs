//! # Manager Metrics
//!
//! Counters shared between the manager's event loop (the only writer) and
//! any number of handles (readers). Handles only ever see a cloned snapshot.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every handle and the event loop hold a reference
//! - **RwLock**: snapshots from many handles, updates from one task
//! - A poisoned lock is recovered with `PoisonError::into_inner`; counters are
//!   plain integers, so a panic mid-update cannot leave them inconsistent

use crate::audio::transcode::OutputFormat;
use crate::error::SynthError;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

/// Point-in-time view of everything the manager has counted.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ManagerMetrics {
    /// Requests accepted by `submit`
    pub submitted: u64,
    /// Requests resolved with audio
    pub succeeded: u64,
    /// Requests rejected for any reason (includes the two counters below)
    pub failed: u64,
    pub timed_out: u64,
    pub breaker_rejections: u64,

    /// Frames that were discarded as protocol violations
    pub protocol_errors: u64,
    /// Frames discarded while draining an abandoned request
    pub drained_frames: u64,

    pub connect_attempts: u64,
    pub connections_opened: u64,
    pub reconnects: u64,
    pub probes_sent: u64,

    /// Raw audio bytes received from the peer
    pub audio_bytes_received: u64,

    /// Per output format
    pub format_metrics: HashMap<OutputFormat, FormatMetric>,
}

/// Latency and error statistics for one output format.
///
/// ## Performance calculations:
/// - **Average latency**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FormatMetric {
    pub request_count: u64,
    /// Submission to resolution, summed over all requests (milliseconds)
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl FormatMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

/// Shared handle to the manager's metrics.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics {
    inner: Arc<RwLock<ManagerMetrics>>,
}

impl SharedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> RwLockWriteGuard<'_, ManagerMetrics> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone the current counters so no lock is held by the caller.
    pub fn snapshot(&self) -> ManagerMetrics {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn record_submitted(&self) {
        self.write().submitted += 1;
    }

    /// Record the final outcome of one request.
    pub fn record_outcome(
        &self,
        format: OutputFormat,
        latency: Duration,
        outcome: Result<(), &SynthError>,
    ) {
        let mut metrics = self.write();

        match outcome {
            Ok(()) => metrics.succeeded += 1,
            Err(err) => {
                metrics.failed += 1;
                match err {
                    SynthError::Timeout(_) => metrics.timed_out += 1,
                    SynthError::BreakerOpen => metrics.breaker_rejections += 1,
                    _ => {}
                }
            }
        }

        let format_metric = metrics.format_metrics.entry(format).or_default();
        format_metric.request_count += 1;
        format_metric.total_duration_ms += latency.as_millis() as u64;
        if outcome.is_err() {
            format_metric.error_count += 1;
        }
    }

    pub fn record_protocol_error(&self) {
        self.write().protocol_errors += 1;
    }

    pub fn record_drained_frame(&self) {
        self.write().drained_frames += 1;
    }

    pub fn record_connect_attempt(&self) {
        self.write().connect_attempts += 1;
    }

    pub fn record_connection_opened(&self) {
        self.write().connections_opened += 1;
    }

    pub fn record_reconnect(&self) {
        self.write().reconnects += 1;
    }

    pub fn record_probe(&self) {
        self.write().probes_sent += 1;
    }

    pub fn record_audio_bytes(&self, bytes: usize) {
        self.write().audio_bytes_received += bytes as u64;
    }
}
