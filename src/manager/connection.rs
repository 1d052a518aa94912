//! # Connection Lifecycle
//!
//! State names, the connect retry policy, and the two background tasks the
//! dispatcher starts around a connection:
//! - **connect**: bounded attempts with exponential backoff, or the single
//!   delayed attempt made after an unexpected disconnect
//! - **keep-alive**: a ping every `keepalive_interval`, only while open
//!
//! ## State machine:
//! Disconnected → Connecting → Open → {Reconnecting → Connecting, Closing → Disconnected}

use crate::error::{SynthError, SynthResult};
use crate::state::SharedMetrics;
use crate::transport::{Connector, Link, Outbound};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempts and backoff for one connect.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based):
    /// `initial * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// How a connect task should go about it.
#[derive(Debug, Clone)]
pub(crate) enum ConnectPlan {
    /// Fresh connect: up to `max_attempts` with backoff in between
    Initial(RetryPolicy),
    /// After an unexpected drop: exactly one attempt, after `delay`
    Reconnect { delay: Duration },
}

/// Run one connect plan to completion.
pub(crate) async fn establish(
    connector: &dyn Connector,
    plan: ConnectPlan,
    metrics: &SharedMetrics,
) -> SynthResult<Link> {
    match plan {
        ConnectPlan::Initial(policy) => {
            let attempts = policy.max_attempts.max(1);
            let mut last_error = SynthError::Connection("no connect attempt made".to_string());

            for attempt in 1..=attempts {
                metrics.record_connect_attempt();
                match connector.connect().await {
                    Ok(link) => {
                        debug!(attempt, "connect attempt succeeded");
                        return Ok(link);
                    }
                    Err(err) => {
                        warn!(
                            attempt,
                            max_attempts = attempts,
                            error = %err,
                            "connect attempt failed"
                        );
                        last_error = err;
                        if attempt < attempts {
                            tokio::time::sleep(policy.backoff(attempt)).await;
                        }
                    }
                }
            }

            Err(SynthError::Connection(format!(
                "giving up after {} attempts: {}",
                attempts,
                detail(&last_error)
            )))
        }
        ConnectPlan::Reconnect { delay } => {
            info!(delay_ms = delay.as_millis() as u64, "reconnecting after unexpected disconnect");
            tokio::time::sleep(delay).await;
            metrics.record_connect_attempt();
            connector.connect().await.map_err(|err| {
                SynthError::Connection(format!("reconnect failed: {}", detail(&err)))
            })
        }
    }
}

/// Inner message of a connection error, so wrapping doesn't stack prefixes.
fn detail(err: &SynthError) -> String {
    match err {
        SynthError::Connection(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Recurring liveness probe, stopped when dropped.
#[derive(Debug)]
pub(crate) struct KeepAlive {
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Send `Outbound::Ping` every `interval`, starting one interval from now.
    pub fn start(
        outbound: mpsc::UnboundedSender<Outbound>,
        interval: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(interval_at(Instant::now() + interval, interval));
            while ticks.next().await.is_some() {
                if outbound.send(Outbound::Ping).is_err() {
                    break;
                }
                metrics.record_probe();
                debug!("keep-alive probe sent");
            }
        });
        Self { handle }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
