//! Circuit breaker around request dispatch.
//!
//! N consecutive failures inside the failure window → open → reset timeout →
//! half-open (one trial) → success → closed. Failure of the trial reopens the
//! breaker with a fresh reset deadline.
//!
//! The breaker is owned by the manager's event loop, so it needs no locking.

use crate::error::{SynthError, SynthResult};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// A failure arriving later than this after the first failure of the
    /// current streak starts a new streak
    pub failure_window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Externally visible breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            streak_started: None,
        }
    }

    /// Ask permission to dispatch one request.
    ///
    /// In half-open state the first caller becomes the trial; everyone else
    /// is rejected until the trial reports back.
    pub fn try_acquire(&mut self) -> SynthResult<()> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { until } => {
                if Instant::now() >= until {
                    info!("circuit breaker half-open, allowing one trial request");
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(())
                } else {
                    Err(SynthError::BreakerOpen)
                }
            }
            CircuitState::HalfOpen { trial_in_flight } => {
                if trial_in_flight {
                    Err(SynthError::BreakerOpen)
                } else {
                    self.state = CircuitState::HalfOpen {
                        trial_in_flight: true,
                    };
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker and resets the streak.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.streak_started = None;
        if self.state != CircuitState::Closed {
            info!("circuit breaker closed after successful request");
            self.state = CircuitState::Closed;
        }
    }

    /// Record a failed call; may trip the breaker.
    pub fn record_failure(&mut self) {
        let now = Instant::now();

        if let CircuitState::HalfOpen { .. } = self.state {
            warn!(
                reset_ms = self.config.reset_timeout.as_millis() as u64,
                "trial request failed, circuit breaker re-opened"
            );
            self.trip(now);
            return;
        }

        match self.streak_started {
            Some(started) if now.duration_since(started) <= self.config.failure_window => {
                self.consecutive_failures += 1;
            }
            _ => {
                self.streak_started = Some(now);
                self.consecutive_failures = 1;
            }
        }

        if self.state == CircuitState::Closed
            && self.consecutive_failures >= self.config.failure_threshold
        {
            warn!(
                failures = self.consecutive_failures,
                reset_ms = self.config.reset_timeout.as_millis() as u64,
                "circuit breaker opened after {} consecutive failures",
                self.consecutive_failures
            );
            self.trip(now);
        }
    }

    /// Hand back an acquired slot whose call never produced an outcome,
    /// e.g. a request cancelled by `close()`.
    pub fn release(&mut self) {
        if let CircuitState::HalfOpen { trial_in_flight: true } = self.state {
            self.state = CircuitState::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.state {
            CircuitState::Closed => BreakerState::Closed,
            CircuitState::Open { until } if Instant::now() >= until => BreakerState::HalfOpen,
            CircuitState::Open { .. } => BreakerState::Open,
            CircuitState::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open {
            until: now + self.config.reset_timeout,
        };
        self.consecutive_failures = 0;
        self.streak_started = None;
    }
}
