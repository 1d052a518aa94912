//! # Configuration Management
//!
//! This module handles loading and managing client configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `VOXLINK_URL` (endpoint only)
//! 2. Environment variables (APP_CONNECTION__URL, APP_REQUESTS__TIMEOUT_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! The file-facing structs use plain integers (milliseconds, seconds) so they
//! round-trip through TOML and environment variables. [`ManagerConfig`] is the
//! typed view the manager itself consumes.

use crate::audio::transcode::OutputFormat;
use crate::breaker::BreakerConfig;
use crate::error::{SynthError, SynthResult};
use crate::manager::connection::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (connection, requests, breaker,
/// synthesis defaults) keeps each concern readable on its own and maps
/// directly onto `[section]` tables in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub connection: ConnectionSettings,
    pub requests: RequestSettings,
    pub breaker: BreakerSettings,
    pub synthesis: SynthesisSettings,
    pub performance: PerformanceSettings,
    pub output: OutputSettings,
}

/// Transport and connection lifecycle settings.
///
/// ## Fields:
/// - `url`: WebSocket endpoint of the synthesis service (ws:// or wss://)
/// - `connect_attempts`: attempts per connect before giving up
/// - `initial_backoff_ms` / `max_backoff_ms`: exponential backoff between attempts
/// - `reconnect_delay_ms`: fixed delay before the single reconnect after a drop
/// - `connect_timeout_ms`: bound on one WebSocket handshake
/// - `keepalive_interval_secs`: liveness probe cadence while open
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub url: String,
    pub connect_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub keepalive_interval_secs: u64,
}

/// Per-request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSettings {
    /// Deadline for one request, from dispatch to its `done` frame
    pub timeout_ms: u64,
}

/// Circuit breaker tuning.
///
/// ## Tuning guidelines:
/// - Lower threshold: fail fast sooner, but trips on short blips
/// - Longer reset timeout: gentler on a recovering peer, slower recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub failure_window_ms: u64,
}

/// Defaults applied to requests that don't specify them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisSettings {
    pub default_voice: String,
    pub default_speed: f32,
    pub default_format: String,
    /// Sample rate assumed when the peer streams audio without a `meta` frame
    pub fallback_sample_rate: u32,
    /// Resample every result to this rate; unset keeps the source rate
    #[serde(default)]
    pub output_sample_rate: Option<u32>,
}

/// Performance tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSettings {
    /// Maximum number of transcode jobs running on blocking threads at once
    pub transcode_workers: usize,
}

/// Where the command-line client writes synthesized audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    pub dir: String,
    pub basename: String,
}

/// Provides default configuration values.
///
/// Defaults ensure the client can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings {
                url: "ws://127.0.0.1:8080/v1/audio/stream".to_string(),
                connect_attempts: 3,
                initial_backoff_ms: 250,
                max_backoff_ms: 4_000,
                reconnect_delay_ms: 1_000,
                connect_timeout_ms: 10_000,
                keepalive_interval_secs: 30,
            },
            requests: RequestSettings {
                timeout_ms: 60_000, // long texts can take a while to synthesize
            },
            breaker: BreakerSettings {
                failure_threshold: 5,
                reset_timeout_ms: 30_000,
                failure_window_ms: 60_000,
            },
            synthesis: SynthesisSettings {
                default_voice: "af_heart".to_string(),
                default_speed: 1.0,
                default_format: "wav".to_string(),
                fallback_sample_rate: 24_000,
                output_sample_rate: None,
            },
            performance: PerformanceSettings {
                transcode_workers: 2,
            },
            output: OutputSettings {
                dir: "client_out".to_string(),
                basename: "utt".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle `VOXLINK_URL` as a shortcut for the endpoint
    ///
    /// ## Environment Variable Examples:
    /// Sections and keys are joined with a double underscore, because the
    /// keys themselves contain single underscores.
    /// - `APP_CONNECTION__URL=wss://tts.example.com/stream`
    /// - `APP_REQUESTS__TIMEOUT_MS=30000`
    /// - `APP_BREAKER__FAILURE_THRESHOLD=3`
    pub fn load() -> SynthResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(url) = env::var("VOXLINK_URL") {
            settings = settings.set_override("connection.url", url)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The endpoint is a ws:// or wss:// URL
    /// - Counts, timeouts and intervals are non-zero
    /// - The default speed is a positive finite number
    /// - The default output format is one we can produce
    pub fn validate(&self) -> SynthResult<()> {
        let url = &self.connection.url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SynthError::Config(format!(
                "Connection URL must start with ws:// or wss://, got '{}'",
                url
            )));
        }

        if self.connection.connect_attempts == 0 {
            return Err(SynthError::Config("Connect attempts must be greater than 0".into()));
        }

        if self.connection.initial_backoff_ms > self.connection.max_backoff_ms {
            return Err(SynthError::Config(
                "Initial backoff cannot exceed the maximum backoff".into(),
            ));
        }

        if self.connection.keepalive_interval_secs == 0 {
            return Err(SynthError::Config("Keep-alive interval must be greater than 0".into()));
        }

        if self.requests.timeout_ms == 0 {
            return Err(SynthError::Config("Request timeout must be greater than 0".into()));
        }

        if self.breaker.failure_threshold == 0 {
            return Err(SynthError::Config(
                "Breaker failure threshold must be greater than 0".into(),
            ));
        }

        if !(self.synthesis.default_speed.is_finite() && self.synthesis.default_speed > 0.0) {
            return Err(SynthError::Config("Default speed must be a positive number".into()));
        }

        if self.synthesis.fallback_sample_rate == 0 {
            return Err(SynthError::Config("Fallback sample rate must be greater than 0".into()));
        }

        if self.synthesis.output_sample_rate == Some(0) {
            return Err(SynthError::Config("Output sample rate must be greater than 0".into()));
        }

        self.synthesis.default_format.parse::<OutputFormat>()?;

        if self.performance.transcode_workers == 0 {
            return Err(SynthError::Config("Transcode workers must be greater than 0".into()));
        }

        Ok(())
    }

    /// Build the typed configuration consumed by [`crate::SynthesisManager`].
    pub fn manager_config(&self) -> SynthResult<ManagerConfig> {
        let format = self.synthesis.default_format.parse()?;
        Ok(self.manager_config_with_format(format))
    }

    fn manager_config_with_format(&self, format: OutputFormat) -> ManagerConfig {
        ManagerConfig {
            retry: RetryPolicy {
                max_attempts: self.connection.connect_attempts,
                initial_backoff: Duration::from_millis(self.connection.initial_backoff_ms),
                max_backoff: Duration::from_millis(self.connection.max_backoff_ms),
            },
            reconnect_delay: Duration::from_millis(self.connection.reconnect_delay_ms),
            keepalive_interval: Duration::from_secs(self.connection.keepalive_interval_secs),
            request_timeout: Duration::from_millis(self.requests.timeout_ms),
            breaker: BreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
                failure_window: Duration::from_millis(self.breaker.failure_window_ms),
            },
            defaults: RequestDefaults {
                voice: self.synthesis.default_voice.clone(),
                speed: self.synthesis.default_speed,
                format,
                sample_rate: self.synthesis.output_sample_rate,
            },
            fallback_sample_rate: self.synthesis.fallback_sample_rate,
            transcode_workers: self.performance.transcode_workers,
        }
    }
}

/// Values filled into a request when the caller leaves them out.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDefaults {
    pub voice: String,
    pub speed: f32,
    pub format: OutputFormat,
    pub sample_rate: Option<u32>,
}

/// Typed runtime configuration of one manager instance.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    pub reconnect_delay: Duration,
    pub keepalive_interval: Duration,
    pub request_timeout: Duration,
    pub breaker: BreakerConfig,
    pub defaults: RequestDefaults,
    pub fallback_sample_rate: u32,
    pub transcode_workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        AppConfig::default().manager_config_with_format(OutputFormat::Wav)
    }
}
