//! # Error Handling
//!
//! This module defines the single error type returned by every public operation
//! of the synthesis client, and how foreign errors are converted into it.
//!
//! ## Error Taxonomy:
//! - **Connection**: the transport could not be opened, or was lost mid-request
//! - **BreakerOpen**: the circuit breaker is shedding load; nothing was sent
//! - **Protocol**: the peer sent something we could not make sense of
//! - **Timeout**: one request exceeded its deadline; the connection is kept
//! - **Synthesis**: the peer reported a failure in its `done` frame
//! - **Transcode**: the assembled audio could not be converted to the target encoding
//! - **Closed**: the manager was shut down before the request finished
//! - **Config**: configuration file or environment variable problems
//!
//! ## Propagation:
//! Failures specific to one request reject only that request. Only a lost
//! connection that cannot be re-established and an explicit `close()` reject
//! several requests at once.

use std::fmt;
use std::time::Duration;

/// Error type for the synthesis client.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: the same connection failure is delivered to every
///   caller that was waiting on one connect attempt, so the error must be cloneable
/// - **PartialEq**: lets tests compare errors directly with `assert_eq!`
///
/// ## Usage Example:
/// ```rust
/// use voxlink::SynthError;
/// let err = SynthError::Synthesis("empty text".to_string());
/// assert_eq!(err.to_string(), "Synthesis failed: empty text");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SynthError {
    /// Transport could not be opened or was lost
    Connection(String),

    /// Circuit breaker is open; the request was never sent
    BreakerOpen,

    /// Unexpected frame shape, or a frame with no request to belong to
    Protocol(String),

    /// The request did not complete within its deadline
    Timeout(Duration),

    /// The peer explicitly reported failure (`done.error`), surfaced verbatim
    Synthesis(String),

    /// Assembled audio could not be converted to the requested encoding
    Transcode(String),

    /// The manager was closed; no further work is accepted
    Closed,

    /// Configuration file or environment variable problems
    Config(String),
}

impl SynthError {
    /// Whether this failure counts against the circuit breaker.
    ///
    /// Only failures that say something about the health of the peer are
    /// counted: a lost connection, a request that never finished, and an
    /// explicit synthesis failure. A breaker rejection is the breaker's own
    /// output and is never fed back into it.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            SynthError::Connection(_) | SynthError::Timeout(_) | SynthError::Synthesis(_)
        )
    }

    /// Short machine-readable name, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            SynthError::Connection(_) => "connection_error",
            SynthError::BreakerOpen => "breaker_open",
            SynthError::Protocol(_) => "protocol_error",
            SynthError::Timeout(_) => "timeout",
            SynthError::Synthesis(_) => "synthesis_error",
            SynthError::Transcode(_) => "transcode_error",
            SynthError::Closed => "closed",
            SynthError::Config(_) => "config_error",
        }
    }
}

/// Human-readable formatting of each error variant.
impl fmt::Display for SynthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthError::Connection(msg) => write!(f, "Connection error: {}", msg),
            SynthError::BreakerOpen => write!(f, "Circuit breaker is open"),
            SynthError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SynthError::Timeout(after) => {
                write!(f, "Request timed out after {} ms", after.as_millis())
            }
            SynthError::Synthesis(msg) => write!(f, "Synthesis failed: {}", msg),
            SynthError::Transcode(msg) => write!(f, "Transcode error: {}", msg),
            SynthError::Closed => write!(f, "Manager is closed"),
            SynthError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for SynthError {}

/// Malformed JSON from the peer is a protocol problem, not a transport one.
impl From<serde_json::Error> for SynthError {
    fn from(err: serde_json::Error) -> Self {
        SynthError::Protocol(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors.
///
/// ## When this happens:
/// - config.toml file has invalid syntax
/// - An environment variable cannot be parsed into the expected type
impl From<config::ConfigError> for SynthError {
    fn from(err: config::ConfigError) -> Self {
        SynthError::Config(err.to_string())
    }
}

/// Any WebSocket-level failure means the transport is unusable.
impl From<tokio_tungstenite::tungstenite::Error> for SynthError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SynthError::Connection(err.to_string())
    }
}

/// Type alias for Results that use our error type.
///
/// ## Usage Example:
/// ```rust
/// use voxlink::SynthResult;
/// fn ready() -> SynthResult<()> {
///     Ok(())
/// }
/// assert!(ready().is_ok());
/// ```
pub type SynthResult<T> = Result<T, SynthError>;
