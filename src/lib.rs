//! # voxlink
//!
//! Client-side connection manager for a streaming text-to-speech service.
//! One long-lived WebSocket, requests serialized over it one at a time, and
//! the multi-frame audio of each response reassembled and transcoded into a
//! single buffer.
//!
//! ## Modules:
//! - **manager**: the public handle, dispatcher, connection lifecycle
//! - **breaker**: circuit breaker around dispatch
//! - **transport**: the connector seam and the WebSocket implementation
//! - **protocol**: wire messages and inbound frame classification
//! - **audio**: reassembly, sample conversion, μ-law, transcoding
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **state**: shared metrics
//! - **error**: the crate error type

pub mod audio;
pub mod breaker;
pub mod config;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod state;
pub mod transport;

pub use audio::transcode::OutputFormat;
pub use breaker::{BreakerConfig, BreakerState};
pub use config::{AppConfig, ManagerConfig, RequestDefaults};
pub use error::{SynthError, SynthResult};
pub use manager::connection::{ConnectionState, RetryPolicy};
pub use manager::request::{RequestId, SynthesisOptions, SynthesisStats, SynthesizedAudio};
pub use manager::{ManagerStatus, SynthesisManager};
pub use state::{FormatMetric, ManagerMetrics};
pub use transport::{Connector, Link, LinkEvent, LinkPeer, Outbound, WsConnector};
