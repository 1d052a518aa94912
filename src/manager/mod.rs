//! # Synthesis Manager
//!
//! The public face of the client. A [`SynthesisManager`] is a cheap, cloneable
//! handle to one dispatcher task; all handles share the same connection,
//! queue and breaker.
//!
//! ## Usage:
//! ```no_run
//! use voxlink::{AppConfig, OutputFormat, SynthesisManager, SynthesisOptions};
//!
//! # async fn demo() -> voxlink::SynthResult<()> {
//! let manager = SynthesisManager::from_config(&AppConfig::load()?)?;
//! let audio = manager
//!     .submit("Hello there.", SynthesisOptions::default().format(OutputFormat::Mulaw))
//!     .await?;
//! println!("{} bytes at {} Hz", audio.bytes.len(), audio.sample_rate);
//! manager.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees:
//! - Requests are sent one at a time and resolved in submission order
//! - Every `submit` resolves exactly once, with audio or a [`SynthError`]
//! - After `close()` returns, nothing is resolved any more

pub mod connection;
mod dispatcher;
pub mod request;

use crate::breaker::BreakerState;
use crate::config::{AppConfig, ManagerConfig};
use crate::error::{SynthError, SynthResult};
use crate::state::{ManagerMetrics, SharedMetrics};
use crate::transport::{Connector, WsConnector};
use connection::ConnectionState;
use dispatcher::{Command, Dispatcher};
use request::{RequestId, SynthesisOptions, SynthesizedAudio};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Snapshot of the manager's internal state.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStatus {
    pub connection: ConnectionState,
    pub breaker: BreakerState,
    /// Requests waiting behind the active one
    pub queue_depth: usize,
    pub active_request: Option<RequestId>,
    /// Finished requests whose result is not yet delivered
    pub awaiting_resolution: usize,
    /// A timed-out request's frames are still being discarded
    pub draining: bool,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub struct SynthesisManager {
    commands: mpsc::UnboundedSender<Command>,
    metrics: SharedMetrics,
}

impl SynthesisManager {
    /// Start a manager on the current tokio runtime.
    ///
    /// Nothing connects until the first `submit` or `ensure_open`.
    pub fn new(config: ManagerConfig, connector: impl Connector) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let metrics = SharedMetrics::new();
        let connector: Arc<dyn Connector> = Arc::new(connector);

        let dispatcher = Dispatcher::new(config, connector, metrics.clone(), receiver);
        tokio::spawn(dispatcher.run());

        Self { commands, metrics }
    }

    /// Manager talking WebSocket to the endpoint in `config`.
    pub fn from_config(config: &AppConfig) -> SynthResult<Self> {
        let manager_config = config.manager_config()?;
        Ok(Self::new(
            manager_config,
            WsConnector::from_settings(&config.connection),
        ))
    }

    /// Synthesize `text` and wait for the transcoded result.
    pub async fn submit(
        &self,
        text: impl Into<String>,
        options: SynthesisOptions,
    ) -> SynthResult<SynthesizedAudio> {
        let (responder, result) = oneshot::channel();
        self.send(Command::Submit {
            text: text.into(),
            options,
            responder,
        })?;
        result.await.map_err(|_| SynthError::Closed)?
    }

    /// Wait until the connection is open, connecting if necessary.
    ///
    /// Concurrent callers share a single connect attempt.
    pub async fn ensure_open(&self) -> SynthResult<()> {
        let (responder, result) = oneshot::channel();
        self.send(Command::EnsureOpen { responder })?;
        result.await.map_err(|_| SynthError::Closed)?
    }

    pub async fn status(&self) -> SynthResult<ManagerStatus> {
        let (responder, result) = oneshot::channel();
        self.send(Command::Status { responder })?;
        result.await.map_err(|_| SynthError::Closed)
    }

    pub fn metrics(&self) -> ManagerMetrics {
        self.metrics.snapshot()
    }

    /// Reject everything outstanding with [`SynthError::Closed`] and close
    /// the connection. Idempotent.
    pub async fn close(&self) {
        let (responder, done) = oneshot::channel();
        if self.send(Command::Close { responder }).is_ok() {
            let _ = done.await;
        }
    }

    fn send(&self, command: Command) -> SynthResult<()> {
        self.commands.send(command).map_err(|_| SynthError::Closed)
    }
}
