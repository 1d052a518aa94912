//! # Transport Boundary
//!
//! The manager never touches a socket directly. It talks to a [`Link`]: an
//! outbound command channel and an inbound stream of already-classified
//! events. A [`Connector`] produces one `Link` per successful connect.
//!
//! ## Implementations:
//! - [`WsConnector`]: real WebSocket via tokio-tungstenite, with a pump task
//!   per connection that owns the socket
//! - test doubles: any type implementing [`Connector`], wired up with
//!   [`Link::pair`]
//!
//! Classification happens here, once: text units become
//! [`InboundFrame::Control`] (or [`LinkEvent::Malformed`]), binary units
//! become [`InboundFrame::Binary`].

use crate::config::ConnectionSettings;
use crate::error::{SynthError, SynthResult};
use crate::protocol::{InboundFrame, SynthesisRequest};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Commands the manager sends down a link.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialize and send one request frame
    Request(SynthesisRequest),
    /// Liveness probe
    Ping,
    /// Close the connection and stop the pump
    Close,
}

/// Everything a link reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(InboundFrame),
    /// A text unit that is not a known control frame
    Malformed(String),
    /// The connection is gone; carries the reason when there is one
    Closed(Option<String>),
}

/// Manager side of one live connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Transport side of one live connection.
#[derive(Debug)]
pub struct LinkPeer {
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
}

impl Link {
    /// Create a connected manager/transport pair.
    pub fn pair() -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }
}

/// Opens links to the synthesis service.
///
/// One call is one connection attempt; retry and backoff are the manager's job.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, SynthResult<Link>>;
}

/// WebSocket connector for the real service.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(
            settings.url.clone(),
            Duration::from_millis(settings.connect_timeout_ms),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, SynthResult<Link>> {
        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            let handshake = connect_async(url.as_str());
            let (ws_stream, response) = tokio::time::timeout(connect_timeout, handshake)
                .await
                .map_err(|_| {
                    SynthError::Connection(format!(
                        "connect to {} timed out after {} ms",
                        url,
                        connect_timeout.as_millis()
                    ))
                })??;

            info!(url = %url, status = %response.status(), "WebSocket connected");

            let (link, peer) = Link::pair();
            tokio::spawn(pump(ws_stream, peer));
            Ok(link)
        })
    }
}

/// Owns one socket: forwards outbound commands, classifies inbound units,
/// and reports a single `Closed` when the connection ends.
async fn pump(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>, mut peer: LinkPeer) {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            command = peer.outbound.recv() => {
                match command {
                    Some(Outbound::Request(request)) => {
                        let text = match serde_json::to_string(&request) {
                            Ok(text) => text,
                            Err(e) => break Some(format!("failed to encode request: {}", e)),
                        };
                        if let Err(e) = ws_sink.send(Message::Text(text)).await {
                            break Some(format!("send failed: {}", e));
                        }
                    }
                    Some(Outbound::Ping) => {
                        if let Err(e) = ws_sink.send(Message::Ping(Vec::new())).await {
                            break Some(format!("ping failed: {}", e));
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("closing WebSocket on request");
                        if let Err(e) = ws_sink.send(Message::Close(None)).await {
                            debug!("close frame not sent: {}", e);
                        }
                        let _ = ws_sink.close().await;
                        return;
                    }
                }
            }

            message = ws_stream.next() => {
                let event = match message {
                    Some(Ok(Message::Text(text))) => match InboundFrame::from_text(&text) {
                        Ok(frame) => LinkEvent::Frame(frame),
                        Err(e) => LinkEvent::Malformed(e.to_string()),
                    },
                    Some(Ok(Message::Binary(data))) => LinkEvent::Frame(InboundFrame::Binary(data)),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        break Some(match frame {
                            Some(frame) => {
                                format!("closed by peer ({}): {}", frame.code, frame.reason)
                            }
                            None => "closed by peer".to_string(),
                        });
                    }
                    Some(Err(e)) => break Some(format!("WebSocket error: {}", e)),
                    None => break None,
                };

                if peer.inbound.send(event).is_err() {
                    // Manager dropped this link
                    let _ = ws_sink.close().await;
                    return;
                }
            }
        }
    };

    warn!(reason = ?reason, "WebSocket connection ended");
    let _ = peer.inbound.send(LinkEvent::Closed(reason));
}
