//! In-process stand-in for the synthesis service.
//!
//! [`ScriptedConnector`] hands every accepted connection to the test as a
//! [`Peer`], which the test then drives frame by frame.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voxlink::protocol::{
    ControlFrame, DoneInfo, InboundFrame, SampleFormat, StreamMeta, SynthesisRequest,
};
use voxlink::{
    Connector, Link, LinkEvent, LinkPeer, ManagerConfig, OutputFormat, Outbound, RetryPolicy,
    SynthError, SynthResult,
};

struct Inner {
    connects: AtomicUsize,
    refuse: AtomicBool,
    delay: Mutex<Duration>,
    peers: mpsc::UnboundedSender<LinkPeer>,
}

#[derive(Clone)]
pub struct ScriptedConnector {
    inner: Arc<Inner>,
}

pub struct PeerFeed {
    peers: mpsc::UnboundedReceiver<LinkPeer>,
}

pub fn scripted() -> (ScriptedConnector, PeerFeed) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ScriptedConnector {
            inner: Arc::new(Inner {
                connects: AtomicUsize::new(0),
                refuse: AtomicBool::new(false),
                delay: Mutex::new(Duration::ZERO),
                peers: tx,
            }),
        },
        PeerFeed { peers: rx },
    )
}

impl ScriptedConnector {
    /// Connect attempts seen so far, successful or not.
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make every handshake take this long.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = delay;
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> BoxFuture<'static, SynthResult<Link>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.connects.fetch_add(1, Ordering::SeqCst);
            let delay = *inner.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if inner.refuse.load(Ordering::SeqCst) {
                return Err(SynthError::Connection("connection refused".to_string()));
            }
            let (link, peer) = Link::pair();
            let _ = inner.peers.send(peer);
            Ok(link)
        })
    }
}

impl PeerFeed {
    /// Next accepted connection.
    pub async fn next(&mut self) -> Peer {
        let link = self.peers.recv().await.expect("connector dropped");
        Peer { link }
    }

    pub fn try_next(&mut self) -> Option<Peer> {
        self.peers.try_recv().ok().map(|link| Peer { link })
    }
}

/// Server end of one connection.
pub struct Peer {
    link: LinkPeer,
}

impl Peer {
    /// Next request frame, skipping keep-alive pings.
    pub async fn expect_request(&mut self) -> SynthesisRequest {
        loop {
            match self.link.outbound.recv().await {
                Some(Outbound::Request(request)) => return request,
                Some(Outbound::Ping) => continue,
                other => panic!("expected a request, got {:?}", other),
            }
        }
    }

    /// Whatever the client sent, without waiting.
    pub fn try_outbound(&mut self) -> Option<Outbound> {
        self.link.outbound.try_recv().ok()
    }

    /// True if a request frame is waiting; pings are consumed.
    pub fn has_pending_request(&mut self) -> bool {
        while let Some(outbound) = self.try_outbound() {
            if let Outbound::Request(_) = outbound {
                return true;
            }
        }
        false
    }

    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.link.outbound.recv().await
    }

    pub fn meta(&self, sample_rate: u32, sample_format: SampleFormat) {
        self.control(ControlFrame::Meta(StreamMeta {
            sample_rate,
            channels: 1,
            sample_format,
        }));
    }

    pub fn audio(&self, bytes: &[u8]) {
        let _ = self
            .link
            .inbound
            .send(LinkEvent::Frame(InboundFrame::Binary(bytes.to_vec())));
    }

    pub fn done(&self) {
        self.control(ControlFrame::Done(DoneInfo {
            total_ms: 120.0,
            audio_ms: 480.0,
            segments: 1,
            rtf: 0.25,
            error: None,
        }));
    }

    pub fn done_with_error(&self, message: &str) {
        self.control(ControlFrame::Done(DoneInfo {
            error: Some(message.to_string()),
            ..Default::default()
        }));
    }

    pub fn malformed(&self, reason: &str) {
        let _ = self.link.inbound.send(LinkEvent::Malformed(reason.to_string()));
    }

    /// Drop the connection from the server side.
    pub fn disconnect(self, reason: &str) {
        let _ = self
            .link
            .inbound
            .send(LinkEvent::Closed(Some(reason.to_string())));
    }

    /// Full s16 response: meta, the chunks, done.
    pub fn respond_s16(&self, chunks: &[&[u8]]) {
        self.meta(24_000, SampleFormat::S16);
        for chunk in chunks {
            self.audio(chunk);
        }
        self.done();
    }

    fn control(&self, frame: ControlFrame) {
        let _ = self
            .link
            .inbound
            .send(LinkEvent::Frame(InboundFrame::Control(frame)));
    }
}

/// Fast, deterministic settings for scenario tests; raw PCM output by default.
pub fn test_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.retry = RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    };
    config.request_timeout = Duration::from_secs(5);
    config.reconnect_delay = Duration::from_secs(1);
    config.keepalive_interval = Duration::from_secs(30);
    config.defaults.format = OutputFormat::Pcm;
    config
}

/// Let every runnable task make progress.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

pub fn s16(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}
