//! # Dispatcher
//!
//! The single task that owns all manager state: connection, request queue,
//! active request, assembly buffer, breaker, and pending completions.
//!
//! Every input is turned into one [`Event`] and handled by [`Dispatcher::handle`];
//! nothing else mutates the state, so there are no locks and no ordering races.
//!
//! ## Inputs:
//! - commands from [`crate::SynthesisManager`] handles
//! - results of connect tasks and transcode jobs (internal channel)
//! - events from the live link
//! - the active request's deadline

use crate::audio::buffer::AssemblyBuffer;
use crate::audio::transcode::{self, SourceFormat, TranscodePool};
use crate::breaker::CircuitBreaker;
use crate::config::ManagerConfig;
use crate::error::{SynthError, SynthResult};
use crate::manager::connection::{self, ConnectPlan, ConnectionState, KeepAlive};
use crate::manager::request::{
    Completion, CompletionQueue, PendingRequest, RequestId, Responder, SynthesisOptions,
    SynthesisStats, SynthesizedAudio,
};
use crate::manager::ManagerStatus;
use crate::protocol::{ControlFrame, DoneInfo, InboundFrame, SampleFormat, StreamMeta};
use crate::state::SharedMetrics;
use crate::transport::{Connector, Link, LinkEvent, Outbound};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Requests from manager handles.
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        text: String,
        options: SynthesisOptions,
        responder: Responder,
    },
    EnsureOpen {
        responder: oneshot::Sender<SynthResult<()>>,
    },
    Status {
        responder: oneshot::Sender<ManagerStatus>,
    },
    Close {
        responder: oneshot::Sender<()>,
    },
}

/// Everything the reducer reacts to.
#[derive(Debug)]
pub(crate) enum Event {
    Command(Command),
    /// Every handle is gone
    HandlesDropped,
    Connected {
        generation: u64,
        result: SynthResult<Link>,
    },
    Link(LinkEvent),
    DeadlineElapsed,
    Transcoded {
        id: RequestId,
        result: SynthResult<SynthesizedAudio>,
    },
}

/// The connection currently in use.
struct LiveLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    _keepalive: KeepAlive,
}

/// A timed-out request whose frames are still arriving.
struct Drain {
    id: RequestId,
    /// Past this, the link is given up on
    until: Instant,
}

/// The one request on the wire (or about to be).
struct ActiveRequest {
    request: PendingRequest,
    deadline: Instant,
    dispatched_at: Instant,
    sent: bool,
    meta: Option<StreamMeta>,
    first_audio: Option<std::time::Duration>,
}

pub(crate) struct Dispatcher {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    metrics: SharedMetrics,
    pool: TranscodePool,

    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,

    state: ConnectionState,
    generation: u64,
    link: Option<LiveLink>,
    connect_task: Option<JoinHandle<()>>,
    open_waiters: Vec<oneshot::Sender<SynthResult<()>>>,

    queue: VecDeque<PendingRequest>,
    active: Option<ActiveRequest>,
    /// Request abandoned by a timeout whose `done` has not arrived yet
    draining: Option<Drain>,
    buffer: AssemblyBuffer,
    completions: CompletionQueue,
    breaker: CircuitBreaker,
    closed: bool,
}

impl Dispatcher {
    pub fn new(
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
        metrics: SharedMetrics,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            pool: TranscodePool::new(config.transcode_workers),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            config,
            connector,
            metrics,
            commands,
            events_tx,
            events_rx,
            state: ConnectionState::Disconnected,
            generation: 0,
            link: None,
            connect_task: None,
            open_waiters: Vec::new(),
            queue: VecDeque::new(),
            active: None,
            draining: None,
            buffer: AssemblyBuffer::new(),
            completions: CompletionQueue::default(),
            closed: false,
        }
    }

    /// Event loop. Returns once every handle has been dropped.
    pub async fn run(mut self) {
        debug!("dispatcher started");
        loop {
            let deadline = self.next_deadline();

            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => Event::HandlesDropped,
                },
                Some(event) = self.events_rx.recv() => event,
                link_event = next_link_event(&mut self.link) => Event::Link(link_event),
                _ = sleep_until(deadline) => Event::DeadlineElapsed,
            };

            let stop = matches!(event, Event::HandlesDropped);
            self.handle(event);
            if stop {
                break;
            }
        }
        debug!("dispatcher stopped");
    }

    /// The reducer.
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command),
            Event::HandlesDropped => self.shutdown("all manager handles dropped"),
            Event::Connected { generation, result } => self.on_connected(generation, result),
            Event::Link(link_event) => self.on_link_event(link_event),
            Event::DeadlineElapsed => self.on_deadline(),
            Event::Transcoded { id, result } => {
                if !self.completions.fulfil(id, result) {
                    debug!(request_id = %id, "transcode result discarded");
                }
                self.flush_completions();
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit {
                text,
                options,
                responder,
            } => {
                if self.closed {
                    let _ = responder.send(Err(SynthError::Closed));
                    return;
                }
                self.metrics.record_submitted();
                let request = PendingRequest::new(text, options, &self.config.defaults, responder);
                debug!(
                    request_id = %request.id,
                    chars = request.wire.text.chars().count(),
                    queue_depth = self.queue.len(),
                    "request queued"
                );
                self.queue.push_back(request);
                self.try_dispatch_next();
            }
            Command::EnsureOpen { responder } => {
                if self.closed {
                    let _ = responder.send(Err(SynthError::Closed));
                    return;
                }
                match self.state {
                    ConnectionState::Open => {
                        let _ = responder.send(Ok(()));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting => {
                        self.open_waiters.push(responder);
                    }
                    ConnectionState::Disconnected => {
                        self.open_waiters.push(responder);
                        self.start_connect(ConnectPlan::Initial(self.config.retry.clone()));
                    }
                    ConnectionState::Closing => {
                        let _ = responder.send(Err(SynthError::Closed));
                    }
                }
            }
            Command::Status { responder } => {
                let _ = responder.send(self.status());
            }
            Command::Close { responder } => {
                self.shutdown("close requested");
                let _ = responder.send(());
            }
        }
    }

    fn status(&self) -> ManagerStatus {
        ManagerStatus {
            connection: self.state,
            breaker: self.breaker.state(),
            queue_depth: self.queue.len(),
            active_request: self.active.as_ref().map(|active| active.request.id),
            awaiting_resolution: self.completions.len(),
            draining: self.draining.is_some(),
            closed: self.closed,
        }
    }

    /// While draining, only the drain's bound is armed: a held request's
    /// clock restarts when the drain ends.
    fn next_deadline(&self) -> Option<Instant> {
        match &self.draining {
            Some(drain) => Some(drain.until),
            None => self.active.as_ref().map(|active| active.deadline),
        }
    }

    // ---- dispatch ----

    fn try_dispatch_next(&mut self) {
        while !self.closed && self.active.is_none() {
            let Some(request) = self.queue.pop_front() else {
                return;
            };

            if let Err(err) = self.breaker.try_acquire() {
                debug!(request_id = %request.id, "request rejected by circuit breaker");
                self.completions.push(request, Some(Err(err)));
                self.flush_completions();
                continue;
            }

            let now = Instant::now();
            debug!(request_id = %request.id, "request dispatched");
            self.buffer.clear();
            self.active = Some(ActiveRequest {
                request,
                deadline: now + self.config.request_timeout,
                dispatched_at: now,
                sent: false,
                meta: None,
                first_audio: None,
            });
            self.send_active();
        }
    }

    /// Put the active request on the wire, connecting first if needed.
    fn send_active(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if active.sent || self.draining.is_some() {
            return;
        }

        match self.state {
            ConnectionState::Open => {
                let Some(link) = self.link.as_ref() else {
                    return;
                };
                let frame = Outbound::Request(active.request.wire.clone());
                if link.outbound.send(frame).is_ok() {
                    active.sent = true;
                    active.dispatched_at = Instant::now();
                    debug!(request_id = %active.request.id, "request frame sent");
                } else {
                    self.fail_active(SynthError::Connection(
                        "connection lost before the request could be sent".to_string(),
                    ));
                }
            }
            ConnectionState::Disconnected => {
                self.start_connect(ConnectPlan::Initial(self.config.retry.clone()));
            }
            // Sent once the pending connect opens
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            ConnectionState::Closing => {}
        }
    }

    /// Reject the active request and release its slot.
    fn fail_active(&mut self, err: SynthError) {
        let counts = err.counts_as_failure();
        self.reject_active(err, counts);
    }

    fn reject_active(&mut self, err: SynthError, counts: bool) {
        let Some(active) = self.active.take() else {
            return;
        };
        self.buffer.clear();

        if counts {
            self.breaker.record_failure();
        } else {
            self.breaker.release();
        }

        self.completions.push(active.request, Some(Err(err)));
        self.flush_completions();
    }

    /// Handle the terminal `done` of the active request.
    fn complete_active(&mut self, done: DoneInfo) {
        let Some(active) = self.active.take() else {
            return;
        };

        if let Some(message) = done.error {
            self.buffer.clear();
            self.breaker.record_failure();
            self.completions
                .push(active.request, Some(Err(SynthError::Synthesis(message))));
            self.flush_completions();
            return;
        }

        self.breaker.record_success();

        let data = self.buffer.take();
        let source = match active.meta {
            Some(meta) => SourceFormat {
                sample_rate: meta.sample_rate,
                sample_format: meta.sample_format,
            },
            None => SourceFormat {
                sample_rate: self.config.fallback_sample_rate,
                sample_format: SampleFormat::S16,
            },
        };
        let stats = SynthesisStats {
            total_ms: done.total_ms,
            audio_ms: done.audio_ms,
            segments: done.segments,
            rtf: done.rtf,
            time_to_first_audio: active.first_audio,
            wall_time: active.dispatched_at.elapsed(),
        };

        let id = active.request.id;
        let target = active.request.target;
        debug!(
            request_id = %id,
            bytes = data.len(),
            segments = done.segments,
            rtf = done.rtf,
            "synthesis done"
        );

        if target.needs_offload(&source) {
            self.completions.push(active.request, None);
            let pool = self.pool.clone();
            let events = self.events_tx.clone();
            tokio::spawn(async move {
                let result = pool
                    .run(data, source, target)
                    .await
                    .map(|audio| SynthesizedAudio::new(id, audio, stats));
                let _ = events.send(Event::Transcoded { id, result });
            });
        } else {
            let result = transcode::transcode(data, source, target)
                .map(|audio| SynthesizedAudio::new(id, audio, stats));
            self.completions.push(active.request, Some(result));
            self.flush_completions();
        }
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        if let Some(drain) = &self.draining {
            if now >= drain.until {
                self.recycle_stalled_link();
            }
            return;
        }

        let Some(active) = self.active.as_ref() else {
            return;
        };
        if now < active.deadline {
            return;
        }

        let id = active.request.id;
        warn!(
            request_id = %id,
            timeout_ms = self.config.request_timeout.as_millis() as u64,
            "request timed out"
        );

        // Only a request the peer actually received says something about the peer
        let sent = active.sent;
        if sent {
            // Its frames must not leak into the next request
            self.draining = Some(Drain {
                id,
                until: now + self.config.request_timeout,
            });
        }
        self.reject_active(SynthError::Timeout(self.config.request_timeout), sent);
        self.try_dispatch_next();
    }

    /// Give a request held back by a drain its full timeout from now on.
    fn restart_held_deadline(&mut self) {
        let deadline = Instant::now() + self.config.request_timeout;
        if let Some(active) = self.active.as_mut().filter(|active| !active.sent) {
            active.deadline = deadline;
        }
    }

    /// The abandoned request never finished: drop the link and open a fresh
    /// one for whatever is waiting.
    fn recycle_stalled_link(&mut self) {
        let Some(drain) = self.draining.take() else {
            return;
        };
        warn!(
            request_id = %drain.id,
            "abandoned request never finished, recycling the connection"
        );

        if let Some(link) = self.link.take() {
            let _ = link.outbound.send(Outbound::Close);
        }
        self.buffer.clear();
        self.restart_held_deadline();

        if self.active.is_some() || !self.queue.is_empty() {
            self.metrics.record_reconnect();
            self.start_connect(ConnectPlan::Initial(self.config.retry.clone()));
        } else {
            self.state = ConnectionState::Disconnected;
        }
    }

    // ---- inbound ----

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => {
                if let Some(abandoned) = self.draining.as_ref().map(|drain| drain.id) {
                    self.drain(abandoned, frame);
                    return;
                }
                match frame {
                    InboundFrame::Control(control) => self.on_control(control),
                    InboundFrame::Binary(chunk) => self.on_binary(chunk),
                }
            }
            LinkEvent::Malformed(reason) => {
                warn!(reason = %reason, "discarding malformed frame");
                self.metrics.record_protocol_error();
            }
            LinkEvent::Closed(reason) => self.on_disconnect(reason),
        }
    }

    fn drain(&mut self, abandoned: RequestId, frame: InboundFrame) {
        self.metrics.record_drained_frame();
        if let InboundFrame::Control(ControlFrame::Done(_)) = frame {
            debug!(request_id = %abandoned, "abandoned request finished, resuming dispatch");
            self.draining = None;
            self.restart_held_deadline();
            self.send_active();
            self.try_dispatch_next();
        }
    }

    fn on_control(&mut self, control: ControlFrame) {
        match control {
            ControlFrame::Meta(meta) => {
                let Some(active) = self.active.as_mut().filter(|active| active.sent) else {
                    self.protocol_error("meta frame with no active request");
                    return;
                };
                if active.meta.is_some() || !self.buffer.is_empty() {
                    self.protocol_error("meta frame after audio or repeated");
                    return;
                }
                debug!(
                    request_id = %active.request.id,
                    sample_rate = meta.sample_rate,
                    sample_format = ?meta.sample_format,
                    "stream metadata received"
                );
                active.meta = Some(meta);
            }
            ControlFrame::Progress(progress) => {
                debug!(
                    segment = ?progress.segment,
                    elapsed_ms = ?progress.elapsed_ms,
                    audio_ms = ?progress.audio_ms,
                    "synthesis progress"
                );
            }
            ControlFrame::Done(done) => {
                if !self.active.as_ref().is_some_and(|active| active.sent) {
                    self.protocol_error("done frame with no active request");
                    return;
                }
                self.complete_active(done);
                self.try_dispatch_next();
            }
        }
    }

    fn on_binary(&mut self, chunk: Vec<u8>) {
        let Some(active) = self.active.as_mut().filter(|active| active.sent) else {
            self.protocol_error("binary frame with no active request");
            return;
        };
        if active.first_audio.is_none() {
            let ttfa = active.dispatched_at.elapsed();
            debug!(
                request_id = %active.request.id,
                ttfa_ms = ttfa.as_millis() as u64,
                "first audio"
            );
            active.first_audio = Some(ttfa);
        }
        self.metrics.record_audio_bytes(chunk.len());
        self.buffer.push(chunk);
    }

    fn protocol_error(&self, what: &str) {
        warn!("protocol error: {}", what);
        self.metrics.record_protocol_error();
    }

    // ---- connection ----

    fn start_connect(&mut self, plan: ConnectPlan) {
        self.generation += 1;
        let generation = self.generation;
        self.state = match plan {
            ConnectPlan::Initial(_) => ConnectionState::Connecting,
            ConnectPlan::Reconnect { .. } => ConnectionState::Reconnecting,
        };
        info!(generation, state = %self.state, "connecting");

        let connector = self.connector.clone();
        let metrics = self.metrics.clone();
        let events = self.events_tx.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = connection::establish(connector.as_ref(), plan, &metrics).await;
            let _ = events.send(Event::Connected { generation, result });
        }));
    }

    fn on_connected(&mut self, generation: u64, result: SynthResult<Link>) {
        if self.closed || generation != self.generation {
            if let Ok(link) = result {
                let _ = link.outbound.send(Outbound::Close);
            }
            debug!(generation, "stale connect result ignored");
            return;
        }
        self.connect_task = None;
        let was_reconnect = self.state == ConnectionState::Reconnecting;

        match result {
            Ok(link) => {
                info!(generation, "connection open");
                self.metrics.record_connection_opened();
                let keepalive = KeepAlive::start(
                    link.outbound.clone(),
                    self.config.keepalive_interval,
                    self.metrics.clone(),
                );
                self.link = Some(LiveLink {
                    outbound: link.outbound,
                    inbound: link.inbound,
                    _keepalive: keepalive,
                });
                self.state = ConnectionState::Open;

                for waiter in self.open_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                self.send_active();
                self.try_dispatch_next();
            }
            Err(err) => {
                error!(generation, error = %err, "could not open connection");
                self.state = ConnectionState::Disconnected;

                for waiter in self.open_waiters.drain(..) {
                    let _ = waiter.send(Err(err.clone()));
                }

                self.fail_active(err.clone());
                if was_reconnect {
                    self.reject_queued(&err);
                }
                // Whatever is still queued starts a fresh connect
                self.try_dispatch_next();
            }
        }
    }

    fn on_disconnect(&mut self, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "connection closed".to_string());
        warn!(reason = %reason, "connection lost");

        self.link = None;
        if self.draining.take().is_some() {
            self.restart_held_deadline();
        }

        let outstanding = self.active.is_some() || !self.queue.is_empty();
        // A request still held back never reached the peer; it goes out on the new link
        if self.active.as_ref().is_some_and(|active| active.sent) {
            self.fail_active(SynthError::Connection(format!("connection lost: {}", reason)));
        }

        if outstanding {
            self.metrics.record_reconnect();
            self.start_connect(ConnectPlan::Reconnect {
                delay: self.config.reconnect_delay,
            });
            self.try_dispatch_next();
        } else {
            self.state = ConnectionState::Disconnected;
        }
    }

    fn reject_queued(&mut self, err: &SynthError) {
        while let Some(request) = self.queue.pop_front() {
            self.completions.push(request, Some(Err(err.clone())));
        }
        self.flush_completions();
    }

    // ---- resolution ----

    fn flush_completions(&mut self) {
        while let Some((completion, outcome)) = self.completions.pop_ready() {
            self.deliver(completion, outcome);
        }
    }

    fn deliver(&self, completion: Completion, outcome: SynthResult<SynthesizedAudio>) {
        let latency = completion.submitted_at.elapsed();
        self.metrics
            .record_outcome(completion.format, latency, outcome.as_ref().map(|_| ()));

        match &outcome {
            Ok(audio) => info!(
                request_id = %completion.id,
                format = %audio.format,
                bytes = audio.bytes.len(),
                latency_ms = latency.as_millis() as u64,
                "request completed"
            ),
            Err(err) => warn!(
                request_id = %completion.id,
                kind = err.kind(),
                error = %err,
                "request failed"
            ),
        }

        if completion.responder.send(outcome).is_err() {
            debug!(request_id = %completion.id, "caller went away before resolution");
        }
    }

    /// Hard stop: reject everything outstanding with `Closed`, drop the link,
    /// never reconnect.
    fn shutdown(&mut self, why: &str) {
        if self.closed {
            return;
        }
        info!(reason = why, "closing synthesis manager");
        self.state = ConnectionState::Closing;
        self.closed = true;

        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            let _ = link.outbound.send(Outbound::Close);
        }
        self.draining = None;
        self.buffer.clear();

        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(SynthError::Closed));
        }

        // Oldest first: finished-but-unresolved, then active, then queued
        if let Some(active) = self.active.take() {
            self.breaker.release();
            self.completions.push(active.request, None);
        }
        while let Some(request) = self.queue.pop_front() {
            self.completions.push(request, None);
        }
        for completion in self.completions.drain_all() {
            self.deliver(completion, Err(SynthError::Closed));
        }

        self.state = ConnectionState::Disconnected;
    }
}

async fn next_link_event(link: &mut Option<LiveLink>) -> LinkEvent {
    match link {
        Some(live) => live
            .inbound
            .recv()
            .await
            .unwrap_or_else(|| LinkEvent::Closed(Some("transport dropped".to_string()))),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
