//! Streaming Session Controller - The coordination layer
//!
//! Opens a live session, then hands it to a dispatch task that is the single
//! logical owner of everything stateful: the playback scheduler, the transcript
//! buffers, the tool broker and the capture adapter. Inbound messages are
//! handled one at a time in wire order; host requests (close, transcript
//! snapshots) reach the same task over a command channel.
//!
//! Outbound traffic goes through a writer task. The [`SessionHandle`] only
//! enqueues, and it checks the session state under the same lock that guards
//! transitions, so nothing enters the queue once the session has left `Open`.
//! A failed session's backlog is discarded, never written.
//!
//! Inbound traffic is read by its own reader task, so `InboundStream::next`
//! is never cancelled mid-message by a host command winning the race.

use crate::audio::AudioBackend;
use crate::broker::{ResultSink, ToolDispatchBroker, ToolHandler};
use crate::capture::{AudioCaptureAdapter, AudioFrame, CaptureDevice, FrameSink};
use crate::config::{AudioFormat, LiveConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::interruption::InterruptionHandler;
use crate::playback::{AudioPlaybackScheduler, OutputDevice};
use crate::protocol::{ClientMessage, InboundEvent, ServerMessage, SetupMessage};
use crate::tools::ToolResult;
use crate::transcript::{TranscriptAggregator, TranscriptBuffer, TranscriptKind};
use crate::transport::{InboundStream, LiveConnector, OutboundSink};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of one session.
///
/// `Idle → Connecting → Open → Closing → Closed`, or `Failed` from anything
/// but `Closed`. Transitions never go backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Connecting) | (Connecting, Open) | (Open, Closing) | (Closing, Closed) => true,
            _ => false,
        }
    }

    /// `Failed` behaves like `Closed` for send and close purposes.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the user sees. `Display` renders the status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Listening,
    Error(String),
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Idle => f.write_str("idle"),
            SessionStatus::Connecting => f.write_str("connecting"),
            SessionStatus::Listening => f.write_str("listening"),
            SessionStatus::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Lifecycle events and terminal errors surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SessionStarted,
    SessionClosed,
    ToolInvoked { name: String },
    Error(String),
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::SessionStarted => f.write_str("session started"),
            Notification::SessionClosed => f.write_str("session closed"),
            Notification::ToolInvoked { name } => write!(f, "executing: {}", name),
            Notification::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Host notification sink. Called from the dispatch task; must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs notifications through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::Error(_) => warn!("📣 {}", notification),
            _ => info!("📣 {}", notification),
        }
    }
}

impl Notifier for mpsc::UnboundedSender<Notification> {
    fn notify(&self, notification: Notification) {
        let _ = self.send(notification);
    }
}

enum Outbound {
    Message(ClientMessage),
    /// Close the sink after everything queued before it was written.
    Close(oneshot::Sender<()>),
}

struct SessionShared {
    id: Uuid,
    state: Mutex<SessionState>,
    input: AudioFormat,
    output: AudioFormat,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Cheap, cloneable handle to a live session.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    fn new(input: AudioFormat, output: AudioFormat) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handle = Self {
            shared: Arc::new(SessionShared {
                id: Uuid::new_v4(),
                state: Mutex::new(SessionState::Idle),
                input,
                output,
                outbound,
            }),
        };
        (handle, outbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn input_format(&self) -> AudioFormat {
        self.shared.input
    }

    pub fn output_format(&self) -> AudioFormat {
        self.shared.output
    }

    /// Queue one captured frame for the remote service.
    ///
    /// Fails with [`VoiceError::SessionNotOpen`] unless the session is `Open`.
    pub fn send(&self, frame: &AudioFrame) -> VoiceResult<()> {
        self.post(ClientMessage::audio(&frame.data, self.shared.input))
    }

    pub(crate) fn post(&self, message: ClientMessage) -> VoiceResult<()> {
        let state = self.lock_state();
        if *state != SessionState::Open {
            return Err(VoiceError::SessionNotOpen(state.to_string()));
        }
        self.shared
            .outbound
            .send(Outbound::Message(message))
            .map_err(|_| VoiceError::SessionNotOpen("writer stopped".to_string()))
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.lock_state();
        if !state.can_transition_to(next) {
            debug!("Session {}: ignoring transition {} -> {}", self.shared.id, *state, next);
            return false;
        }
        debug!("Session {}: {} -> {}", self.shared.id, *state, next);
        *state = next;
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.shared.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl FrameSink for SessionHandle {
    fn is_open(&self) -> bool {
        SessionHandle::is_open(self)
    }

    fn send_frame(&self, frame: AudioFrame) -> VoiceResult<()> {
        self.send(&frame)
    }
}

impl ResultSink for SessionHandle {
    fn post_result(&self, result: ToolResult) -> VoiceResult<()> {
        self.post(ClientMessage::tool_result(&result))
    }
}

enum Command {
    Close(oneshot::Sender<()>),
    Transcript {
        kind: TranscriptKind,
        reply: oneshot::Sender<TranscriptBuffer>,
    },
}

struct ActiveSession {
    handle: SessionHandle,
    commands: mpsc::UnboundedSender<Command>,
}

/// Entry point for hosts: opens, observes and closes live voice sessions.
pub struct StreamingSessionController {
    connector: Arc<dyn LiveConnector>,
    backend: Arc<dyn AudioBackend>,
    handler: Arc<dyn ToolHandler>,
    notifier: Arc<dyn Notifier>,
    status: Arc<watch::Sender<SessionStatus>>,
    active: Option<ActiveSession>,
}

impl StreamingSessionController {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        backend: Arc<dyn AudioBackend>,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            connector,
            backend,
            handler,
            notifier: Arc::new(TracingNotifier),
            status: Arc::new(status),
            active: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Acquire devices, connect, negotiate, and start streaming.
    ///
    /// Devices are acquired and the microphone stream started before any
    /// network activity. Only
    /// [`VoiceError::DeviceUnavailable`] and [`VoiceError::Connection`] come back
    /// from here for a valid config; the session never reaches `Open` in either case.
    pub async fn open(&mut self, config: &LiveConfig) -> VoiceResult<SessionHandle> {
        if let Some(active) = &self.active {
            if !active.handle.state().is_terminal() {
                return Err(VoiceError::AlreadyActive);
            }
        }
        config.validate()?;
        // Drops the previous session's dispatch task and its transcripts.
        self.active = None;

        let (handle, outbound_rx) = SessionHandle::new(config.input, config.output);
        info!("🎙️ Opening live session {} (model {})", handle.id(), config.model);

        let (capture_device, output_device) = match self.acquire_devices(config) {
            Ok(devices) => devices,
            Err(e) => return Err(self.abort_open(&handle, e)),
        };

        // The stream is live from here; ticks are dropped until the session is `Open`.
        let mut capture = AudioCaptureAdapter::new(capture_device, config.input);
        let frame_sink: Arc<dyn FrameSink> = Arc::new(handle.clone());
        if let Err(e) = capture.start(frame_sink) {
            let e = match e {
                VoiceError::DeviceUnavailable(_) => e,
                other => VoiceError::DeviceUnavailable(other.to_string()),
            };
            return Err(self.abort_open(&handle, e));
        }

        handle.transition(SessionState::Connecting);
        self.set_status(SessionStatus::Connecting);

        let transport = match self.connector.connect().await {
            Ok(t) => t,
            Err(e) => {
                let e = match e {
                    VoiceError::Connection(_) => e,
                    other => VoiceError::Connection(other.to_string()),
                };
                capture.stop();
                return Err(self.abort_open(&handle, e));
            }
        };
        let mut sink = transport.sink;
        let mut stream = transport.stream;

        if let Err(e) = handshake(sink.as_mut(), stream.as_mut(), config).await {
            capture.stop();
            let _ = sink.close().await;
            return Err(self.abort_open(&handle, e));
        }

        handle.transition(SessionState::Open);

        let (writer_errors_tx, writer_errors) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(Arc::downgrade(&handle.shared), sink, outbound_rx, writer_errors_tx));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let reader = tokio::spawn(run_reader(stream, inbound_tx));

        let results: Arc<dyn ResultSink> = Arc::new(handle.clone());
        let mut transcripts = TranscriptAggregator::new(config.duplicate_policy, config.reset_input_on_output);
        transcripts.reset_all();

        let worker = SessionWorker {
            handle: handle.clone(),
            inbound,
            reader,
            writer: Some(writer),
            writer_errors,
            capture,
            scheduler: AudioPlaybackScheduler::new(output_device, config.output),
            transcripts,
            broker: ToolDispatchBroker::new(Arc::clone(&self.handler), results),
            interruption: InterruptionHandler::new(),
            notifier: Arc::clone(&self.notifier),
            status: Arc::clone(&self.status),
            close_drain_timeout: config.close_drain_timeout(),
        };

        info!("✅ Live session {} open", handle.id());
        self.set_status(SessionStatus::Listening);
        self.notifier.notify(Notification::SessionStarted);

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker.run(command_rx));

        self.active = Some(ActiveSession {
            handle: handle.clone(),
            commands,
        });
        Ok(handle)
    }

    /// Stop capture, cancel in-flight tools, flush playback and release the
    /// transport. Idempotent; resolves once the session is closed.
    pub async fn close(&mut self) -> VoiceResult<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        if active.handle.state().is_terminal() {
            return Ok(());
        }

        let (done, closed) = oneshot::channel();
        if active.commands.send(Command::Close(done)).is_ok() {
            let _ = closed.await;
        }
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// State of the current (or last) session; `Idle` before the first open.
    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map(|a| a.handle.state())
            .unwrap_or(SessionState::Idle)
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        self.active.as_ref().map(|a| a.handle.clone())
    }

    /// Snapshot of a transcript buffer. Survives the end of the session until
    /// the next one is opened.
    pub async fn transcript(&self, kind: TranscriptKind) -> TranscriptBuffer {
        if let Some(active) = &self.active {
            let (reply, snapshot) = oneshot::channel();
            if active.commands.send(Command::Transcript { kind, reply }).is_ok() {
                if let Ok(buffer) = snapshot.await {
                    return buffer;
                }
            }
        }
        TranscriptAggregator::default().buffer(kind).clone()
    }

    fn acquire_devices(
        &self,
        config: &LiveConfig,
    ) -> VoiceResult<(Box<dyn CaptureDevice>, Box<dyn OutputDevice>)> {
        let capture = self.backend.open_capture(config.input, config.block_size)?;
        let output = self.backend.open_output(config.output)?;
        Ok((capture, output))
    }

    fn abort_open(&self, handle: &SessionHandle, e: VoiceError) -> VoiceError {
        error!("❌ Failed to open session {}: {}", handle.id(), e);
        handle.transition(SessionState::Failed);
        self.set_status(SessionStatus::Error(e.to_string()));
        self.notifier.notify(Notification::Error(e.to_string()));
        e
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }
}

/// Send setup and wait for `setupComplete`. Anything else is a connection error.
async fn handshake(
    sink: &mut dyn OutboundSink,
    stream: &mut dyn InboundStream,
    config: &LiveConfig,
) -> VoiceResult<()> {
    sink.send(ClientMessage::Setup(SetupMessage::from_config(config)))
        .await
        .map_err(|e| VoiceError::Connection(format!("setup not sent: {}", e)))?;

    let reply = tokio::time::timeout(config.handshake_timeout(), stream.next())
        .await
        .map_err(|_| {
            VoiceError::Connection(format!(
                "no setupComplete within {}ms",
                config.handshake_timeout_ms
            ))
        })?;

    match reply {
        Some(Ok(message)) if message.is_setup_complete() => {
            debug!("🤝 Handshake complete");
            Ok(())
        }
        Some(Ok(_)) => Err(VoiceError::Connection(
            "expected setupComplete as the first server message".to_string(),
        )),
        Some(Err(e)) => Err(VoiceError::Connection(format!("handshake failed: {}", e))),
        None => Err(VoiceError::Connection("stream closed during handshake".to_string())),
    }
}

/// Forward inbound messages until the remote closes or the session stops listening.
async fn run_reader(
    mut stream: Box<dyn InboundStream>,
    inbound: mpsc::UnboundedSender<VoiceResult<ServerMessage>>,
) {
    while let Some(item) = stream.next().await {
        if inbound.send(item).is_err() {
            return;
        }
    }
    debug!("Inbound stream ended");
}

/// Holds the session weakly so the queue still ends once every handle is gone.
async fn run_writer(
    session: Weak<SessionShared>,
    mut sink: Box<dyn OutboundSink>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    errors: mpsc::UnboundedSender<VoiceError>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(message) => {
                let failed = session
                    .upgrade()
                    .is_some_and(|shared| SessionHandle { shared }.state() == SessionState::Failed);
                if failed {
                    debug!("Session failed; discarding queued outbound message");
                    continue;
                }
                if let Err(e) = sink.send(message).await {
                    error!("Outbound send failed: {}", e);
                    let _ = errors.send(e);
                    return;
                }
            }
            Outbound::Close(done) => {
                if let Err(e) = sink.close().await {
                    warn!("Closing outbound sink failed: {}", e);
                }
                let _ = done.send(());
                return;
            }
        }
    }
    let _ = sink.close().await;
}

struct SessionWorker {
    handle: SessionHandle,
    inbound: mpsc::UnboundedReceiver<VoiceResult<ServerMessage>>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
    writer_errors: mpsc::UnboundedReceiver<VoiceError>,
    capture: AudioCaptureAdapter,
    scheduler: AudioPlaybackScheduler,
    transcripts: TranscriptAggregator,
    broker: ToolDispatchBroker,
    interruption: InterruptionHandler,
    notifier: Arc<dyn Notifier>,
    status: Arc<watch::Sender<SessionStatus>>,
    close_drain_timeout: Duration,
}

impl SessionWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(Command::Transcript { kind, reply }) => {
                        let _ = reply.send(self.transcripts.buffer(kind).clone());
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(e) = self.writer_errors.recv() => {
                    self.fail(e).await;
                    break;
                }
                inbound = self.inbound.recv() => {
                    let keep_going = match inbound {
                        Some(Ok(message)) => self.dispatch_message(message).await,
                        Some(Err(VoiceError::ProtocolViolation(reason))) => {
                            warn!("⚠️ Dropping inbound message: {}", reason);
                            true
                        }
                        Some(Err(VoiceError::Transport(reason))) => {
                            self.dispatch(InboundEvent::StreamError(reason)).await
                        }
                        Some(Err(e)) => self.dispatch(InboundEvent::StreamError(e.to_string())).await,
                        None => self.dispatch(InboundEvent::StreamClosed).await,
                    };
                    if !keep_going {
                        break;
                    }
                }
            }
        }

        self.reader.abort();

        // Keep answering snapshot requests until the host moves on.
        while let Some(command) = commands.recv().await {
            match command {
                Command::Close(done) => {
                    let _ = done.send(());
                }
                Command::Transcript { kind, reply } => {
                    let _ = reply.send(self.transcripts.buffer(kind).clone());
                }
            }
        }
        debug!("Session {} worker finished", self.handle.id());
    }

    async fn dispatch_message(&mut self, message: ServerMessage) -> bool {
        let events = match message.into_events() {
            Ok(events) => events,
            Err(e) => {
                warn!("⚠️ Dropping inbound message: {}", e);
                return true;
            }
        };
        for event in events {
            if !self.dispatch(event).await {
                return false;
            }
        }
        true
    }

    /// Route one event to its single handler. Returns false once the session ended.
    async fn dispatch(&mut self, event: InboundEvent) -> bool {
        debug!("Inbound {}", event.kind());
        match event {
            InboundEvent::SetupComplete => {
                warn!("⚠️ Protocol violation: setupComplete after handshake; ignored");
            }
            InboundEvent::AudioChunk(pcm) => {
                if let Err(e) = self.scheduler.enqueue(&pcm, None) {
                    warn!("⚠️ Audio chunk dropped: {}", e);
                }
            }
            InboundEvent::InputTranscript(text) => {
                self.transcripts.append_delta(TranscriptKind::Input, &text);
            }
            InboundEvent::OutputTranscript(text) => {
                self.transcripts.append_delta(TranscriptKind::Output, &text);
            }
            InboundEvent::TurnComplete => self.transcripts.end_turn(),
            InboundEvent::ToolCall(call) => {
                let name = call.name.clone();
                match self.broker.handle(call) {
                    Ok(()) => self.notifier.notify(Notification::ToolInvoked { name }),
                    Err(e) => warn!("⚠️ Tool call dropped: {}", e),
                }
            }
            InboundEvent::ToolResultAck(id) => {
                if let Err(e) = self.broker.acknowledge(&id) {
                    warn!("⚠️ {}", e);
                }
            }
            InboundEvent::Interruption => {
                self.interruption.on_interrupt(&mut self.scheduler);
            }
            InboundEvent::StreamClosed => {
                self.remote_closed().await;
                return false;
            }
            InboundEvent::StreamError(reason) => {
                self.fail(VoiceError::Transport(reason)).await;
                return false;
            }
        }
        true
    }

    /// Host-initiated close.
    async fn shutdown(&mut self) {
        if self.handle.state() != SessionState::Open {
            return;
        }
        info!("🛑 Closing session {}", self.handle.id());
        self.teardown("session closing").await;
        self.handle.transition(SessionState::Closed);
        self.status.send_replace(SessionStatus::Idle);
        self.notifier.notify(Notification::SessionClosed);
    }

    async fn remote_closed(&mut self) {
        warn!("🔌 Remote closed session {} without a stop", self.handle.id());
        self.teardown("stream closed").await;
        self.handle.transition(SessionState::Closed);

        let e = VoiceError::StreamClosedUnexpectedly("remote service ended the stream".to_string());
        self.status.send_replace(SessionStatus::Error(e.to_string()));
        self.notifier.notify(Notification::Error(e.to_string()));
    }

    async fn fail(&mut self, e: VoiceError) {
        error!("❌ Session {} failed: {}", self.handle.id(), e);
        self.handle.transition(SessionState::Failed);
        self.release().await;
        self.status.send_replace(SessionStatus::Error(e.to_string()));
        self.notifier.notify(Notification::Error(e.to_string()));
    }

    /// Orderly path out of `Open`: tool cancellations still go out on the stream.
    async fn teardown(&mut self, reason: &str) {
        self.capture.stop();
        self.broker.cancel_all(reason);
        self.scheduler.flush();
        self.handle.transition(SessionState::Closing);
        self.reader.abort();
        self.finish_writer().await;
    }

    /// Path out of `Failed`: nothing more is sent, queued or not.
    async fn release(&mut self) {
        self.capture.stop();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        self.reader.abort();
        self.broker.cancel_all("session failed");
        self.scheduler.flush();
    }

    async fn finish_writer(&mut self) {
        let (done, flushed) = oneshot::channel();
        if self.handle.shared.outbound.send(Outbound::Close(done)).is_err() {
            return;
        }
        match tokio::time::timeout(self.close_drain_timeout, flushed).await {
            Ok(Ok(())) => debug!("Outbound queue drained"),
            Ok(Err(_)) => debug!("Writer already stopped"),
            Err(_) => {
                warn!(
                    "Outbound queue not drained within {:?}; dropping the rest",
                    self.close_drain_timeout
                );
                if let Some(writer) = self.writer.take() {
                    writer.abort();
                }
            }
        }
    }
}
