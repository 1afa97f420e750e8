//! End-to-end session tests over the in-memory transport and virtual devices.
//!
//! The remote service is played by a `RemoteEnd`; microphone and speaker are the
//! virtual backend, so none of these need audio hardware.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use studio_voice::protocol::ClientMessage;
use studio_voice::{
    AudioBackend, AudioFormat, CaptureDevice, FnToolHandler, InboundStream, LiveConfig, LiveConnector,
    MemoryConnector, Notification, OutboundSink, OutputDevice, RemoteEnd, ServerMessage, SessionState,
    SessionStatus, StreamingSessionController, StudioTool, ToolCall, Transport, TranscriptKind,
    VirtualBackend, VoiceError, VoiceResult,
};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

const OUT: AudioFormat = AudioFormat::new(24000, 1);
const WAIT: Duration = Duration::from_secs(2);

struct Harness {
    controller: StreamingSessionController,
    remote: RemoteEnd,
    backend: VirtualBackend,
    notes: mpsc::UnboundedReceiver<Notification>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn studio_handler() -> FnToolHandler {
    FnToolHandler::from_sync(|tool| match tool {
        StudioTool::ManageCalendar(event) => {
            Ok(json!({ "status": "scheduled", "title": event.event_title }))
        }
        StudioTool::OrganizePhotos(archive) => Ok(json!({ "moved": archive.count })),
        StudioTool::ConnectCloud => Ok(serde_json::Value::Null),
        StudioTool::Unknown { name, .. } => anyhow::bail!("no such tool: {}", name),
    })
}

fn controller_with(
    connector: Arc<dyn LiveConnector>,
    backend: &VirtualBackend,
    handler: FnToolHandler,
) -> (StreamingSessionController, mpsc::UnboundedReceiver<Notification>) {
    let (notes_tx, notes) = mpsc::unbounded_channel();
    let controller = StreamingSessionController::new(connector, Arc::new(backend.clone()), Arc::new(handler))
        .with_notifier(Arc::new(notes_tx));
    (controller, notes)
}

async fn open_session(handler: FnToolHandler, config: LiveConfig) -> Harness {
    init_tracing();
    let backend = VirtualBackend::new(config.block_size);
    let (connector, mut remote) = MemoryConnector::new();
    let (mut controller, mut notes) = controller_with(Arc::new(connector), &backend, handler);

    let server = tokio::spawn(async move {
        let setup = remote.accept().await;
        (remote, setup)
    });
    controller.open(&config).await.expect("session should open");
    let (remote, setup) = server.await.unwrap();
    let setup = setup.expect("setup message");
    assert_eq!(setup.model, format!("models/{}", config.model));

    assert_eq!(notes.recv().await, Some(Notification::SessionStarted));
    Harness {
        controller,
        remote,
        backend,
        notes,
    }
}

fn pcm_seconds(seconds: f64) -> Vec<u8> {
    vec![0u8; (seconds * OUT.sample_rate as f64).round() as usize * 2]
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Memory transport with a slow, counting sink for audio frames and an inbound
/// stream that awaits again after every message it receives.
struct ShapedConnector {
    inner: MemoryConnector,
    frame_delay: Duration,
    inbound_delay: Duration,
    frames_written: Arc<AtomicUsize>,
}

impl ShapedConnector {
    fn new(inner: MemoryConnector, frame_delay: Duration, inbound_delay: Duration) -> Self {
        Self {
            inner,
            frame_delay,
            inbound_delay,
            frames_written: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl LiveConnector for ShapedConnector {
    async fn connect(&self) -> VoiceResult<Transport> {
        let transport = self.inner.connect().await?;
        Ok(Transport {
            sink: Box::new(SlowSink {
                inner: transport.sink,
                delay: self.frame_delay,
                written: Arc::clone(&self.frames_written),
            }),
            stream: Box::new(LaggingStream {
                inner: transport.stream,
                delay: self.inbound_delay,
            }),
        })
    }
}

struct SlowSink {
    inner: Box<dyn OutboundSink>,
    delay: Duration,
    written: Arc<AtomicUsize>,
}

#[async_trait]
impl OutboundSink for SlowSink {
    async fn send(&mut self, message: ClientMessage) -> VoiceResult<()> {
        if matches!(message, ClientMessage::RealtimeInput(_)) {
            tokio::time::sleep(self.delay).await;
            self.written.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.send(message).await
    }

    async fn close(&mut self) -> VoiceResult<()> {
        self.inner.close().await
    }
}

struct LaggingStream {
    inner: Box<dyn InboundStream>,
    delay: Duration,
}

#[async_trait]
impl InboundStream for LaggingStream {
    async fn next(&mut self) -> Option<VoiceResult<ServerMessage>> {
        let item = self.inner.next().await;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        item
    }
}

/// Microphone that exists but cannot run the requested format.
struct UnsupportedMic;

impl CaptureDevice for UnsupportedMic {
    fn start(&mut self, _blocks: mpsc::UnboundedSender<Vec<f32>>) -> VoiceResult<()> {
        Err(VoiceError::AudioStream("16 kHz f32 not supported".to_string()))
    }

    fn stop(&mut self) {}
}

struct UnsupportedMicBackend(VirtualBackend);

impl AudioBackend for UnsupportedMicBackend {
    fn open_capture(&self, _format: AudioFormat, _block_size: usize) -> VoiceResult<Box<dyn CaptureDevice>> {
        Ok(Box::new(UnsupportedMic))
    }

    fn open_output(&self, format: AudioFormat) -> VoiceResult<Box<dyn OutputDevice>> {
        self.0.open_output(format)
    }
}

async fn open_with(
    connector: Arc<dyn LiveConnector>,
    mut remote: RemoteEnd,
    backend: &VirtualBackend,
) -> (StreamingSessionController, RemoteEnd) {
    init_tracing();
    let (mut controller, _notes) = controller_with(connector, backend, studio_handler());
    let server = tokio::spawn(async move {
        remote.accept().await;
        remote
    });
    controller.open(&LiveConfig::default()).await.expect("session should open");
    (controller, server.await.unwrap())
}

fn first_sample(message: &ClientMessage) -> i16 {
    match message {
        ClientMessage::RealtimeInput(input) => {
            let bytes = input.media_chunks[0].decode().unwrap();
            i16::from_le_bytes([bytes[0], bytes[1]])
        }
        other => panic!("expected realtime input, got {:?}", other),
    }
}

#[tokio::test]
async fn capture_ticks_become_ordered_frames() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;
    assert_eq!(h.controller.status(), SessionStatus::Listening);
    assert_eq!(h.controller.status().to_string(), "listening");

    let mic = h.backend.mic();
    assert!(mic.push_level(0.1));
    assert!(mic.push_level(0.2));
    assert!(mic.push_level(0.3));

    let mut samples = Vec::new();
    for _ in 0..3 {
        let message = h.remote.recv_timeout(WAIT).await.expect("frame");
        if let ClientMessage::RealtimeInput(input) = &message {
            assert_eq!(input.media_chunks[0].mime_type, "audio/pcm;rate=16000");
            assert_eq!(input.media_chunks[0].decode().unwrap().len(), 8192);
        }
        samples.push(first_sample(&message));
    }
    assert_eq!(samples, vec![3277, 6553, 9830]);

    assert_ok!(h.controller.close().await);
}

#[tokio::test]
async fn inbound_audio_is_scheduled_back_to_back() {
    let h = open_session(studio_handler(), LiveConfig::default()).await;
    let speaker = h.backend.speaker();

    h.remote.send(ServerMessage::audio(&pcm_seconds(0.5), OUT));
    h.remote.send(ServerMessage::audio(&pcm_seconds(0.3), OUT));
    wait_until(|| speaker.history().len() == 2).await;

    let history = speaker.history();
    assert_eq!(history[0].start, 0.0);
    assert!((history[1].start - 0.5).abs() < 1e-9);
    let end = history[1].start + OUT.duration_of(history[1].samples).as_secs_f64();
    assert!((end - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn tool_call_answered_exactly_once() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;

    h.remote.send(ServerMessage::tool_call(ToolCall::new(
        "abc",
        "manage_calendar",
        json!({ "eventTitle": "Site Visit" }),
    )));

    assert_eq!(
        h.notes.recv().await,
        Some(Notification::ToolInvoked {
            name: "manage_calendar".to_string()
        })
    );

    match h.remote.recv_timeout(WAIT).await {
        Some(ClientMessage::ToolResponse(response)) => {
            assert_eq!(response.function_responses.len(), 1);
            let answer = &response.function_responses[0];
            assert_eq!(answer.id, "abc");
            assert_eq!(answer.name, "manage_calendar");
            assert_eq!(answer.response["status"], "scheduled");
        }
        other => panic!("expected a tool response, got {:?}", other),
    }
    h.remote.send(ServerMessage::tool_ack("abc"));

    // a replay of the same id is dropped, not answered again
    h.remote.send(ServerMessage::tool_call(ToolCall::new(
        "abc",
        "manage_calendar",
        json!({ "eventTitle": "Site Visit" }),
    )));
    assert!(h.remote.recv_timeout(Duration::from_millis(100)).await.is_none());
    assert_eq!(h.controller.state(), SessionState::Open);
}

#[tokio::test]
async fn failing_and_unknown_tools_still_get_answers() {
    let mut h = open_session(
        FnToolHandler::from_sync(|tool| match tool {
            StudioTool::ConnectCloud => panic!("handler crashed"),
            _ => anyhow::bail!("not supported here"),
        }),
        LiveConfig::default(),
    )
    .await;

    h.remote.send(ServerMessage::tool_call(ToolCall::new("t1", "connect_cloud", json!({}))));
    h.remote.send(ServerMessage::tool_call(ToolCall::new("t2", "send_invoice", json!({ "amount": 400 }))));

    let mut answered = Vec::new();
    for _ in 0..2 {
        match h.remote.recv_timeout(WAIT).await {
            Some(ClientMessage::ToolResponse(response)) => {
                let answer = &response.function_responses[0];
                assert!(answer.response.get("error").is_some(), "{:?}", answer.response);
                answered.push(answer.id.clone());
            }
            other => panic!("expected a tool response, got {:?}", other),
        }
    }
    answered.sort();
    assert_eq!(answered, vec!["t1", "t2"]);
    assert_eq!(h.controller.state(), SessionState::Open);
}

#[tokio::test]
async fn interruption_discards_queued_audio() {
    let h = open_session(studio_handler(), LiveConfig::default()).await;
    let speaker = h.backend.speaker();

    h.remote.send(ServerMessage::audio(&pcm_seconds(0.5), OUT));
    h.remote.send(ServerMessage::audio(&pcm_seconds(0.3), OUT));
    wait_until(|| speaker.history().len() == 2).await;

    speaker.set_time(0.2);
    h.remote.send(ServerMessage::interrupted());
    wait_until(|| speaker.stop_count() == 1).await;
    assert!(speaker.audible().is_empty());

    h.remote.send(ServerMessage::audio(&pcm_seconds(0.1), OUT));
    wait_until(|| speaker.history().len() == 3).await;
    assert!((speaker.history()[2].start - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn close_mid_tick_sends_nothing_afterwards() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;
    let mic = h.backend.mic();

    mic.push_level(0.1);
    mic.push_level(0.1);
    for _ in 0..2 {
        assert!(matches!(
            h.remote.recv_timeout(WAIT).await,
            Some(ClientMessage::RealtimeInput(_))
        ));
    }

    // a tick lands while the close is under way
    mic.push_level(0.1);
    assert_ok!(h.controller.close().await);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert!(!mic.push_level(0.1));

    let mut trailing = 0;
    while let Some(message) = h.remote.recv().await {
        assert!(matches!(message, ClientMessage::RealtimeInput(_)));
        trailing += 1;
    }
    assert!(trailing <= 1);

    let handle = h.controller.handle().unwrap();
    let frame = studio_voice::AudioFrame {
        data: vec![0, 0],
        sample_rate: 16000,
        channels: 1,
        sequence: 99,
    };
    assert!(matches!(handle.send(&frame), Err(VoiceError::SessionNotOpen(_))));

    assert_eq!(h.notes.recv().await, Some(Notification::SessionClosed));
    assert_eq!(h.controller.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn close_is_idempotent() {
    init_tracing();
    let backend = VirtualBackend::new(4096);
    let (connector, _remote) = MemoryConnector::new();
    let (mut controller, _notes) = controller_with(Arc::new(connector), &backend, studio_handler());
    assert_ok!(controller.close().await);
    assert_eq!(controller.state(), SessionState::Idle);

    let mut h = open_session(studio_handler(), LiveConfig::default()).await;
    assert_ok!(h.controller.close().await);
    assert_ok!(h.controller.close().await);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.notes.recv().await, Some(Notification::SessionClosed));
    assert!(tokio::time::timeout(Duration::from_millis(50), h.notes.recv()).await.is_err());
}

#[tokio::test]
async fn in_flight_tool_is_cancelled_on_close() {
    let mut h = open_session(
        FnToolHandler::new(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!("finished"))
        }),
        LiveConfig::default(),
    )
    .await;

    h.remote.send(ServerMessage::tool_call(ToolCall::new(
        "slow",
        "organize_photos",
        json!({ "count": 12, "path": "/archive" }),
    )));
    assert!(matches!(h.notes.recv().await, Some(Notification::ToolInvoked { .. })));

    assert_ok!(h.controller.close().await);
    match h.remote.recv_timeout(WAIT).await {
        Some(ClientMessage::ToolResponse(response)) => {
            let answer = &response.function_responses[0];
            assert_eq!(answer.id, "slow");
            assert!(answer.response["error"].as_str().unwrap().contains("cancelled"));
        }
        other => panic!("expected a cancellation result, got {:?}", other),
    }
    assert!(h.remote.recv().await.is_none());
}

#[tokio::test]
async fn transcripts_follow_wire_order_and_survive_close() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;

    h.remote.send(ServerMessage::input_transcript("Book the "));
    h.remote.send(ServerMessage::input_transcript(""));
    h.remote.send(ServerMessage::input_transcript("site visit"));
    h.remote.send(ServerMessage::output_transcript("Done."));
    h.remote.send(ServerMessage::turn_complete());

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if !h.controller.transcript(TranscriptKind::Output).await.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let input = h.controller.transcript(TranscriptKind::Input).await;
    assert_eq!(input.text, "Book the site visit");
    assert!(input.updated_at.is_some());

    assert_ok!(h.controller.close().await);
    assert_eq!(h.controller.transcript(TranscriptKind::Output).await.text, "Done.");
}

#[tokio::test]
async fn protocol_violations_do_not_end_the_session() {
    let h = open_session(studio_handler(), LiveConfig::default()).await;
    let speaker = h.backend.speaker();

    h.remote.send_raw("{not json");
    h.remote.send_raw(r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"%%%"}}]}}}"#);
    h.remote.send(ServerMessage::setup_complete());
    h.remote.send(ServerMessage::tool_ack("never-issued"));
    h.remote.send(ServerMessage::audio(&[], OUT));
    h.remote.send(ServerMessage::audio(&pcm_seconds(0.1), OUT));

    wait_until(|| speaker.history().len() == 1).await;
    assert_eq!(h.controller.state(), SessionState::Open);
    assert_eq!(h.controller.status(), SessionStatus::Listening);
}

#[tokio::test]
async fn remote_close_is_reported_once() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;
    let speaker = h.backend.speaker();
    h.remote.send(ServerMessage::audio(&pcm_seconds(0.5), OUT));
    wait_until(|| speaker.history().len() == 1).await;

    h.remote.close();

    match h.notes.recv().await {
        Some(Notification::Error(msg)) => assert!(msg.contains("closed unexpectedly"), "{}", msg),
        other => panic!("expected an error notification, got {:?}", other),
    }
    wait_until(|| h.controller.state() == SessionState::Closed).await;
    assert!(speaker.audible().is_empty());
    assert!(matches!(h.controller.status(), SessionStatus::Error(_)));
    assert!(!h.backend.mic().push_level(0.1));

    assert_ok!(h.controller.close().await);
    assert!(tokio::time::timeout(Duration::from_millis(50), h.notes.recv()).await.is_err());
}

#[tokio::test]
async fn stream_error_fails_the_session() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;
    let mut status = h.controller.subscribe_status();

    h.remote.fail("connection reset by peer");

    match h.notes.recv().await {
        Some(Notification::Error(msg)) => assert!(msg.contains("connection reset by peer"), "{}", msg),
        other => panic!("expected an error notification, got {:?}", other),
    }
    wait_until(|| h.controller.state() == SessionState::Failed).await;
    status.changed().await.unwrap();
    assert!(status.borrow().to_string().starts_with("error:"));
    assert!(tokio::time::timeout(Duration::from_millis(50), h.notes.recv()).await.is_err());
}

#[tokio::test]
async fn missing_devices_fail_before_connecting() {
    init_tracing();
    let backend = VirtualBackend::unavailable();
    let (connector, _remote) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let (mut controller, mut notes) = controller_with(connector.clone(), &backend, studio_handler());

    let err = controller.open(&LiveConfig::default()).await.err().unwrap();
    assert!(matches!(err, VoiceError::DeviceUnavailable(_)));
    assert!(err.is_fatal_to_start());
    assert!(matches!(notes.recv().await, Some(Notification::Error(_))));
    assert!(matches!(controller.status(), SessionStatus::Error(_)));

    // the single connection is still unused
    assert!(connector.connect().await.is_ok());
}

#[tokio::test]
async fn refused_connection_never_opens() {
    init_tracing();
    let backend = VirtualBackend::new(4096);
    let (mut controller, _notes) = controller_with(
        Arc::new(MemoryConnector::refusing("service unavailable")),
        &backend,
        studio_handler(),
    );

    let err = controller.open(&LiveConfig::default()).await.err().unwrap();
    assert!(matches!(err, VoiceError::Connection(_)));
    assert_eq!(controller.handle().map(|h| h.state()), None);
    assert!(!backend.mic().push_level(0.1));
}

#[tokio::test]
async fn handshake_must_complete_in_time() {
    init_tracing();
    let backend = VirtualBackend::new(4096);
    let (connector, remote) = MemoryConnector::new();
    let (mut controller, _notes) = controller_with(Arc::new(connector), &backend, studio_handler());

    let config = LiveConfig {
        handshake_timeout_ms: 50,
        ..LiveConfig::default()
    };
    let err = controller.open(&config).await.err().unwrap();
    assert!(matches!(err, VoiceError::Connection(_)));
    assert_eq!(controller.status().to_string(), format!("error: {}", err));
    drop(remote);
}

#[tokio::test]
async fn handshake_rejects_anything_but_setup_complete() {
    init_tracing();
    let backend = VirtualBackend::new(4096);
    let (connector, mut remote) = MemoryConnector::new();
    let (mut controller, _notes) = controller_with(Arc::new(connector), &backend, studio_handler());

    let server = tokio::spawn(async move {
        let setup = remote.recv().await;
        remote.send(ServerMessage::turn_complete());
        (remote, setup)
    });
    let err = controller.open(&LiveConfig::default()).await.err().unwrap();
    assert!(matches!(err, VoiceError::Connection(_)));

    let (mut remote, setup) = server.await.unwrap();
    assert!(matches!(setup, Some(ClientMessage::Setup(_))));
    // the client hung up after the failed handshake
    assert!(remote.recv().await.is_none());
}

#[tokio::test]
async fn second_open_while_active_is_rejected() {
    let mut h = open_session(studio_handler(), LiveConfig::default()).await;
    let err = h.controller.open(&LiveConfig::default()).await.err().unwrap();
    assert!(matches!(err, VoiceError::AlreadyActive));
    assert_eq!(h.controller.state(), SessionState::Open);
    assert_ok!(h.controller.close().await);
}

#[tokio::test]
async fn mic_that_cannot_start_fails_before_connecting() {
    init_tracing();
    let (connector, mut remote) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let (notes_tx, mut notes) = mpsc::unbounded_channel();
    let mut controller = StreamingSessionController::new(
        connector.clone(),
        Arc::new(UnsupportedMicBackend(VirtualBackend::new(4096))),
        Arc::new(studio_handler()),
    )
    .with_notifier(Arc::new(notes_tx));

    let err = controller.open(&LiveConfig::default()).await.err().unwrap();
    match &err {
        VoiceError::DeviceUnavailable(msg) => assert!(msg.contains("not supported"), "{}", msg),
        other => panic!("expected a device error, got {:?}", other),
    }
    assert!(matches!(notes.recv().await, Some(Notification::Error(_))));
    assert!(matches!(controller.status(), SessionStatus::Error(_)));

    // no setup went out and the single connection is still unused
    assert!(remote.try_recv().is_none());
    assert!(connector.connect().await.is_ok());
}

#[tokio::test]
async fn failed_session_discards_its_outbound_backlog() {
    let backend = VirtualBackend::new(4096);
    let (inner, remote) = MemoryConnector::new();
    let connector = Arc::new(ShapedConnector::new(inner, Duration::from_millis(20), Duration::ZERO));
    let written = Arc::clone(&connector.frames_written);
    let (controller, remote) = open_with(connector, remote, &backend).await;

    let mic = backend.mic();
    for _ in 0..20 {
        assert!(mic.push_level(0.1));
    }
    wait_until(|| written.load(Ordering::SeqCst) >= 1).await;

    remote.fail("connection reset by peer");
    wait_until(|| controller.state() == SessionState::Failed).await;
    let at_failure = written.load(Ordering::SeqCst);
    assert!(at_failure < 20, "backlog already drained before the failure");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(written.load(Ordering::SeqCst), at_failure);
}

#[tokio::test]
async fn inbound_messages_survive_busy_host_polling() {
    let backend = VirtualBackend::new(4096);
    let (inner, remote) = MemoryConnector::new();
    let connector = Arc::new(ShapedConnector::new(inner, Duration::ZERO, Duration::from_millis(2)));
    let (controller, remote) = open_with(connector, remote, &backend).await;

    for i in 0..50 {
        assert!(remote.send(ServerMessage::output_transcript(format!("{} ", i))));
    }
    for _ in 0..200 {
        let _ = controller.transcript(TranscriptKind::Output).await;
    }

    let expected: String = (0..50).map(|i| format!("{} ", i)).collect();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let text = controller.transcript(TranscriptKind::Output).await.text;
        if text == expected {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "transcript so far: {:?}", text);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
