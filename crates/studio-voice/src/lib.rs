//! # Studio Voice - Live Voice Session Manager
//!
//! Streams microphone audio to a remote conversational model and plays its
//! synthesized replies back without gaps, while brokering the model's tool
//! calls to the host with exactly one result per call.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                Streaming Session Controller                   │
//! │  ┌──────────────┐  frames  ┌──────────────┐                   │
//! │  │   Capture    │────────→ │ Writer task  │────→ remote model │
//! │  │    (cpal)    │          └──────────────┘                   │
//! │  └──────────────┘                 ↑ tool results              │
//! │                            ┌──────────────┐                   │
//! │                            │ Tool Broker  │                   │
//! │                            └──────────────┘                   │
//! │                                   ↑                           │
//! │  ┌──────────────┐  chunks  ┌──────────────┐                   │
//! │  │  Playback    │←──────── │   Dispatch   │←──── remote model │
//! │  │  (rodio)     │←─flush── │ (wire order) │                   │
//! │  └──────────────┘          └──────────────┘                   │
//! │                                   ↓                           │
//! │                            ┌──────────────┐                   │
//! │                            │ Transcripts  │                   │
//! │                            └──────────────┘                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod broker;
pub mod capture;
pub mod config;
pub mod error;
pub mod interruption;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use audio::{AudioBackend, CpalMicrophone, HardwareBackend, RodioSpeaker, VirtualBackend};
pub use broker::{FnToolHandler, ResultSink, ToolDispatchBroker, ToolHandler};
pub use capture::{
    pcm16_from_f32, AudioCaptureAdapter, AudioFrame, CaptureDevice, FrameSink, MicFeed, VirtualMicrophone,
};
pub use config::{AudioFormat, LiveConfig};
pub use error::{VoiceError, VoiceResult};
pub use interruption::InterruptionHandler;
pub use playback::{
    decode_pcm16, AudioPlaybackScheduler, OutputDevice, PlaybackToken, ScheduledEntry, SpeakerProbe,
    VirtualPlayback, VirtualSpeaker,
};
pub use protocol::{ClientMessage, InboundEvent, ServerMessage, SetupMessage};
pub use session::{
    Notification, Notifier, SessionHandle, SessionState, SessionStatus, StreamingSessionController,
    TracingNotifier,
};
pub use tools::{
    tool_declarations, CalendarEvent, PhotoArchive, StudioTool, ToolCall, ToolOutcome, ToolResult,
};
pub use transcript::{DuplicatePolicy, TranscriptAggregator, TranscriptBuffer, TranscriptKind};
pub use transport::{InboundStream, LiveConnector, MemoryConnector, OutboundSink, RemoteEnd, Transport};
