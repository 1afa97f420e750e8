//! Wire messages for the live streaming service.
//!
//! Outbound messages are externally tagged (`{"setup": {...}}`,
//! `{"realtimeInput": {...}}`, `{"toolResponse": {...}}`). Inbound messages are a
//! bag of optional sections because the service may combine several in one frame
//! (e.g. a transcript fragment next to an audio part). [`ServerMessage::into_events`]
//! flattens that bag into an ordered list of [`InboundEvent`]s for dispatch.

use crate::config::{AudioFormat, LiveConfig};
use crate::error::{VoiceError, VoiceResult};
use crate::tools::{tool_declarations, ToolCall, ToolResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// -----------------------------------------------------------------------------
// Outbound
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> VoiceResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// One microphone frame as a realtime input message.
    pub fn audio(frame_bytes: &[u8], format: AudioFormat) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob::pcm(frame_bytes, format)],
        })
    }

    pub fn tool_result(result: &ToolResult) -> Self {
        ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id: result.id.clone(),
                name: result.name.clone(),
                response: result.response_payload(),
            }],
        })
    }
}

/// Session negotiation: model, audio modality, voice, instruction and tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Value>,
}

impl SetupMessage {
    pub fn from_config(config: &LiveConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };
        let system_instruction = (!config.system_instruction.trim().is_empty()).then(|| Content {
            parts: vec![Part::text(config.system_instruction.trim())],
        });
        let tools = if config.tools_enabled {
            vec![ToolSet {
                function_declarations: tool_declarations(),
            }]
        } else {
            Vec::new()
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction,
            tools,
            input_audio_transcription: Some(Value::Object(Default::default())),
            output_audio_transcription: Some(Value::Object(Default::default())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

// -----------------------------------------------------------------------------
// Shared
// -----------------------------------------------------------------------------

/// Base64 payload with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

impl Blob {
    pub fn pcm(bytes: &[u8], format: AudioFormat) -> Self {
        Self {
            mime_type: format.pcm_mime_type(),
            data: B64.encode(bytes),
        }
    }

    pub fn decode(&self) -> VoiceResult<Vec<u8>> {
        B64.decode(self.data.as_bytes())
            .map_err(|e| VoiceError::ProtocolViolation(format!("invalid base64 audio payload: {}", e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    pub fn audio(bytes: &[u8], format: AudioFormat) -> Self {
        Self {
            text: None,
            inline_data: Some(Blob::pcm(bytes, format)),
        }
    }
}

// -----------------------------------------------------------------------------
// Inbound
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_content: Option<ServerContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_response_ack: Option<ToolResponseAck>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_turn: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transcription: Option<Transcription>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMessage {
    #[serde(default)]
    pub function_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolResponseAck {
    #[serde(default)]
    pub ids: Vec<String>,
}

impl ServerMessage {
    pub fn from_json(text: &str) -> VoiceResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| VoiceError::ProtocolViolation(format!("unparseable server message: {}", e)))
    }

    pub fn to_json(&self) -> VoiceResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn setup_complete() -> Self {
        Self {
            setup_complete: Some(Value::Object(Default::default())),
            ..Default::default()
        }
    }

    pub fn audio(bytes: &[u8], format: AudioFormat) -> Self {
        Self::content(ServerContent {
            model_turn: Some(Content {
                parts: vec![Part::audio(bytes, format)],
            }),
            ..Default::default()
        })
    }

    pub fn input_transcript(text: impl Into<String>) -> Self {
        Self::content(ServerContent {
            input_transcription: Some(Transcription { text: text.into() }),
            ..Default::default()
        })
    }

    pub fn output_transcript(text: impl Into<String>) -> Self {
        Self::content(ServerContent {
            output_transcription: Some(Transcription { text: text.into() }),
            ..Default::default()
        })
    }

    pub fn interrupted() -> Self {
        Self::content(ServerContent {
            interrupted: true,
            ..Default::default()
        })
    }

    pub fn turn_complete() -> Self {
        Self::content(ServerContent {
            turn_complete: true,
            ..Default::default()
        })
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_call: Some(ToolCallMessage {
                function_calls: vec![call],
            }),
            ..Default::default()
        }
    }

    pub fn tool_ack(id: impl Into<String>) -> Self {
        Self {
            tool_response_ack: Some(ToolResponseAck { ids: vec![id.into()] }),
            ..Default::default()
        }
    }

    fn content(content: ServerContent) -> Self {
        Self {
            server_content: Some(content),
            ..Default::default()
        }
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into dispatchable events, in the order they must be handled:
    /// transcripts, audio, interruption, turn end, tool calls, acks.
    ///
    /// A part whose audio does not decode is a protocol violation for the whole
    /// message; nothing from it is dispatched.
    pub fn into_events(self) -> VoiceResult<Vec<InboundEvent>> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(InboundEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(t) = content.output_transcription {
                events.push(InboundEvent::OutputTranscript(t.text));
            }
            if let Some(t) = content.input_transcription {
                events.push(InboundEvent::InputTranscript(t.text));
            }
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data {
                        events.push(InboundEvent::AudioChunk(blob.decode()?));
                    }
                }
            }
            if content.interrupted {
                events.push(InboundEvent::Interruption);
            }
            if content.turn_complete {
                events.push(InboundEvent::TurnComplete);
            }
        }

        if let Some(tool_call) = self.tool_call {
            events.extend(tool_call.function_calls.into_iter().map(InboundEvent::ToolCall));
        }

        if let Some(ack) = self.tool_response_ack {
            events.extend(ack.ids.into_iter().map(InboundEvent::ToolResultAck));
        }

        Ok(events)
    }
}

/// One unit of inbound work, routed to exactly one component.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupComplete,
    /// Little-endian 16-bit PCM at the negotiated output format.
    AudioChunk(Vec<u8>),
    InputTranscript(String),
    OutputTranscript(String),
    ToolCall(ToolCall),
    ToolResultAck(String),
    Interruption,
    TurnComplete,
    StreamClosed,
    StreamError(String),
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::SetupComplete => "setup-complete",
            InboundEvent::AudioChunk(_) => "audio-chunk",
            InboundEvent::InputTranscript(_) => "input-transcript-delta",
            InboundEvent::OutputTranscript(_) => "output-transcript-delta",
            InboundEvent::ToolCall(_) => "tool-call",
            InboundEvent::ToolResultAck(_) => "tool-result-ack",
            InboundEvent::Interruption => "interruption",
            InboundEvent::TurnComplete => "turn-complete",
            InboundEvent::StreamClosed => "stream-closed",
            InboundEvent::StreamError(_) => "stream-error",
        }
    }
}
