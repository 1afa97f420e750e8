//! Session configuration loaded from TOML and environment.
//!
//! Precedence: built-in defaults < TOML file (`STUDIO_VOICE_CONFIG` path, default
//! `config/studio_voice`) < `STUDIO_VOICE__*` environment variables.
//!
//! | Key | Default | Description |
//! |-----|---------|-------------|
//! | model | gemini-2.5-flash-native-audio-preview-09-2025 | Remote model name sent in setup. |
//! | voice_name | Puck | Prebuilt voice for synthesized audio. |
//! | input.sample_rate / input.channels | 16000 / 1 | Microphone wire format. |
//! | output.sample_rate / output.channels | 24000 / 1 | Format of inbound PCM chunks. |
//! | block_size | 4096 | Samples per capture tick. |
//! | handshake_timeout_ms | 10000 | Max wait for `setupComplete`. |
//! | close_drain_timeout_ms | 2000 | Max wait for queued outbound messages on close. |
//! | duplicate_policy | keep | `keep` \| `drop_repeated` for transcript deltas. |
//! | reset_input_on_output | false | Clear the input transcript when the AI starts replying. |
//! | tools_enabled | true | Declare the studio tools during setup. |

use crate::error::{VoiceError, VoiceResult};
use crate::transcript::DuplicatePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/studio_voice";

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a seasoned design-studio partner. \
Carry out requests with the available tools, and proactively point out patterns in how the \
user works. When scheduling, check whether similar past projects ran late and suggest extra \
buffer. When you notice repeated manual steps, offer to turn them into an automation. Before \
sensitive operations such as sending invoices, cite historical data as the basis for your \
recommendation. Keep replies professional, proactive and brief.";

/// PCM format of one direction of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// MIME type used on the wire for 16-bit PCM in this format.
    pub fn pcm_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Playback duration of `samples` interleaved samples.
    pub fn duration_of(&self, samples: usize) -> Duration {
        let frames = samples as f64 / self.channels.max(1) as f64;
        Duration::from_secs_f64(frames / self.sample_rate.max(1) as f64)
    }
}

/// Configuration for one live voice session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub input: AudioFormat,
    pub output: AudioFormat,
    /// Samples per capture tick (default: 4096, ~256ms at 16kHz)
    pub block_size: usize,
    pub handshake_timeout_ms: u64,
    pub close_drain_timeout_ms: u64,
    pub duplicate_policy: DuplicatePolicy,
    pub reset_input_on_output: bool,
    pub tools_enabled: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice_name: "Puck".to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            input: AudioFormat::new(16000, 1),
            output: AudioFormat::new(24000, 1),
            block_size: 4096,
            handshake_timeout_ms: 10_000,
            close_drain_timeout_ms: 2_000,
            duplicate_policy: DuplicatePolicy::Keep,
            reset_input_on_output: false,
            tools_enabled: true,
        }
    }
}

impl LiveConfig {
    /// Load from file and environment. Path comes from `STUDIO_VOICE_CONFIG`
    /// and falls back to `config/studio_voice`; a missing file is not an error.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("STUDIO_VOICE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit TOML path layered under `STUDIO_VOICE__*` env overrides.
    /// Without an extension, `.toml` is tried.
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        Self::load_layered(path, environment())
    }

    fn load_layered(path: &Path, env: config::Environment) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(env)
            .build()?;

        let cfg: LiveConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        for (label, fmt) in [("input", self.input), ("output", self.output)] {
            if fmt.sample_rate == 0 || fmt.channels == 0 {
                return Err(VoiceError::Config(format!(
                    "{} format must have a non-zero sample rate and channel count (got {}Hz, {} ch)",
                    label, fmt.sample_rate, fmt.channels
                )));
            }
        }
        if self.block_size == 0 {
            return Err(VoiceError::Config("block_size must be greater than zero".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(VoiceError::Config("model must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }
}

/// `STUDIO_VOICE__BLOCK_SIZE=2048`, `STUDIO_VOICE__OUTPUT__SAMPLE_RATE=48000`, ...
fn environment() -> config::Environment {
    config::Environment::with_prefix("STUDIO_VOICE")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
