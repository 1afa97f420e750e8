//! Running transcripts for both directions of the conversation.
//!
//! Input transcription (what the user said) and output transcription (what the
//! AI is saying) arrive as independent streams of small fragments. Each kind has
//! its own buffer; fragments are concatenated in arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which side of the conversation a transcript belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptKind {
    /// User speech recognized by the remote service.
    Input,
    /// Synthesized AI speech.
    Output,
}

/// How repeated identical fragments are treated.
///
/// The remote service is not known to repeat fragments, so `Keep` (raw
/// concatenation) is the default. `DropRepeated` drops a delta identical to the
/// previous delta of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    #[default]
    Keep,
    DropRepeated,
}

/// Accumulated text for one transcript kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptBuffer {
    pub kind: TranscriptKind,
    pub text: String,
    /// None until the first non-empty delta lands.
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    last_delta: Option<String>,
}

impl TranscriptBuffer {
    fn new(kind: TranscriptKind) -> Self {
        Self {
            kind,
            text: String::new(),
            updated_at: None,
            last_delta: None,
        }
    }

    fn clear(&mut self) {
        self.text.clear();
        self.updated_at = None;
        self.last_delta = None;
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Two independent running buffers fed from the dispatch loop.
#[derive(Debug, Clone)]
pub struct TranscriptAggregator {
    input: TranscriptBuffer,
    output: TranscriptBuffer,
    policy: DuplicatePolicy,
    reset_input_on_output: bool,
    output_in_progress: bool,
}

impl TranscriptAggregator {
    pub fn new(policy: DuplicatePolicy, reset_input_on_output: bool) -> Self {
        Self {
            input: TranscriptBuffer::new(TranscriptKind::Input),
            output: TranscriptBuffer::new(TranscriptKind::Output),
            policy,
            reset_input_on_output,
            output_in_progress: false,
        }
    }

    /// Append a fragment. Empty fragments leave text and timestamp untouched.
    /// Returns whether the buffer changed.
    pub fn append_delta(&mut self, kind: TranscriptKind, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }

        if self.policy == DuplicatePolicy::DropRepeated
            && self.buffer(kind).last_delta.as_deref() == Some(text)
        {
            debug!("Dropping repeated {:?} transcript fragment {:?}", kind, text);
            return false;
        }

        match kind {
            TranscriptKind::Output => {
                if self.reset_input_on_output && !self.output_in_progress {
                    self.input.clear();
                }
                self.output_in_progress = true;
            }
            TranscriptKind::Input => self.output_in_progress = false,
        }

        let buffer = self.buffer_mut(kind);
        buffer.text.push_str(text);
        buffer.updated_at = Some(Utc::now());
        buffer.last_delta = Some(text.to_string());
        true
    }

    /// Clear one buffer.
    pub fn reset(&mut self, kind: TranscriptKind) {
        self.buffer_mut(kind).clear();
        if kind == TranscriptKind::Output {
            self.output_in_progress = false;
        }
    }

    /// Clear both buffers (session start).
    pub fn reset_all(&mut self) {
        self.reset(TranscriptKind::Input);
        self.reset(TranscriptKind::Output);
    }

    /// Marks the end of an AI turn so the next output delta starts a new reply.
    pub fn end_turn(&mut self) {
        self.output_in_progress = false;
    }

    pub fn buffer(&self, kind: TranscriptKind) -> &TranscriptBuffer {
        match kind {
            TranscriptKind::Input => &self.input,
            TranscriptKind::Output => &self.output,
        }
    }

    fn buffer_mut(&mut self, kind: TranscriptKind) -> &mut TranscriptBuffer {
        match kind {
            TranscriptKind::Input => &mut self.input,
            TranscriptKind::Output => &mut self.output,
        }
    }
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new(DuplicatePolicy::Keep, false)
    }
}
