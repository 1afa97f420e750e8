//! Gapless scheduling of inbound PCM against the output clock.
//!
//! Every chunk is placed at `max(now, previous_end)`: back-to-back when chunks
//! arrive faster than they play, at "now" when the queue ran dry. `flush()` is the
//! barge-in path: it stops everything on the device and pulls the clock back to
//! the present. The scheduler is the single owner of that clock; `&mut self` on
//! both `enqueue` and `flush` keeps them mutually exclusive.

use crate::config::AudioFormat;
use crate::error::{VoiceError, VoiceResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Device-issued handle for one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackToken(pub u64);

/// Output device contract: monotonic clock, scheduled start, stop-all.
pub trait OutputDevice: Send {
    /// Current output time in seconds. Never decreases.
    fn now(&self) -> f64;

    /// Queue `samples` (interleaved, normalized) to start at `start_at` on the output clock.
    fn schedule(&mut self, samples: Vec<f32>, format: AudioFormat, start_at: f64) -> VoiceResult<PlaybackToken>;

    /// Silence and discard everything queued or playing.
    fn stop_all(&mut self);

    fn name(&self) -> String {
        "output device".to_string()
    }
}

/// Where a chunk landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledEntry {
    pub token: PlaybackToken,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug)]
struct PlaybackBufferEntry {
    token: PlaybackToken,
    start: f64,
    duration: f64,
}

impl PlaybackBufferEntry {
    fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Decode little-endian 16-bit PCM into normalized samples. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

pub struct AudioPlaybackScheduler {
    device: Box<dyn OutputDevice>,
    format: AudioFormat,
    next_start: f64,
    entries: VecDeque<PlaybackBufferEntry>,
}

impl AudioPlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>, format: AudioFormat) -> Self {
        let next_start = device.now();
        Self {
            device,
            format,
            next_start,
            entries: VecDeque::new(),
        }
    }

    /// Decode and schedule one chunk right after whatever is already queued.
    ///
    /// `duration_hint` can stretch the entry past its samples, never shorten it,
    /// so the next chunk cannot start while this one is still sounding.
    pub fn enqueue(&mut self, pcm: &[u8], duration_hint: Option<Duration>) -> VoiceResult<ScheduledEntry> {
        if pcm.len() % 2 != 0 {
            warn!("Audio chunk has odd length {}; dropping trailing byte", pcm.len());
        }
        let samples = decode_pcm16(pcm);
        if samples.is_empty() {
            return Err(VoiceError::ProtocolViolation("empty audio chunk".to_string()));
        }

        let sounding = self.format.duration_of(samples.len());
        let duration = duration_hint.map_or(sounding, |hint| hint.max(sounding)).as_secs_f64();

        let now = self.device.now();
        self.retire_finished(now);

        let start = now.max(self.next_start);
        let token = self.device.schedule(samples, self.format, start)?;
        self.next_start = start + duration;
        self.entries.push_back(PlaybackBufferEntry { token, start, duration });

        debug!(
            "🔊 Scheduled chunk {:?} at {:.3}s for {:.3}s ({} pending)",
            token,
            start,
            duration,
            self.entries.len()
        );

        Ok(ScheduledEntry {
            token,
            start,
            end: self.next_start,
        })
    }

    /// Stop and discard every pending or playing entry; the clock restarts at now.
    /// Returns how many entries were discarded.
    pub fn flush(&mut self) -> usize {
        self.device.stop_all();
        let now = self.device.now();
        self.retire_finished(now);
        let discarded = self.entries.len();
        self.entries.clear();
        self.next_start = now;
        info!("⏹️ Playback flushed ({} entries discarded, clock reset to {:.3}s)", discarded, now);
        discarded
    }

    /// Entries that have not finished playing yet.
    pub fn pending(&mut self) -> usize {
        let now = self.device.now();
        self.retire_finished(now);
        self.entries.len()
    }

    /// Output time at which the next chunk would start if the queue keeps up.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    pub fn is_playing(&mut self) -> bool {
        self.pending() > 0
    }

    fn retire_finished(&mut self, now: f64) {
        while let Some(front) = self.entries.front() {
            if front.end() > now {
                break;
            }
            debug!("Playback entry {:?} finished", front.token);
            self.entries.pop_front();
        }
    }
}

/// One buffer as seen by a [`VirtualSpeaker`].
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualPlayback {
    pub token: PlaybackToken,
    pub start: f64,
    pub samples: usize,
    pub format: AudioFormat,
}

#[derive(Default)]
struct SpeakerState {
    now: f64,
    next_token: u64,
    active: Vec<VirtualPlayback>,
    history: Vec<VirtualPlayback>,
    stops: usize,
}

/// Output device with a manually driven clock. Nothing is audible.
pub struct VirtualSpeaker {
    state: Arc<Mutex<SpeakerState>>,
}

/// Inspection and clock control for a [`VirtualSpeaker`].
#[derive(Clone)]
pub struct SpeakerProbe {
    state: Arc<Mutex<SpeakerState>>,
}

impl VirtualSpeaker {
    pub fn new() -> (Self, SpeakerProbe) {
        let state = Arc::new(Mutex::new(SpeakerState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            SpeakerProbe { state },
        )
    }

    pub(crate) fn with_probe(probe: &SpeakerProbe) -> Self {
        Self {
            state: Arc::clone(&probe.state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeakerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl OutputDevice for VirtualSpeaker {
    fn now(&self) -> f64 {
        self.lock().now
    }

    fn schedule(&mut self, samples: Vec<f32>, format: AudioFormat, start_at: f64) -> VoiceResult<PlaybackToken> {
        let mut state = self.lock();
        let token = PlaybackToken(state.next_token);
        state.next_token += 1;
        let playback = VirtualPlayback {
            token,
            start: start_at,
            samples: samples.len(),
            format,
        };
        state.active.push(playback.clone());
        state.history.push(playback);
        Ok(token)
    }

    fn stop_all(&mut self) {
        let mut state = self.lock();
        state.active.clear();
        state.stops += 1;
    }

    fn name(&self) -> String {
        "virtual speaker".to_string()
    }
}

impl SpeakerProbe {
    fn lock(&self) -> std::sync::MutexGuard<'_, SpeakerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move the output clock to `t` seconds. The clock never goes backwards.
    pub fn set_time(&self, t: f64) {
        let mut state = self.lock();
        state.now = state.now.max(t);
    }

    pub fn advance(&self, dt: f64) {
        let mut state = self.lock();
        state.now += dt.max(0.0);
    }

    pub fn now(&self) -> f64 {
        self.lock().now
    }

    /// Every buffer ever scheduled, in scheduling order.
    pub fn history(&self) -> Vec<VirtualPlayback> {
        self.lock().history.clone()
    }

    /// Buffers scheduled since the last stop-all that have not finished by now.
    pub fn audible(&self) -> Vec<VirtualPlayback> {
        let state = self.lock();
        state
            .active
            .iter()
            .filter(|p| p.start + p.format.duration_of(p.samples).as_secs_f64() > state.now)
            .cloned()
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stops
    }
}
