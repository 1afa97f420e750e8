//! Microphone capture: float sample blocks in, 16-bit PCM frames out.
//!
//! A [`CaptureDevice`] delivers fixed-size blocks of `f32` samples on its own
//! schedule. [`AudioCaptureAdapter`] converts each block into an [`AudioFrame`]
//! and hands it to a [`FrameSink`] without waiting on the network. Stopping the
//! adapter closes a gate that every tick must pass, so once `stop()` returns no
//! further frame leaves the adapter, including one whose tick was already in
//! flight.

use crate::config::AudioFormat;
use crate::error::{VoiceError, VoiceResult};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One outbound block of encoded microphone audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Little-endian 16-bit PCM.
    pub data: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Starts at 0 per capture run and increases by one per frame handed off.
    pub sequence: u64,
}

/// Source of fixed-size blocks of floating point samples.
pub trait CaptureDevice: Send {
    /// Begin delivering blocks to `blocks`. Returns once delivery is set up.
    fn start(&mut self, blocks: mpsc::UnboundedSender<Vec<f32>>) -> VoiceResult<()>;

    /// Stop delivery. No block is sent after this returns.
    fn stop(&mut self);

    fn name(&self) -> String {
        "capture device".to_string()
    }
}

/// Where captured frames go. Must not block.
pub trait FrameSink: Send + Sync {
    /// Frames are only produced while this is true.
    fn is_open(&self) -> bool;

    fn send_frame(&self, frame: AudioFrame) -> VoiceResult<()>;
}

/// Convert normalized samples to little-endian 16-bit PCM, clamping out-of-range input.
pub fn pcm16_from_f32(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        let i = (clamped * 32767.0).round() as i16;
        out.extend_from_slice(&i.to_le_bytes());
    }
    out
}

struct CaptureGate {
    running: bool,
    next_sequence: u64,
}

/// Periodic microphone-to-session pump.
pub struct AudioCaptureAdapter {
    device: Box<dyn CaptureDevice>,
    format: AudioFormat,
    gate: Arc<Mutex<CaptureGate>>,
    task: Option<JoinHandle<()>>,
}

impl AudioCaptureAdapter {
    pub fn new(device: Box<dyn CaptureDevice>, format: AudioFormat) -> Self {
        Self {
            device,
            format,
            gate: Arc::new(Mutex::new(CaptureGate {
                running: false,
                next_sequence: 0,
            })),
            task: None,
        }
    }

    /// Start pumping frames into `sink`. Must be called within a tokio runtime.
    pub fn start(&mut self, sink: Arc<dyn FrameSink>) -> VoiceResult<()> {
        if lock_gate(&self.gate).running {
            return Err(VoiceError::AlreadyActive);
        }

        let (block_tx, mut block_rx) = mpsc::unbounded_channel::<Vec<f32>>();
        self.device.start(block_tx)?;

        {
            let mut gate = lock_gate(&self.gate);
            gate.running = true;
            gate.next_sequence = 0;
        }

        info!(
            "🎤 Capture started on {} ({}Hz, {} ch)",
            self.device.name(),
            self.format.sample_rate,
            self.format.channels
        );

        let gate = Arc::clone(&self.gate);
        let format = self.format;
        self.task = Some(tokio::spawn(async move {
            while let Some(block) = block_rx.recv().await {
                let mut gate = lock_gate(&gate);
                if !gate.running {
                    break;
                }
                if !sink.is_open() {
                    debug!("Capture tick skipped: session not open");
                    continue;
                }

                let frame = AudioFrame {
                    data: pcm16_from_f32(&block),
                    sample_rate: format.sample_rate,
                    channels: format.channels,
                    sequence: gate.next_sequence,
                };
                match sink.send_frame(frame) {
                    Ok(()) => gate.next_sequence += 1,
                    Err(e) => debug!("Capture frame dropped: {}", e),
                }
            }
            debug!("Capture pump ended");
        }));

        Ok(())
    }

    /// Stop capture. Idempotent. No frame is handed to the sink after this returns.
    pub fn stop(&mut self) {
        let was_running = {
            let mut gate = lock_gate(&self.gate);
            std::mem::replace(&mut gate.running, false)
        };
        self.device.stop();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if was_running {
            info!("⏹️ Capture stopped after {} frames", self.frames_sent());
        }
    }

    pub fn is_running(&self) -> bool {
        lock_gate(&self.gate).running
    }

    /// Frames successfully handed to the sink in the current (or last) run.
    pub fn frames_sent(&self) -> u64 {
        lock_gate(&self.gate).next_sequence
    }
}

impl Drop for AudioCaptureAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_gate(gate: &Mutex<CaptureGate>) -> MutexGuard<'_, CaptureGate> {
    gate.lock().unwrap_or_else(|poisoned| {
        warn!("Capture gate lock poisoned; continuing");
        poisoned.into_inner()
    })
}

/// Test/headless microphone fed by a [`MicFeed`].
pub struct VirtualMicrophone {
    target: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>,
}

/// Handle used to push sample blocks into a [`VirtualMicrophone`].
#[derive(Clone)]
pub struct MicFeed {
    target: Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>,
    block_size: usize,
}

impl VirtualMicrophone {
    pub fn new(block_size: usize) -> (Self, MicFeed) {
        let target = Arc::new(Mutex::new(None));
        (
            Self {
                target: Arc::clone(&target),
            },
            MicFeed { target, block_size },
        )
    }

    pub(crate) fn with_feed(feed: &MicFeed) -> Self {
        Self {
            target: Arc::clone(&feed.target),
        }
    }
}

impl CaptureDevice for VirtualMicrophone {
    fn start(&mut self, blocks: mpsc::UnboundedSender<Vec<f32>>) -> VoiceResult<()> {
        *self.target.lock().unwrap_or_else(|p| p.into_inner()) = Some(blocks);
        Ok(())
    }

    fn stop(&mut self) {
        *self.target.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn name(&self) -> String {
        "virtual microphone".to_string()
    }
}

impl MicFeed {
    /// Deliver one block. Returns false when the microphone is not started.
    pub fn push(&self, block: Vec<f32>) -> bool {
        match self.target.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(tx) => tx.send(block).is_ok(),
            None => false,
        }
    }

    /// Deliver one full block of a constant level.
    pub fn push_level(&self, level: f32) -> bool {
        self.push(vec![level; self.block_size])
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl FrameSink for mpsc::UnboundedSender<AudioFrame> {
        fn is_open(&self) -> bool {
            !self.is_closed()
        }

        fn send_frame(&self, frame: AudioFrame) -> VoiceResult<()> {
            self.send(frame)
                .map_err(|_| VoiceError::SessionNotOpen("receiver dropped".to_string()))
        }
    }

    fn adapter(block_size: usize) -> (AudioCaptureAdapter, MicFeed) {
        let (mic, feed) = VirtualMicrophone::new(block_size);
        (AudioCaptureAdapter::new(Box::new(mic), AudioFormat::new(16000, 1)), feed)
    }

    #[test]
    fn pcm16_conversion_clamps_and_scales() {
        let bytes = pcm16_from_f32(&[0.0, 1.0, -1.0, 2.0, 0.5]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![0, 32767, -32767, 32767, 16384]);
    }

    #[tokio::test]
    async fn three_ticks_give_three_ordered_frames() {
        let (mut capture, feed) = adapter(4096);
        let (tx, mut rx) = mpsc::unbounded_channel::<AudioFrame>();
        capture.start(Arc::new(tx)).unwrap();

        for _ in 0..3 {
            assert!(feed.push_level(0.25));
        }

        for expected in 0..3u64 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.data.len(), 8192);
            assert_eq!(frame.sample_rate, 16000);
            assert_eq!(frame.channels, 1);
        }
        assert_eq!(capture.frames_sent(), 3);
        capture.stop();
    }

    #[tokio::test]
    async fn in_flight_tick_discarded_on_stop() {
        let (mut capture, feed) = adapter(256);
        let (tx, mut rx) = mpsc::unbounded_channel::<AudioFrame>();
        capture.start(Arc::new(tx)).unwrap();

        feed.push_level(0.1);
        feed.push_level(0.1);
        assert_eq!(rx.recv().await.unwrap().sequence, 0);
        assert_eq!(rx.recv().await.unwrap().sequence, 1);

        // delivered by the device but not yet converted when stop lands
        assert!(feed.push_level(0.1));
        capture.stop();
        assert!(!feed.push_level(0.1));

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(capture.frames_sent(), 2);
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn closed_sink_gets_no_frames() {
        let (mut capture, feed) = adapter(128);
        let (tx, rx) = mpsc::unbounded_channel::<AudioFrame>();
        drop(rx);
        capture.start(Arc::new(tx)).unwrap();
        feed.push_level(0.3);
        tokio::task::yield_now().await;
        assert_eq!(capture.frames_sent(), 0);
    }

    #[tokio::test]
    async fn double_start_rejected_and_stop_idempotent() {
        let (mut capture, _feed) = adapter(128);
        let (tx, _rx) = mpsc::unbounded_channel::<AudioFrame>();
        let sink: Arc<dyn FrameSink> = Arc::new(tx);
        capture.start(Arc::clone(&sink)).unwrap();
        assert!(matches!(capture.start(sink), Err(VoiceError::AlreadyActive)));
        capture.stop();
        capture.stop();
        assert!(!capture.is_running());
    }
}
