//! Audio device backends using CPAL and Rodio
//!
//! This module handles low-latency audio I/O on bare metal. Both CPAL streams and
//! Rodio output streams are `!Send` on some platforms, so each device owns a
//! dedicated thread and is driven over a channel; the handles themselves are
//! `Send` and can live inside the session's dispatch task.

use crate::capture::{CaptureDevice, MicFeed, VirtualMicrophone};
use crate::config::AudioFormat;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{OutputDevice, PlaybackToken, SpeakerProbe, VirtualSpeaker};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use rodio::{OutputStream, Sink, Source};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Opens the capture and playback devices for a session.
///
/// Called before any network activity; a failure here is a
/// [`VoiceError::DeviceUnavailable`] and the session never connects.
pub trait AudioBackend: Send + Sync {
    fn open_capture(&self, format: AudioFormat, block_size: usize) -> VoiceResult<Box<dyn CaptureDevice>>;

    fn open_output(&self, format: AudioFormat) -> VoiceResult<Box<dyn OutputDevice>>;
}

/// Default input/output devices of the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareBackend;

impl AudioBackend for HardwareBackend {
    fn open_capture(&self, format: AudioFormat, block_size: usize) -> VoiceResult<Box<dyn CaptureDevice>> {
        Ok(Box::new(CpalMicrophone::open(format, block_size)?))
    }

    fn open_output(&self, _format: AudioFormat) -> VoiceResult<Box<dyn OutputDevice>> {
        Ok(Box::new(RodioSpeaker::open()?))
    }
}

/// Microphone backed by the default CPAL input device.
pub struct CpalMicrophone {
    format: AudioFormat,
    block_size: usize,
    device_name: String,
    active: Arc<AtomicBool>,
    worker: Option<(std_mpsc::Sender<()>, thread::JoinHandle<()>)>,
}

impl CpalMicrophone {
    /// Check that an input device exists and supports input at all.
    pub fn open(format: AudioFormat, block_size: usize) -> VoiceResult<Self> {
        info!("🎤 Initializing audio capture ({}Hz, {} channels)", format.sample_rate, format.channels);

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("No input device available".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let default_config = device.default_input_config()?;

        info!("📱 Using input device: {}", device_name);
        debug!("🔧 Default config: {:?}", default_config);

        Ok(Self {
            format,
            block_size,
            device_name,
            active: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

impl CaptureDevice for CpalMicrophone {
    fn start(&mut self, blocks: mpsc::UnboundedSender<Vec<f32>>) -> VoiceResult<()> {
        if self.worker.is_some() {
            return Err(VoiceError::AlreadyActive);
        }

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let stream_config = StreamConfig {
            channels: self.format.channels,
            sample_rate: cpal::SampleRate(self.format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let block_size = self.block_size;
        let active = Arc::clone(&self.active);
        active.store(true, Ordering::SeqCst);

        // The stream is built and dropped on this thread (cpal Stream is !Send on some platforms)
        let handle = thread::Builder::new().name("studio-voice-mic".to_string()).spawn(move || {
            let device = match cpal::default_host().default_input_device() {
                Some(d) => d,
                None => {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable("input device disappeared".to_string())));
                    return;
                }
            };

            let mut sample_buffer = Vec::with_capacity(block_size);
            let callback_active = Arc::clone(&active);
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !callback_active.load(Ordering::SeqCst) {
                        return;
                    }
                    for &sample in data {
                        sample_buffer.push(sample);
                        if sample_buffer.len() >= block_size {
                            let block = std::mem::replace(&mut sample_buffer, Vec::with_capacity(block_size));
                            if blocks.send(block).is_err() {
                                return;
                            }
                        }
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                },
                None,
            );

            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.into()));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            // Park until stop; dropping the stream ends the callbacks
            let _ = stop_rx.recv();
            drop(stream);
        });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio capture started on {}", self.device_name);
                self.worker = Some((stop_tx, handle));
                Ok(())
            }
            Ok(Err(e)) => {
                self.active.store(false, Ordering::SeqCst);
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                self.active.store(false, Ordering::SeqCst);
                Err(VoiceError::AudioStream("capture thread exited during start".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some((stop_tx, handle)) = self.worker.take() {
            let _ = stop_tx.send(());
            if handle.join().is_err() {
                error!("Capture thread panicked");
            }
            info!("⏹️ Audio capture stopped");
        }
    }

    fn name(&self) -> String {
        self.device_name.clone()
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SpeakerCommand {
    Play {
        samples: Vec<f32>,
        format: AudioFormat,
        start_at: f64,
    },
    StopAll,
}

/// Speaker backed by a Rodio sink on the default output device.
///
/// Scheduled starts are honored by padding the sink with silence up to the
/// requested time; `stop_all` throws the sink away and starts a fresh one.
pub struct RodioSpeaker {
    commands: std_mpsc::Sender<SpeakerCommand>,
    epoch: Instant,
    next_token: u64,
}

impl RodioSpeaker {
    pub fn open() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");

        let (commands, command_rx) = std_mpsc::channel::<SpeakerCommand>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let epoch = Instant::now();

        thread::Builder::new().name("studio-voice-speaker".to_string()).spawn(move || {
            let (_stream, stream_handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                    return;
                }
            };
            let mut sink = match Sink::try_new(&stream_handle) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::DeviceUnavailable(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Output time at which the audio already appended to the sink runs out
            let mut queued_until = 0.0f64;

            while let Ok(command) = command_rx.recv() {
                let now = epoch.elapsed().as_secs_f64();
                match command {
                    SpeakerCommand::Play { samples, format, start_at } => {
                        let tail = queued_until.max(now);
                        let gap = start_at - tail;
                        if gap > 0.001 {
                            let silence = rodio::source::Zero::<f32>::new(format.channels, format.sample_rate)
                                .take_duration(Duration::from_secs_f64(gap));
                            sink.append(silence);
                        }
                        let duration = format.duration_of(samples.len()).as_secs_f64();
                        sink.append(rodio::buffer::SamplesBuffer::new(format.channels, format.sample_rate, samples));
                        queued_until = tail.max(start_at) + duration;
                    }
                    SpeakerCommand::StopAll => {
                        sink.stop();
                        match Sink::try_new(&stream_handle) {
                            Ok(fresh) => sink = fresh,
                            Err(e) => {
                                error!("Failed to recreate playback sink: {}", e);
                                break;
                            }
                        }
                        queued_until = now;
                    }
                }
            }
            debug!("Playback thread ended");
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("✅ Audio playback initialized");
                Ok(Self {
                    commands,
                    epoch,
                    next_token: 0,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::DeviceUnavailable("playback thread exited during start".to_string())),
        }
    }
}

impl OutputDevice for RodioSpeaker {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, samples: Vec<f32>, format: AudioFormat, start_at: f64) -> VoiceResult<PlaybackToken> {
        self.commands
            .send(SpeakerCommand::Play { samples, format, start_at })
            .map_err(|_| VoiceError::Playback("playback thread is gone".to_string()))?;
        let token = PlaybackToken(self.next_token);
        self.next_token += 1;
        Ok(token)
    }

    fn stop_all(&mut self) {
        if self.commands.send(SpeakerCommand::StopAll).is_err() {
            warn!("Playback thread is gone; nothing to stop");
        }
    }

    fn name(&self) -> String {
        "rodio default output".to_string()
    }
}

/// Backend of virtual devices for tests and headless hosts.
///
/// Every session opened through it shares the same [`MicFeed`] and
/// [`SpeakerProbe`], so a test can drive several sessions in turn.
#[derive(Clone)]
pub struct VirtualBackend {
    mic: MicFeed,
    speaker: SpeakerProbe,
    available: bool,
}

impl VirtualBackend {
    pub fn new(block_size: usize) -> Self {
        let (_mic, feed) = VirtualMicrophone::new(block_size);
        let (_speaker, probe) = VirtualSpeaker::new();
        Self {
            mic: feed,
            speaker: probe,
            available: true,
        }
    }

    /// A backend whose devices can never be acquired.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(1)
        }
    }

    pub fn mic(&self) -> MicFeed {
        self.mic.clone()
    }

    pub fn speaker(&self) -> SpeakerProbe {
        self.speaker.clone()
    }
}

impl AudioBackend for VirtualBackend {
    fn open_capture(&self, _format: AudioFormat, _block_size: usize) -> VoiceResult<Box<dyn CaptureDevice>> {
        if !self.available {
            return Err(VoiceError::DeviceUnavailable("virtual microphone disabled".to_string()));
        }
        Ok(Box::new(VirtualMicrophone::with_feed(&self.mic)))
    }

    fn open_output(&self, _format: AudioFormat) -> VoiceResult<Box<dyn OutputDevice>> {
        if !self.available {
            return Err(VoiceError::DeviceUnavailable("virtual speaker disabled".to_string()));
        }
        Ok(Box::new(VirtualSpeaker::with_probe(&self.speaker)))
    }
}
