//! Barge-in: the remote model was interrupted by the user, so stop talking now.
//!
//! Pairs with the dispatch loop: an `Interruption` event is handled inline, before
//! any later audio chunk is scheduled, so nothing queued before the signal is heard
//! after it.

use crate::playback::AudioPlaybackScheduler;
use tracing::info;

/// Flushes playback whenever the remote side signals an interruption.
#[derive(Debug, Default)]
pub struct InterruptionHandler {
    interruptions: u64,
    discarded: u64,
}

impl InterruptionHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop all pending and playing output and reset the playback clock.
    /// Returns how many scheduled entries were discarded.
    pub fn on_interrupt(&mut self, scheduler: &mut AudioPlaybackScheduler) -> usize {
        let discarded = scheduler.flush();
        self.interruptions += 1;
        self.discarded += discarded as u64;
        info!("✋ Interrupted by user; {} queued chunk(s) dropped", discarded);
        discarded
    }

    /// Interruptions handled so far.
    pub fn count(&self) -> u64 {
        self.interruptions
    }

    /// Scheduled entries discarded across all interruptions.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
