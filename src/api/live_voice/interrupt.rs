//! Barge-in handling: cut playback without closing the session

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use tracing::info;

use super::error::DecodeError;
use super::player::{PlaybackScheduler, ScheduledBuffer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Playing,
    Flushed,
}

/// Notice that playback was cut and the model is listening again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interruption {
    pub stopped: usize,
}

pub struct InterruptionController {
    scheduler: Arc<PlaybackScheduler>,
    phase: Mutex<PlaybackPhase>,
    count: AtomicU64,
}

impl InterruptionController {
    pub fn new(scheduler: Arc<PlaybackScheduler>) -> Self {
        Self {
            scheduler,
            phase: Mutex::new(PlaybackPhase::Flushed),
            count: AtomicU64::new(0),
        }
    }

    /// Schedule an inbound speech chunk
    pub fn play(&self, bytes: &[u8], sample_rate: u32) -> Result<ScheduledBuffer, DecodeError> {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = self.scheduler.enqueue(bytes, sample_rate)?;
        *phase = PlaybackPhase::Playing;
        Ok(buffer)
    }

    /// Stop and discard everything scheduled, and unset the cursor
    pub fn interrupt(&self) -> Interruption {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        let stopped = self.scheduler.flush();
        *phase = PlaybackPhase::Flushed;
        self.count.fetch_add(1, Ordering::SeqCst);

        info!(stopped, "playback interrupted");
        Interruption { stopped }
    }

    pub fn phase(&self) -> PlaybackPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interruptions(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }
}
