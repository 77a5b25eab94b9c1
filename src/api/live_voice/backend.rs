//! Device seam: where a session gets its microphone and speaker

use std::sync::Arc;
use tracing::debug;

use super::capture::{open_default_input, CaptureStream};
use super::error::DeviceError;
use super::player::{AudioOutput, CpalOutput};

/// Opens the audio devices a session runs on
pub trait AudioBackend: Send + Sync {
    /// Exclusive microphone access; released when the stream is dropped
    fn open_input(&self, sample_rate: u32, frame_size: usize) -> Result<CaptureStream, DeviceError>;

    /// Speaker output; `sample_rate` is the rate inbound speech arrives at
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, DeviceError>;
}

/// System default devices through cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(&self, sample_rate: u32, frame_size: usize) -> Result<CaptureStream, DeviceError> {
        open_default_input(sample_rate, frame_size)
    }

    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>, DeviceError> {
        // The mixer resamples each frame, so the device keeps its own rate
        let output = CpalOutput::open_default()?;
        debug!(source_rate = sample_rate, "speaker output ready");
        Ok(Arc::new(output))
    }
}
