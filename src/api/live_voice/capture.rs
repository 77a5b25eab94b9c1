//! Microphone capture: cpal input stream feeding fixed-size frames

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tracing::{error, info};

use super::device::{spawn_device_thread, DeviceGuard};
use super::error::DeviceError;
use super::utils::{downmix, resample_linear};

/// How long `next()` sleeps while waiting for the device
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Frames of headroom in the ring between callback and consumer
const RING_FRAMES: usize = 8;

/// A fixed-length block of mono float samples at the capture rate
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl CaptureFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[derive(Debug, Default)]
struct CaptureFlags {
    released: AtomicBool,
    failed: AtomicBool,
}

/// Writer side, owned by the device callback
pub struct CaptureFeed {
    producer: HeapProd<f32>,
    flags: Arc<CaptureFlags>,
}

impl CaptureFeed {
    /// Push mono samples; anything beyond the ring's headroom is dropped
    pub fn push(&mut self, samples: &[f32]) -> usize {
        if self.flags.released.load(Ordering::Relaxed) {
            return 0;
        }
        self.producer.push_slice(samples)
    }

    /// Mark the device as failed; the stream ends after draining nothing more
    pub fn fail(&self) {
        self.flags.failed.store(true, Ordering::SeqCst);
    }

    fn fail_handle(&self) -> CaptureControl {
        CaptureControl {
            flags: self.flags.clone(),
        }
    }
}

/// Thread-safe handle used to end a capture stream from elsewhere
#[derive(Debug, Clone)]
pub struct CaptureControl {
    flags: Arc<CaptureFlags>,
}

impl CaptureControl {
    pub fn release(&self) {
        self.flags.released.store(true, Ordering::SeqCst);
    }

    fn fail(&self) {
        self.flags.failed.store(true, Ordering::SeqCst);
    }
}

/// Lazy, unbounded, non-restartable sequence of capture frames.
///
/// Holds the input device until dropped.
pub struct CaptureStream {
    consumer: HeapCons<f32>,
    flags: Arc<CaptureFlags>,
    frame_size: usize,
    sample_rate: u32,
    device: Option<DeviceGuard>,
}

impl CaptureStream {
    /// Create a detached stream and the feed that fills it
    pub fn channel(sample_rate: u32, frame_size: usize) -> (CaptureFeed, CaptureStream) {
        let frame_size = frame_size.max(1);
        let ring = HeapRb::<f32>::new(frame_size * RING_FRAMES);
        let (producer, consumer) = ring.split();
        let flags = Arc::new(CaptureFlags::default());

        let feed = CaptureFeed {
            producer,
            flags: flags.clone(),
        };
        let stream = CaptureStream {
            consumer,
            flags,
            frame_size,
            sample_rate,
            device: None,
        };
        (feed, stream)
    }

    /// Tie the device's lifetime to this stream
    pub fn attach(&mut self, device: DeviceGuard) {
        self.device = Some(device);
    }

    pub fn control(&self) -> CaptureControl {
        CaptureControl {
            flags: self.flags.clone(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// True when the stream ended because the device failed, not because it was released
    pub fn failed(&self) -> bool {
        self.flags.failed.load(Ordering::SeqCst) && !self.flags.released.load(Ordering::SeqCst)
    }
}

impl Iterator for CaptureStream {
    type Item = CaptureFrame;

    fn next(&mut self) -> Option<CaptureFrame> {
        loop {
            if self.flags.released.load(Ordering::SeqCst) {
                return None;
            }

            if self.consumer.occupied_len() >= self.frame_size {
                let mut samples = vec![0.0f32; self.frame_size];
                let n = self.consumer.pop_slice(&mut samples);
                samples.truncate(n);
                return Some(CaptureFrame::new(samples, self.sample_rate));
            }

            if self.flags.failed.load(Ordering::SeqCst) {
                return None;
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Open the default microphone, resampled to `sample_rate` mono
pub fn open_default_input(
    sample_rate: u32,
    frame_size: usize,
) -> Result<CaptureStream, DeviceError> {
    let (feed, mut stream) = CaptureStream::channel(sample_rate, frame_size);

    let guard = spawn_device_thread("live-capture-device", move || {
        build_input_stream(sample_rate, feed)
    })?;
    stream.attach(guard);

    info!(sample_rate, frame_size, "microphone capture started");
    Ok(stream)
}

fn build_input_stream(target_rate: u32, mut feed: CaptureFeed) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(DeviceError::NoInputDevice)?;
    let config = device
        .default_input_config()
        .map_err(|e| DeviceError::Config(e.to_string()))?;

    let device_rate = config.sample_rate();
    let channels = config.channels() as usize;
    let failure = feed.fail_handle();
    let err_fn = move |err: cpal::StreamError| {
        error!("Capture stream error: {}", err);
        failure.fail();
    };

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config.into(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                feed.push(&resample_linear(&mono, device_rate, target_rate));
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config.into(),
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                let mono = downmix(&floats, channels);
                feed.push(&resample_linear(&mono, device_rate, target_rate));
            },
            err_fn,
            None,
        ),
        other => return Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
    }
    .map_err(|e| DeviceError::Build(e.to_string()))?;

    stream.play().map_err(|e| DeviceError::Play(e.to_string()))?;
    Ok(stream)
}
