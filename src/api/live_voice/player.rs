//! Gapless playback of streamed speech chunks
//!
//! The scheduler decides *when* each chunk plays: it keeps a cursor at the end
//! of the last scheduled chunk and never schedules behind the output clock.
//! The output device (a cpal stream driving a small software mixer) decides
//! *how*: it renders every scheduled voice sample-accurately at its start frame.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info};

use super::device::{spawn_device_thread, DeviceGuard};
use super::encoder::decode_pcm16;
use super::error::{DecodeError, DeviceError};
use super::utils::resample_linear;

/// Completion hook fired once when a voice finishes playing on its own
pub type EndedHook = Box<dyn FnOnce() + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn frames_to_duration(frames: u64, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((frames as u128 * 1_000_000_000 / sample_rate as u128) as u64)
}

fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    ((duration.as_nanos() * sample_rate as u128 + 500_000_000) / 1_000_000_000) as u64
}

/// Decoded speech: mono float samples at the playback rate
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlaybackFrame {
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

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.samples.len() as u64, self.sample_rate)
    }
}

/// A chunk registered in the live set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledBuffer {
    pub id: u64,
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledBuffer {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// An output device that plays buffers at absolute positions on its own clock.
///
/// `on_ended` must never be invoked from inside `schedule` or `stop`.
/// `stop` on an unknown or finished id is a no-op.
pub trait AudioOutput: Send + Sync {
    fn clock_now(&self) -> Duration;
    fn schedule(&self, id: u64, start: Duration, frame: &PlaybackFrame, on_ended: EndedHook);
    fn stop(&self, id: u64);
    /// Release the device; idempotent
    fn shutdown(&self);
}

#[derive(Debug, Default)]
struct SchedulerState {
    cursor: Option<Duration>,
    live: HashMap<u64, ScheduledBuffer>,
    next_id: u64,
}

/// Owns the scheduling cursor and the live buffer set.
///
/// Enqueue and flush are serialized by one lock, so a flush can never observe
/// a buffer that is scheduled on the device but missing from the live set.
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    state: Arc<Mutex<SchedulerState>>,
}

impl PlaybackScheduler {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            state: Arc::new(Mutex::new(SchedulerState::default())),
        }
    }

    /// Decode a PCM16 chunk and schedule it right after the previous one
    pub fn enqueue(&self, bytes: &[u8], sample_rate: u32) -> Result<ScheduledBuffer, DecodeError> {
        let frame = decode_pcm16(bytes, sample_rate)?;
        Ok(self.schedule_frame(frame))
    }

    pub fn schedule_frame(&self, frame: PlaybackFrame) -> ScheduledBuffer {
        let mut state = lock(&self.state);

        // Never schedule into the past: after a stall the stale cursor is skipped
        let now = self.output.clock_now();
        let start = state.cursor.map_or(now, |cursor| cursor.max(now));

        let id = state.next_id;
        state.next_id += 1;
        let buffer = ScheduledBuffer {
            id,
            start,
            duration: frame.duration(),
        };

        let weak_state = Arc::downgrade(&self.state);
        self.output.schedule(
            id,
            start,
            &frame,
            Box::new(move || {
                if let Some(state) = weak_state.upgrade() {
                    lock(&state).live.remove(&id);
                }
            }),
        );

        state.cursor = Some(buffer.end());
        state.live.insert(id, buffer.clone());

        debug!(
            id,
            start_ms = start.as_millis() as u64,
            duration_ms = buffer.duration.as_millis() as u64,
            "scheduled playback chunk"
        );
        buffer
    }

    /// Stop every live buffer, clear the set and unset the cursor
    pub fn flush(&self) -> usize {
        let mut state = lock(&self.state);
        let ids: Vec<u64> = state.live.drain().map(|(id, _)| id).collect();
        for id in &ids {
            self.output.stop(*id);
        }
        state.cursor = None;
        ids.len()
    }

    pub fn live_len(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Live buffers ordered by start time
    pub fn live_buffers(&self) -> Vec<ScheduledBuffer> {
        let mut buffers: Vec<ScheduledBuffer> = lock(&self.state).live.values().cloned().collect();
        buffers.sort_by_key(|b| (b.start, b.id));
        buffers
    }

    /// `None` until the first chunk, and again right after a flush
    pub fn cursor(&self) -> Option<Duration> {
        lock(&self.state).cursor
    }
}

struct Voice {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
    on_ended: Option<EndedHook>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Sums scheduled voices into device buffers and keeps the device clock
pub struct Mixer {
    sample_rate: u32,
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            voices: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate;
    }

    pub fn clock(&self) -> Duration {
        frames_to_duration(self.frames_rendered, self.sample_rate)
    }

    /// Add a voice already at the mixer's rate. A start behind the clock plays immediately.
    pub fn add(&mut self, id: u64, start: Duration, samples: Vec<f32>, on_ended: EndedHook) {
        let start_frame = duration_to_frames(start, self.sample_rate).max(self.frames_rendered);
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
            on_ended: Some(on_ended),
        });
    }

    /// Drop a voice without firing its hook
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Render one interleaved block and return the hooks of voices that finished.
    ///
    /// Callers must run the hooks after releasing the mixer lock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<EndedHook> {
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        let block_start = self.frames_rendered;
        let block_end = block_start + frames;

        out.fill(0.0);
        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for pos in from..to {
                let sample = voice.samples[(pos - voice.start_frame) as usize];
                let base = (pos - block_start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }
        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.frames_rendered = block_end;

        let mut ended = Vec::new();
        self.voices.retain_mut(|voice| {
            if voice.end_frame() <= block_end {
                if let Some(hook) = voice.on_ended.take() {
                    ended.push(hook);
                }
                false
            } else {
                true
            }
        });
        ended
    }
}

fn render_block(mixer: &Mutex<Mixer>, out: &mut [f32], channels: usize) {
    let ended = lock(mixer).render(out, channels);
    for hook in ended {
        hook();
    }
}

/// Default speaker output backed by cpal
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    device: Mutex<Option<DeviceGuard>>,
}

impl CpalOutput {
    pub fn open_default() -> Result<Self, DeviceError> {
        let mixer = Arc::new(Mutex::new(Mixer::new(0)));
        let stream_mixer = mixer.clone();
        let guard = spawn_device_thread("live-playback-device", move || {
            build_output_stream(stream_mixer)
        })?;

        info!(
            device_rate = lock(&mixer).sample_rate(),
            "speaker output started"
        );
        Ok(Self {
            mixer,
            device: Mutex::new(Some(guard)),
        })
    }

    #[cfg(test)]
    fn detached(sample_rate: u32) -> Self {
        Self {
            mixer: Arc::new(Mutex::new(Mixer::new(sample_rate))),
            device: Mutex::new(None),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn clock_now(&self) -> Duration {
        lock(&self.mixer).clock()
    }

    fn schedule(&self, id: u64, start: Duration, frame: &PlaybackFrame, on_ended: EndedHook) {
        let mut mixer = lock(&self.mixer);
        let rate = mixer.sample_rate();

        // Length comes from the span on the device timeline, so this voice ends
        // on exactly the frame where the next chunk (at start + duration) begins
        let span = duration_to_frames(start + frame.duration(), rate)
            - duration_to_frames(start, rate);
        let mut samples = resample_linear(frame.samples(), frame.sample_rate(), rate);
        let tail = samples.last().copied().unwrap_or(0.0);
        samples.resize(span as usize, tail);

        mixer.add(id, start, samples, on_ended);
    }

    fn stop(&self, id: u64) {
        lock(&self.mixer).remove(id);
    }

    fn shutdown(&self) {
        let guard = lock(&self.device).take();
        if guard.is_some() {
            drop(guard);
            debug!("speaker output shut down");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_output_stream(mixer: Arc<Mutex<Mixer>>) -> Result<cpal::Stream, DeviceError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(DeviceError::NoOutputDevice)?;
    let config = device
        .default_output_config()
        .map_err(|e| DeviceError::Config(e.to_string()))?;

    let channels = config.channels() as usize;
    lock(&mixer).set_sample_rate(config.sample_rate());

    let err_fn = |err: cpal::StreamError| error!("Playback stream error: {}", err);

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_block(&mixer, data, channels);
            },
            err_fn,
            None,
        ),
        cpal::SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config.into(),
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    render_block(&mixer, &mut scratch, channels);
                    for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                        *out = (sample * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            )
        }
        other => return Err(DeviceError::UnsupportedFormat(format!("{:?}", other))),
    }
    .map_err(|e| DeviceError::Build(e.to_string()))?;

    stream.play().map_err(|e| DeviceError::Play(e.to_string()))?;
    Ok(stream)
}
