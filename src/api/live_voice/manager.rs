//! Session facade: owns one live conversation from start to stop

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{AudioBackend, CpalBackend};
use super::capture::{CaptureControl, CaptureStream};
use super::encoder::encode;
use super::error::{ConnectError, DeviceError, LiveError};
use super::interrupt::InterruptionController;
use super::player::{AudioOutput, PlaybackScheduler};
use super::types::{ControlSignal, InboundEvent, SessionEvent, SessionState, VoiceStatus};
use super::utils::rms;
use super::websocket::WebSocketConnector;
use super::worker::{Connector, TransportHandle};
use crate::config::Config;

/// Receives session notifications on the dispatcher thread.
///
/// Nothing is delivered after `stop()` returns. A user-initiated stop does
/// not produce `on_close`.
pub trait LiveCallbacks: Send + Sync {
    fn on_open(&self) {}
    fn on_message(&self, _text: &str, _is_input: bool) {}
    fn on_interrupted(&self) {}
    fn on_close(&self) {}
    fn on_error(&self, _error: &LiveError) {}
}

impl<T: LiveCallbacks + ?Sized> LiveCallbacks for Arc<T> {
    fn on_open(&self) {
        (**self).on_open()
    }
    fn on_message(&self, text: &str, is_input: bool) {
        (**self).on_message(text, is_input)
    }
    fn on_interrupted(&self) {
        (**self).on_interrupted()
    }
    fn on_close(&self) {
        (**self).on_close()
    }
    fn on_error(&self, error: &LiveError) {
        (**self).on_error(error)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        IN_CALLBACK.with(|c| c.set(true));
        CallbackScope
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        IN_CALLBACK.with(|c| c.set(false));
    }
}

/// Per-run stop flag. Callbacks run under `gate`, so once `halt` returns
/// no callback of this run is in flight or will start.
#[derive(Default)]
struct RunFlags {
    stopped: AtomicBool,
    gate: Mutex<()>,
}

impl RunFlags {
    fn halt(&self) {
        // A callback calling stop() already holds the gate on this thread
        let _gate = if IN_CALLBACK.with(|c| c.get()) {
            None
        } else {
            Some(lock(&self.gate))
        };
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run `f` unless the run was halted. Returns whether it ran.
    fn while_running(&self, f: impl FnOnce()) -> bool {
        let _gate = lock(&self.gate);
        if self.is_stopped() {
            return false;
        }
        let _scope = CallbackScope::enter();
        f();
        true
    }
}

/// Everything a run holds that must be released exactly once
struct RunResources {
    transport: TransportHandle,
    capture: CaptureControl,
    capture_thread: Option<JoinHandle<()>>,
    controller: Arc<InterruptionController>,
    output: Arc<dyn AudioOutput>,
}

impl RunResources {
    fn release(mut self) {
        let flushed = self.controller.scheduler().flush();
        self.capture.release();
        if let Some(handle) = self.capture_thread.take() {
            if handle.join().is_err() {
                warn!("capture thread panicked");
            }
        }
        self.transport.close();
        self.output.shutdown();
        debug!(
            flushed,
            sent = self.transport.sent_count(),
            dropped = self.transport.dropped_count(),
            "session resources released"
        );
    }
}

struct ActiveRun {
    flags: Arc<RunFlags>,
    resources: Option<RunResources>,
}

#[derive(Default)]
struct SessionShared {
    state: Mutex<SessionState>,
    run: Mutex<Option<ActiveRun>>,
    /// Barge-ins counted by controllers of runs that already ended
    past_interruptions: AtomicU64,
    input_level: AtomicU32,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    /// Tear down the run owning `flags`. False if it was already gone.
    fn end_run(&self, flags: &Arc<RunFlags>) -> bool {
        let run = {
            let mut run = lock(&self.run);
            match run.as_ref() {
                Some(active) if Arc::ptr_eq(&active.flags, flags) => run.take(),
                _ => None,
            }
        };
        let Some(run) = run else {
            return false;
        };

        flags.halt();
        self.set_state(SessionState::Closing);
        if let Some(resources) = run.resources {
            self.past_interruptions
                .fetch_add(resources.controller.interruptions(), Ordering::Relaxed);
            resources.release();
        }
        self.input_level.store(0, Ordering::Relaxed);
        self.set_state(SessionState::Closed);
        true
    }
}

/// One duplex voice conversation with the live model.
///
/// `start` blocks until the service acknowledges the session; `stop` may be
/// called from any thread, including from inside a callback.
pub struct LiveVoiceSession {
    config: Config,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn Connector>,
    shared: Arc<SessionShared>,
}

impl LiveVoiceSession {
    pub fn new(
        config: Config,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            backend,
            connector,
            shared: Arc::new(SessionShared::default()),
        }
    }

    /// Default microphone, default speaker, WebSocket transport
    pub fn with_defaults(config: Config) -> Self {
        Self::new(config, Arc::new(CpalBackend), Arc::new(WebSocketConnector))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn start<C: LiveCallbacks + 'static>(&self, callbacks: C) -> Result<(), LiveError> {
        let flags = Arc::new(RunFlags::default());
        {
            let mut state = lock(&self.shared.state);
            match *state {
                SessionState::Idle | SessionState::Closed => *state = SessionState::Connecting,
                _ => return Err(LiveError::AlreadyRunning),
            }
            *lock(&self.shared.run) = Some(ActiveRun {
                flags: flags.clone(),
                resources: None,
            });
        }
        info!(model = %self.config.model, "starting live session");

        let callbacks: Arc<dyn LiveCallbacks> = Arc::new(callbacks);
        match self.launch(&flags, callbacks) {
            Ok(()) => Ok(()),
            Err(e) => {
                if !matches!(e, LiveError::Cancelled) {
                    error!("Live session failed to start: {}", e);
                }
                self.shared.end_run(&flags);
                Err(e)
            }
        }
    }

    fn launch(&self, flags: &Arc<RunFlags>, callbacks: Arc<dyn LiveCallbacks>) -> Result<(), LiveError> {
        let config = &self.config;

        let input = self
            .backend
            .open_input(config.capture_sample_rate, config.capture_frame_size)?;
        let output = self.backend.open_output(config.playback_sample_rate)?;

        let scheduler = Arc::new(PlaybackScheduler::new(output.clone()));
        let controller = Arc::new(InterruptionController::new(scheduler));
        let (events_tx, events_rx) = mpsc::channel();

        let (transport, pending) =
            match TransportHandle::spawn(self.connector.clone(), config.clone(), events_tx.clone()) {
                Ok(spawned) => spawned,
                Err(e) => {
                    output.shutdown();
                    return Err(e.into());
                }
            };

        let capture = input.control();
        let capture_thread =
            match spawn_capture_pump(input, transport.clone(), events_tx, self.shared.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    transport.close();
                    output.shutdown();
                    return Err(e.into());
                }
            };

        let resources = RunResources {
            transport,
            capture,
            capture_thread: Some(capture_thread),
            controller: controller.clone(),
            output,
        };
        {
            let mut run = lock(&self.shared.run);
            match run.as_mut() {
                Some(active) if Arc::ptr_eq(&active.flags, flags) && !flags.is_stopped() => {
                    active.resources = Some(resources);
                }
                _ => {
                    drop(run);
                    resources.release();
                    return Err(LiveError::Cancelled);
                }
            }
        }

        match pending.wait(&flags.stopped) {
            Ok(()) => {}
            Err(_) if flags.is_stopped() => return Err(LiveError::Cancelled),
            Err(e) => return Err(e.into()),
        }

        let shared = self.shared.clone();
        let opened = flags.while_running(|| {
            shared.set_state(SessionState::Open);
            callbacks.on_open();
        });
        if !opened {
            return Err(LiveError::Cancelled);
        }
        if flags.is_stopped() {
            // stopped from inside on_open
            return Ok(());
        }

        let dispatcher = Dispatcher {
            events: events_rx,
            controller,
            callbacks,
            flags: flags.clone(),
            shared: self.shared.clone(),
        };
        std::thread::Builder::new()
            .name("live-events".to_string())
            .spawn(move || dispatcher.run())
            .map_err(|e| ConnectError::Thread(e.to_string()))?;

        Ok(())
    }

    /// End the session. Idempotent; a no-op when nothing is running.
    pub fn stop(&self) {
        let flags = lock(&self.shared.run).as_ref().map(|run| run.flags.clone());
        if let Some(flags) = flags {
            if self.shared.end_run(&flags) {
                info!("live session stopped");
            }
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn status(&self) -> VoiceStatus {
        VoiceStatus::derive(self.state(), self.playback_active())
    }

    /// True while scheduled speech has not finished or been flushed
    pub fn playback_active(&self) -> bool {
        lock(&self.shared.run)
            .as_ref()
            .and_then(|run| run.resources.as_ref())
            .map(|res| res.controller.scheduler().live_len() > 0)
            .unwrap_or(false)
    }

    /// Barge-ins handled over the lifetime of this session object
    pub fn interruptions(&self) -> u64 {
        let current = lock(&self.shared.run)
            .as_ref()
            .and_then(|run| run.resources.as_ref())
            .map(|res| res.controller.interruptions())
            .unwrap_or(0);
        self.shared.past_interruptions.load(Ordering::Relaxed) + current
    }

    /// RMS of the most recent capture frame, 0.0 when idle
    pub fn input_level(&self) -> f32 {
        f32::from_bits(self.shared.input_level.load(Ordering::Relaxed))
    }
}

impl Drop for LiveVoiceSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_capture_pump(
    mut stream: CaptureStream,
    transport: TransportHandle,
    events: mpsc::Sender<SessionEvent>,
    shared: Arc<SessionShared>,
) -> Result<JoinHandle<()>, DeviceError> {
    std::thread::Builder::new()
        .name("live-capture".to_string())
        .spawn(move || {
            debug!(
                frame_size = stream.frame_size(),
                sample_rate = stream.sample_rate(),
                "capture pump running"
            );
            let mut frames = 0u64;
            for frame in stream.by_ref() {
                shared
                    .input_level
                    .store(rms(frame.samples()).to_bits(), Ordering::Relaxed);
                if !transport.send(encode(&frame)) && transport.is_closed() {
                    break;
                }
                frames += 1;
            }

            if stream.failed() {
                error!("Microphone stopped delivering audio");
                let _ = events.send(SessionEvent::DeviceLost(DeviceError::Disconnected));
            }
            debug!(frames, "capture pump finished");
        })
        .map_err(|e| DeviceError::Thread(e.to_string()))
}

/// Serial consumer of transport and device events
struct Dispatcher {
    events: mpsc::Receiver<SessionEvent>,
    controller: Arc<InterruptionController>,
    callbacks: Arc<dyn LiveCallbacks>,
    flags: Arc<RunFlags>,
    shared: Arc<SessionShared>,
}

impl Dispatcher {
    fn run(self) {
        for event in self.events.iter() {
            if self.flags.is_stopped() {
                break;
            }

            match event {
                SessionEvent::Inbound(InboundEvent::Audio { data, sample_rate }) => {
                    self.flags.while_running(|| {
                        if let Err(e) = self.controller.play(&data, sample_rate) {
                            warn!("Dropping undecodable audio chunk: {}", e);
                        }
                    });
                }
                SessionEvent::Inbound(InboundEvent::Transcript { text, is_input }) => {
                    self.flags
                        .while_running(|| self.callbacks.on_message(&text, is_input));
                }
                SessionEvent::Inbound(InboundEvent::Control(ControlSignal::Interrupted)) => {
                    self.flags.while_running(|| {
                        let notice = self.controller.interrupt();
                        debug!(stopped = notice.stopped, "reporting barge-in");
                        self.callbacks.on_interrupted();
                    });
                }
                SessionEvent::Inbound(InboundEvent::Control(ControlSignal::Closed)) => {
                    self.flags.while_running(|| self.callbacks.on_close());
                    self.shared.end_run(&self.flags);
                    break;
                }
                SessionEvent::Inbound(InboundEvent::Control(ControlSignal::Error(e))) => {
                    self.fail(LiveError::Transport(e));
                    break;
                }
                SessionEvent::DeviceLost(e) => {
                    self.fail(LiveError::Device(e));
                    break;
                }
            }
        }
        debug!("event dispatcher finished");
    }

    fn fail(&self, error: LiveError) {
        self.flags.while_running(|| {
            self.callbacks.on_error(&error);
            self.callbacks.on_close();
        });
        self.shared.end_run(&self.flags);
    }
}
