//! In-memory doubles for devices, links and callbacks

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::backend::AudioBackend;
use super::capture::{CaptureFeed, CaptureStream};
use super::device::DeviceGuard;
use super::error::{ConnectError, DeviceError, LiveError, TransportError};
use super::manager::LiveCallbacks;
use super::player::{AudioOutput, EndedHook, PlaybackFrame};
use super::worker::{Connector, LinkMessage, LiveLink};
use crate::config::Config;

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// Output with a hand-driven clock; voices finish only when told to
#[derive(Default)]
pub struct FakeOutput {
    now: Mutex<Duration>,
    scheduled: Mutex<Vec<(u64, Duration)>>,
    stopped: Mutex<Vec<u64>>,
    hooks: Mutex<HashMap<u64, EndedHook>>,
    shutdowns: AtomicUsize,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_now(&self, now: Duration) {
        *self.now.lock().unwrap() = now;
    }

    /// Simulate natural completion of a voice
    pub fn finish(&self, id: u64) {
        let hook = self.hooks.lock().unwrap().remove(&id);
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn scheduled(&self) -> Vec<(u64, Duration)> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<u64> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl AudioOutput for FakeOutput {
    fn clock_now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn schedule(&self, id: u64, start: Duration, _frame: &PlaybackFrame, on_ended: EndedHook) {
        self.scheduled.lock().unwrap().push((id, start));
        self.hooks.lock().unwrap().insert(id, on_ended);
    }

    fn stop(&self, id: u64) {
        self.stopped.lock().unwrap().push(id);
        self.hooks.lock().unwrap().remove(&id);
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Backend handing out ring-fed capture streams and a shared `FakeOutput`
pub struct FakeBackend {
    input_error: Option<DeviceError>,
    output: Arc<FakeOutput>,
    input_opens: AtomicUsize,
    input_releases: Arc<AtomicUsize>,
    feeds: Mutex<Vec<CaptureFeed>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            input_error: None,
            output: Arc::new(FakeOutput::new()),
            input_opens: AtomicUsize::new(0),
            input_releases: Arc::new(AtomicUsize::new(0)),
            feeds: Mutex::new(Vec::new()),
        })
    }

    pub fn without_input(error: DeviceError) -> Arc<Self> {
        Arc::new(Self {
            input_error: Some(error),
            output: Arc::new(FakeOutput::new()),
            input_opens: AtomicUsize::new(0),
            input_releases: Arc::new(AtomicUsize::new(0)),
            feeds: Mutex::new(Vec::new()),
        })
    }

    pub fn output(&self) -> &Arc<FakeOutput> {
        &self.output
    }

    pub fn input_opens(&self) -> usize {
        self.input_opens.load(Ordering::SeqCst)
    }

    pub fn input_releases(&self) -> usize {
        self.input_releases.load(Ordering::SeqCst)
    }

    pub fn push_capture(&self, samples: &[f32]) {
        for feed in self.feeds.lock().unwrap().iter_mut() {
            feed.push(samples);
        }
    }

    pub fn fail_capture(&self) {
        for feed in self.feeds.lock().unwrap().iter() {
            feed.fail();
        }
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(&self, sample_rate: u32, frame_size: usize) -> Result<CaptureStream, DeviceError> {
        if let Some(error) = &self.input_error {
            return Err(error.clone());
        }
        self.input_opens.fetch_add(1, Ordering::SeqCst);

        let (feed, mut stream) = CaptureStream::channel(sample_rate, frame_size);
        let releases = self.input_releases.clone();
        stream.attach(DeviceGuard::new(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }));
        self.feeds.lock().unwrap().push(feed);
        Ok(stream)
    }

    fn open_output(&self, _sample_rate: u32) -> Result<Arc<dyn AudioOutput>, DeviceError> {
        Ok(self.output.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupReply {
    Complete,
    Error(String),
    /// The test answers the setup itself through `FakeServer::push`
    Manual,
}

/// Connector producing a single in-memory link
pub struct FakeConnector {
    reply: SetupReply,
    failure: Option<ConnectError>,
    connects: AtomicUsize,
    client_ends: Mutex<Option<(mpsc::Receiver<LinkMessage>, mpsc::Sender<String>)>>,
    link_closed: Arc<AtomicBool>,
    /// When set, `connect` blocks until the test sends on the paired sender
    gate: Mutex<Option<mpsc::Receiver<()>>>,
}

/// Server side of a `FakeConnector` link
pub struct FakeServer {
    to_client: mpsc::Sender<LinkMessage>,
    from_client: mpsc::Receiver<String>,
}

impl FakeServer {
    pub fn push(&self, msg: &str) {
        let _ = self.to_client.send(LinkMessage::Text(msg.to_string()));
    }

    pub fn close(&self) {
        let _ = self.to_client.send(LinkMessage::Closed);
    }

    pub fn next_sent(&self) -> Option<String> {
        self.from_client.recv_timeout(Duration::from_secs(2)).ok()
    }
}

impl FakeConnector {
    pub fn new(reply: SetupReply) -> (Arc<Self>, FakeServer) {
        let (to_client, incoming) = mpsc::channel();
        let (outgoing, from_client) = mpsc::channel();
        let connector = Arc::new(Self {
            reply,
            failure: None,
            connects: AtomicUsize::new(0),
            client_ends: Mutex::new(Some((incoming, outgoing))),
            link_closed: Arc::new(AtomicBool::new(false)),
            gate: Mutex::new(None),
        });
        (
            connector,
            FakeServer {
                to_client,
                from_client,
            },
        )
    }

    pub fn failing(error: ConnectError) -> Arc<Self> {
        Arc::new(Self {
            reply: SetupReply::Manual,
            failure: Some(error),
            connects: AtomicUsize::new(0),
            client_ends: Mutex::new(None),
            link_closed: Arc::new(AtomicBool::new(false)),
            gate: Mutex::new(None),
        })
    }

    /// Like `new`, but `connect` blocks until the returned sender fires
    pub fn gated(reply: SetupReply) -> (Arc<Self>, FakeServer, mpsc::Sender<()>) {
        let (connector, server) = Self::new(reply);
        let (release, gate) = mpsc::channel();
        *connector.gate.lock().unwrap() = Some(gate);
        (connector, server, release)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn wait_link_closed(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.link_closed.load(Ordering::SeqCst))
    }
}

impl Connector for FakeConnector {
    fn connect(&self, _config: &Config) -> Result<Box<dyn LiveLink>, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv();
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let (incoming, outgoing) = self
            .client_ends
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ConnectError::Handshake("fake link already used".to_string()))?;

        Ok(Box::new(FakeLink {
            incoming,
            outgoing,
            pending: VecDeque::new(),
            reply: self.reply.clone(),
            closed: self.link_closed.clone(),
        }))
    }
}

struct FakeLink {
    incoming: mpsc::Receiver<LinkMessage>,
    outgoing: mpsc::Sender<String>,
    pending: VecDeque<LinkMessage>,
    reply: SetupReply,
    closed: Arc<AtomicBool>,
}

impl LiveLink for FakeLink {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Send("link closed".to_string()));
        }
        if text.starts_with("{\"setup\"") {
            match &self.reply {
                SetupReply::Complete => self
                    .pending
                    .push_back(LinkMessage::Text(r#"{"setupComplete":{}}"#.to_string())),
                SetupReply::Error(message) => self.pending.push_back(LinkMessage::Text(
                    serde_json::json!({ "error": { "message": message } }).to_string(),
                )),
                SetupReply::Manual => {}
            }
        }
        self.outgoing
            .send(text.to_string())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn poll(&mut self) -> Result<Option<LinkMessage>, TransportError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(Some(msg));
        }
        match self.incoming.recv_timeout(Duration::from_millis(5)) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Ok(Some(LinkMessage::Closed)),
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Open,
    Message(String, bool),
    Interrupted,
    Close,
    Error(LiveError),
}

/// Callbacks that record every invocation in order
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn wait_for(&self, timeout: Duration, check: impl Fn(&[Recorded]) -> bool) -> bool {
        wait_until(timeout, || check(&self.events.lock().unwrap()))
    }

    fn record(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl LiveCallbacks for RecordingCallbacks {
    fn on_open(&self) {
        self.record(Recorded::Open);
    }

    fn on_message(&self, text: &str, is_input: bool) {
        self.record(Recorded::Message(text.to_string(), is_input));
    }

    fn on_interrupted(&self) {
        self.record(Recorded::Interrupted);
    }

    fn on_close(&self) {
        self.record(Recorded::Close);
    }

    fn on_error(&self, error: &LiveError) {
        self.record(Recorded::Error(error.clone()));
    }
}

pub fn wait_for(timeout: Duration, check: impl FnMut() -> bool) -> bool {
    wait_until(timeout, check)
}
