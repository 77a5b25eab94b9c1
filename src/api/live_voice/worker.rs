//! Transport I/O thread: handshake, outbound queue, inbound events

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::encoder::EncodedPacket;
use super::error::{ConnectError, TransportError};
use super::types::{ControlSignal, InboundEvent, SessionEvent};
use super::websocket::{
    build_realtime_input, build_setup_message, is_setup_complete, parse_error,
    parse_server_message,
};
use crate::config::Config;

/// What a link yields when polled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    Text(String),
    Closed,
}

/// An established bidirectional text stream to the service
pub trait LiveLink: Send {
    fn send_text(&mut self, text: &str) -> Result<(), TransportError>;
    /// `Ok(None)` when nothing arrived within a short poll interval
    fn poll(&mut self) -> Result<Option<LinkMessage>, TransportError>;
    /// Best-effort close
    fn close(&mut self);
}

/// Opens links; implementations block for at most the connect timeout
pub trait Connector: Send + Sync {
    fn connect(&self, config: &Config) -> Result<Box<dyn LiveLink>, ConnectError>;
}

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug)]
struct TransportShared {
    state: AtomicU8,
    closing: AtomicBool,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl TransportShared {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Sending side of the transport, shared by the capture pump and the facade
#[derive(Debug, Clone)]
pub struct TransportHandle {
    outbound: mpsc::Sender<EncodedPacket>,
    shared: Arc<TransportShared>,
}

/// Outcome of the handshake running on the I/O thread
pub struct PendingConnect {
    ready: mpsc::Receiver<Result<(), ConnectError>>,
}

impl PendingConnect {
    /// Block until the session is set up, or `cancel` is raised
    pub fn wait(self, cancel: &AtomicBool) -> Result<(), ConnectError> {
        loop {
            if cancel.load(Ordering::SeqCst) {
                return Err(ConnectError::Cancelled);
            }
            match self.ready.recv_timeout(Duration::from_millis(20)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ConnectError::Cancelled),
            }
        }
    }
}

impl TransportHandle {
    /// Start the I/O thread; events flow to `events` once the session is open
    pub(crate) fn spawn(
        connector: Arc<dyn Connector>,
        config: Config,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<(TransportHandle, PendingConnect), ConnectError> {
        let (outbound_tx, outbound_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let shared = Arc::new(TransportShared {
            state: AtomicU8::new(STATE_CONNECTING),
            closing: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let thread_shared = shared.clone();
        std::thread::Builder::new()
            .name("live-transport".to_string())
            .spawn(move || {
                run_transport(connector, config, outbound_rx, events, thread_shared, ready_tx);
            })
            .map_err(|e| ConnectError::Thread(e.to_string()))?;

        Ok((
            TransportHandle {
                outbound: outbound_tx,
                shared,
            },
            PendingConnect { ready: ready_rx },
        ))
    }

    /// Fire-and-forget. Queued while connecting, dropped once closed.
    pub fn send(&self, packet: EncodedPacket) -> bool {
        if self.is_closed() || self.outbound.send(packet).is_err() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Idempotent; abandons anything still queued
    pub fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            debug!("transport close requested");
        }
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed() && self.shared.state.load(Ordering::SeqCst) == STATE_OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closing() || self.shared.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Packets written to the link so far
    pub fn sent_count(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Packets refused or abandoned
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

fn run_transport(
    connector: Arc<dyn Connector>,
    config: Config,
    outbound: mpsc::Receiver<EncodedPacket>,
    events: mpsc::Sender<SessionEvent>,
    shared: Arc<TransportShared>,
    ready: mpsc::SyncSender<Result<(), ConnectError>>,
) {
    let mut link = match connector.connect(&config) {
        Ok(link) => link,
        Err(e) => {
            shared.state.store(STATE_CLOSED, Ordering::SeqCst);
            let _ = ready.send(Err(e));
            return;
        }
    };

    // close() may have landed while the connect was still blocking
    if shared.is_closing() {
        link.close();
        shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        let _ = ready.send(Err(ConnectError::Cancelled));
        debug!("transport closed before setup was sent");
        return;
    }

    if let Err(e) = perform_setup(link.as_mut(), &config, &shared) {
        link.close();
        shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        let _ = ready.send(Err(e));
        return;
    }

    shared.state.store(STATE_OPEN, Ordering::SeqCst);
    if ready.send(Ok(())).is_err() {
        link.close();
        shared.state.store(STATE_CLOSED, Ordering::SeqCst);
        return;
    }
    info!(model = %config.model, voice = %config.voice_name, "live session open");

    if let Some(signal) = pump(
        link.as_mut(),
        &outbound,
        &shared,
        &events,
        config.playback_sample_rate,
    ) {
        if !shared.is_closing() {
            let _ = events.send(SessionEvent::Inbound(InboundEvent::Control(signal)));
        }
    }

    link.close();
    shared.state.store(STATE_CLOSED, Ordering::SeqCst);

    let abandoned = outbound.try_iter().count() as u64;
    shared.dropped.fetch_add(abandoned, Ordering::Relaxed);
    debug!(
        sent = shared.sent.load(Ordering::Relaxed),
        abandoned, "transport thread finished"
    );
}

/// Send the setup message and wait for `setupComplete`
fn perform_setup(
    link: &mut dyn LiveLink,
    config: &Config,
    shared: &TransportShared,
) -> Result<(), ConnectError> {
    let setup = build_setup_message(config);
    link.send_text(&setup.to_string())
        .map_err(|e| ConnectError::Setup(e.to_string()))?;

    let deadline = Instant::now() + config.setup_timeout();
    loop {
        if shared.is_closing() {
            return Err(ConnectError::Cancelled);
        }

        match link.poll() {
            Ok(Some(LinkMessage::Text(msg))) => {
                if is_setup_complete(&msg) {
                    return Ok(());
                }
                if let Some(error) = parse_error(&msg) {
                    return Err(ConnectError::Rejected(error));
                }
            }
            Ok(Some(LinkMessage::Closed)) => {
                return Err(ConnectError::Setup(
                    "connection closed during setup".to_string(),
                ))
            }
            Ok(None) => {}
            Err(e) => return Err(ConnectError::Setup(e.to_string())),
        }

        if Instant::now() >= deadline {
            return Err(ConnectError::Timeout);
        }
    }
}

/// Main I/O loop. Returns the control signal that ended it, or `None` on local close.
fn pump(
    link: &mut dyn LiveLink,
    outbound: &mpsc::Receiver<EncodedPacket>,
    shared: &TransportShared,
    events: &mpsc::Sender<SessionEvent>,
    default_rate: u32,
) -> Option<ControlSignal> {
    loop {
        if shared.is_closing() {
            return None;
        }

        loop {
            match outbound.try_recv() {
                Ok(packet) => {
                    let msg = build_realtime_input(&packet).to_string();
                    if let Err(e) = link.send_text(&msg) {
                        error!("Live transport send failed: {}", e);
                        return Some(ControlSignal::Error(e));
                    }
                    shared.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return None,
            }
        }

        match link.poll() {
            Ok(Some(LinkMessage::Text(msg))) => {
                if let Some(error) = parse_error(&msg) {
                    error!("Live session error from server: {}", error);
                    return Some(ControlSignal::Error(TransportError::Server(error)));
                }
                for event in parse_server_message(&msg, default_rate) {
                    if shared.is_closing() {
                        return None;
                    }
                    if events.send(SessionEvent::Inbound(event)).is_err() {
                        return None;
                    }
                }
            }
            Ok(Some(LinkMessage::Closed)) => {
                info!("live session closed by server");
                return Some(ControlSignal::Closed);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Live transport read failed: {}", e);
                return Some(ControlSignal::Error(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::capture::CaptureFrame;
    use super::super::encoder::encode;
    use super::super::testing::{wait_for, FakeConnector, SetupReply};
    use super::*;

    fn packet() -> EncodedPacket {
        encode(&CaptureFrame::new(vec![0.1; 16], 16000))
    }

    fn recv_inbound(events: &mpsc::Receiver<SessionEvent>) -> InboundEvent {
        match events.recv_timeout(Duration::from_secs(2)).unwrap() {
            SessionEvent::Inbound(event) => event,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_handshake_then_send_and_receive() {
        let (connector, server) = FakeConnector::new(SetupReply::Complete);
        let (events_tx, events_rx) = mpsc::channel();

        let (handle, pending) =
            TransportHandle::spawn(connector.clone(), Config::default(), events_tx).unwrap();
        pending.wait(&AtomicBool::new(false)).unwrap();
        assert!(handle.is_open());

        let setup = server.next_sent().unwrap();
        assert!(setup.contains("\"setup\""));

        assert!(handle.send(packet()));
        let sent = server.next_sent().unwrap();
        assert!(sent.contains("realtimeInput"));
        assert!(sent.contains("audio/pcm;rate=16000"));

        server.push(r#"{"serverContent":{"outputTranscription":{"text":"hi"}}}"#);
        assert_eq!(
            recv_inbound(&events_rx),
            InboundEvent::Transcript {
                text: "hi".to_string(),
                is_input: false
            }
        );

        handle.close();
        assert!(!handle.send(packet()));
        assert_eq!(handle.dropped_count(), 1);
        assert!(connector.wait_link_closed(Duration::from_secs(2)));
    }

    #[test]
    fn test_packets_queue_while_connecting() {
        let (connector, server) = FakeConnector::new(SetupReply::Manual);
        let (events_tx, _events_rx) = mpsc::channel();

        let (handle, pending) =
            TransportHandle::spawn(connector, Config::default(), events_tx).unwrap();
        assert!(!handle.is_open());
        assert!(handle.send(packet()));
        assert!(handle.send(packet()));

        assert!(server.next_sent().unwrap().contains("\"setup\""));
        server.push(r#"{"setupComplete":{}}"#);
        pending.wait(&AtomicBool::new(false)).unwrap();

        assert!(server.next_sent().unwrap().contains("realtimeInput"));
        assert!(server.next_sent().unwrap().contains("realtimeInput"));
        handle.close();
    }

    #[test]
    fn test_rejected_setup_is_connect_error() {
        let (connector, _server) =
            FakeConnector::new(SetupReply::Error("API key not valid".to_string()));
        let (events_tx, _events_rx) = mpsc::channel();

        let (_handle, pending) =
            TransportHandle::spawn(connector, Config::default(), events_tx).unwrap();

        assert_eq!(
            pending.wait(&AtomicBool::new(false)).unwrap_err(),
            ConnectError::Rejected("API key not valid".to_string())
        );
    }

    #[test]
    fn test_connector_failure_is_connect_error() {
        let connector = FakeConnector::failing(ConnectError::MissingApiKey);
        let (events_tx, _events_rx) = mpsc::channel();

        let (handle, pending) =
            TransportHandle::spawn(connector, Config::default(), events_tx).unwrap();

        assert_eq!(
            pending.wait(&AtomicBool::new(false)).unwrap_err(),
            ConnectError::MissingApiKey
        );
        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_setup_times_out() {
        let (connector, _server) = FakeConnector::new(SetupReply::Manual);
        let (events_tx, _events_rx) = mpsc::channel();
        let config = Config {
            setup_timeout_secs: 0,
            ..Config::default()
        };

        let (_handle, pending) = TransportHandle::spawn(connector, config, events_tx).unwrap();

        assert_eq!(
            pending.wait(&AtomicBool::new(false)).unwrap_err(),
            ConnectError::Timeout
        );
    }

    #[test]
    fn test_server_close_and_errors_become_control_events() {
        let (connector, server) = FakeConnector::new(SetupReply::Complete);
        let (events_tx, events_rx) = mpsc::channel();
        let (_handle, pending) =
            TransportHandle::spawn(connector, Config::default(), events_tx).unwrap();
        pending.wait(&AtomicBool::new(false)).unwrap();

        server.push(r#"{"error":{"message":"quota exceeded"}}"#);
        assert_eq!(
            recv_inbound(&events_rx),
            InboundEvent::Control(ControlSignal::Error(TransportError::Server(
                "quota exceeded".to_string()
            )))
        );

        let (connector, server) = FakeConnector::new(SetupReply::Complete);
        let (events_tx, events_rx) = mpsc::channel();
        let (_handle, pending) =
            TransportHandle::spawn(connector, Config::default(), events_tx).unwrap();
        pending.wait(&AtomicBool::new(false)).unwrap();

        server.close();
        assert_eq!(
            recv_inbound(&events_rx),
            InboundEvent::Control(ControlSignal::Closed)
        );
    }

    #[test]
    fn test_close_during_connect_sends_nothing() {
        let (connector, server, release) = FakeConnector::gated(SetupReply::Complete);
        let (events_tx, _events_rx) = mpsc::channel();
        let (handle, pending) =
            TransportHandle::spawn(connector.clone(), Config::default(), events_tx).unwrap();

        assert!(wait_for(Duration::from_secs(2), || connector.connects() == 1));
        handle.close();
        release.send(()).unwrap();

        assert_eq!(
            pending.wait(&AtomicBool::new(false)).unwrap_err(),
            ConnectError::Cancelled
        );
        assert!(connector.wait_link_closed(Duration::from_secs(2)));
        assert!(handle.is_closed());
        assert_eq!(server.next_sent(), None);
    }

    #[test]
    fn test_cancel_while_waiting_for_setup() {
        let (connector, _server) = FakeConnector::new(SetupReply::Manual);
        let (events_tx, _events_rx) = mpsc::channel();
        let (handle, pending) =
            TransportHandle::spawn(connector.clone(), Config::default(), events_tx).unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let waiter = {
            let cancel = cancel.clone();
            std::thread::spawn(move || pending.wait(&cancel))
        };
        std::thread::sleep(Duration::from_millis(30));
        cancel.store(true, Ordering::SeqCst);
        handle.close();

        assert_eq!(waiter.join().unwrap().unwrap_err(), ConnectError::Cancelled);
        assert!(connector.wait_link_closed(Duration::from_secs(2)));
    }
}
