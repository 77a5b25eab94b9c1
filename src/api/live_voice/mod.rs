//! Gemini Live duplex voice
//!
//! Streams the microphone to the live model over a bidirectional WebSocket
//! and plays its spoken replies back gaplessly. When the server reports that
//! the user barged in, queued speech is cut immediately and the session keeps
//! listening.
//!
//! Thread layout per session: a capture pump, a transport I/O thread and an
//! event dispatcher, plus one thread per cpal device.

pub mod backend;
pub mod capture;
pub mod device;
pub mod encoder;
pub mod error;
pub mod interrupt;
pub mod manager;
pub mod player;
pub mod types;
pub mod utils;
pub mod websocket;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{AudioBackend, CpalBackend};
pub use capture::{CaptureControl, CaptureFeed, CaptureFrame, CaptureStream};
pub use device::DeviceGuard;
pub use encoder::{EncodedPacket, PacketEncoding};
pub use error::{ConnectError, DecodeError, DeviceError, LiveError, TransportError};
pub use interrupt::{Interruption, InterruptionController, PlaybackPhase};
pub use manager::{LiveCallbacks, LiveVoiceSession};
pub use player::{AudioOutput, CpalOutput, PlaybackFrame, PlaybackScheduler, ScheduledBuffer};
pub use types::{
    ControlSignal, InboundEvent, SessionState, VoiceStatus, CAPTURE_FRAME_SIZE,
    CAPTURE_SAMPLE_RATE, LIVE_VOICE_MODEL, PLAYBACK_SAMPLE_RATE,
};
pub use websocket::WebSocketConnector;
pub use worker::{Connector, LinkMessage, LiveLink, PendingConnect, TransportHandle};
