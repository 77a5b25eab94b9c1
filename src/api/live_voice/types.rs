//! Types for live voice sessions

use super::error::{DeviceError, TransportError};

/// Native audio model used for duplex voice
pub const LIVE_VOICE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";

/// Microphone audio is streamed at 16kHz mono
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Synthesized speech arrives at 24kHz mono
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Samples per outbound frame (256ms at 16kHz)
pub const CAPTURE_FRAME_SIZE: usize = 4096;

/// Events delivered by the transport, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// A chunk of synthesized speech (PCM16 little-endian)
    Audio { data: Vec<u8>, sample_rate: u32 },
    /// Incremental transcript; `is_input` is true for what the user said
    Transcript { text: String, is_input: bool },
    Control(ControlSignal),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlSignal {
    /// The user barged in while the model was speaking
    Interrupted,
    /// The remote side closed the stream
    Closed,
    Error(TransportError),
}

/// What the dispatcher consumes: transport events plus local device failures
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Inbound(InboundEvent),
    DeviceLost(DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Coarse status for a voice UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceStatus {
    Idle,
    Connecting,
    Listening,
    Speaking,
}

impl VoiceStatus {
    pub fn derive(state: SessionState, playback_active: bool) -> Self {
        match state {
            SessionState::Connecting => VoiceStatus::Connecting,
            SessionState::Open if playback_active => VoiceStatus::Speaking,
            SessionState::Open => VoiceStatus::Listening,
            _ => VoiceStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_state_and_playback() {
        assert_eq!(
            VoiceStatus::derive(SessionState::Connecting, false),
            VoiceStatus::Connecting
        );
        assert_eq!(
            VoiceStatus::derive(SessionState::Open, false),
            VoiceStatus::Listening
        );
        assert_eq!(
            VoiceStatus::derive(SessionState::Open, true),
            VoiceStatus::Speaking
        );
        assert_eq!(
            VoiceStatus::derive(SessionState::Closed, true),
            VoiceStatus::Idle
        );
    }
}
