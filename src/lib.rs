//! Real-time duplex voice sessions with the Gemini Live API.

pub mod api;
pub mod config;

pub use api::live_voice::{LiveCallbacks, LiveError, LiveVoiceSession, SessionState, VoiceStatus};
pub use config::Config;
