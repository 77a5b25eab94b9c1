//! Default values for configuration fields.

use crate::api::live_voice::{
    CAPTURE_FRAME_SIZE, CAPTURE_SAMPLE_RATE, LIVE_VOICE_MODEL, PLAYBACK_SAMPLE_RATE,
};

// --- CONSTANTS ---
pub const LIVE_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Environment variables consulted when the config has no key
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

pub fn default_endpoint() -> String {
    LIVE_ENDPOINT.to_string()
}
pub fn default_model() -> String {
    LIVE_VOICE_MODEL.to_string()
}
// 'Puck' is a clear masculine voice; 'Fenrir' and 'Charon' are deeper alternatives
pub fn default_voice_name() -> String {
    "Puck".to_string()
}
pub fn default_capture_sample_rate() -> u32 {
    CAPTURE_SAMPLE_RATE
}
pub fn default_capture_frame_size() -> usize {
    CAPTURE_FRAME_SIZE
}
pub fn default_playback_sample_rate() -> u32 {
    PLAYBACK_SAMPLE_RATE
}
pub fn default_true() -> bool {
    true
}
pub fn default_connect_timeout_secs() -> u64 {
    10
}
pub fn default_setup_timeout_secs() -> u64 {
    15
}
