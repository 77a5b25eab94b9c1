//! Config struct definition.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::types::{
    default_capture_frame_size, default_capture_sample_rate, default_connect_timeout_secs,
    default_endpoint, default_model, default_playback_sample_rate, default_setup_timeout_secs,
    default_true, default_voice_name, API_KEY_ENV_VARS,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub gemini_api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,

    // --- Persona ---
    #[serde(default = "default_voice_name")]
    pub voice_name: String,
    #[serde(default)]
    pub system_instruction: String,

    // --- Audio ---
    #[serde(default = "default_capture_sample_rate")]
    pub capture_sample_rate: u32,
    #[serde(default = "default_capture_frame_size")]
    pub capture_frame_size: usize,
    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,

    // --- Transcription ---
    #[serde(default = "default_true")]
    pub input_transcription: bool,
    #[serde(default = "default_true")]
    pub output_transcription: bool,

    // --- Timeouts ---
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            endpoint: default_endpoint(),
            model: default_model(),
            voice_name: default_voice_name(),
            system_instruction: String::new(),
            capture_sample_rate: default_capture_sample_rate(),
            capture_frame_size: default_capture_frame_size(),
            playback_sample_rate: default_playback_sample_rate(),
            input_transcription: true,
            output_transcription: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            setup_timeout_secs: default_setup_timeout_secs(),
        }
    }
}

impl Config {
    /// The configured key, or the first non-empty key from the environment
    pub fn api_key(&self) -> Option<String> {
        if !self.gemini_api_key.trim().is_empty() {
            return Some(self.gemini_api_key.trim().to_string());
        }
        API_KEY_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}
