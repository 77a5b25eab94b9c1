pub mod live_voice;
