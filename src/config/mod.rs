//! Configuration module for live-voice.
//!
//! - `types`: defaults and constants
//! - `config_struct`: Config struct definition
//! - `io`: Config loading and saving

mod config_struct;
mod io;
mod types;

pub use config_struct::Config;
pub use io::{get_config_path, load_config, load_config_from, save_config, save_config_to};
pub use types::LIVE_ENDPOINT;
