use anyhow::Context;
use std::io::{BufRead, Write};
use tracing::info;
use tracing_subscriber::EnvFilter;

use live_voice::api::live_voice::{LiveCallbacks, LiveError, LiveVoiceSession};
use live_voice::config::{get_config_path, load_config, save_config};

/// Prints transcripts as they stream in
struct ConsoleCallbacks;

impl LiveCallbacks for ConsoleCallbacks {
    fn on_open(&self) {
        println!("Connected. Start talking; press Enter to hang up.");
    }

    fn on_message(&self, text: &str, is_input: bool) {
        let mut out = std::io::stdout().lock();
        let _ = if is_input {
            write!(out, "\x1b[2m{}\x1b[0m", text)
        } else {
            write!(out, "{}", text)
        };
        let _ = out.flush();
    }

    fn on_interrupted(&self) {
        println!(" [interrupted]");
    }

    fn on_close(&self) {
        println!("\nSession closed by the server. Press Enter to exit.");
    }

    fn on_error(&self, error: &LiveError) {
        eprintln!("\nSession error: {}", error);
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("live_voice=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = get_config_path();
    let config = load_config();
    if !config_path.exists() {
        // Leave an editable file behind for the next run
        save_config(&config).context("failed to write default config")?;
        info!(path = %config_path.display(), "wrote default config");
    }
    if config.api_key().is_none() {
        anyhow::bail!(
            "no API key: set gemini_api_key in {} or export GEMINI_API_KEY",
            config_path.display()
        );
    }

    let session = LiveVoiceSession::with_defaults(config);
    let active = session.config();
    info!(model = %active.model, voice = %active.voice_name, "starting");
    session
        .start(ConsoleCallbacks)
        .context("failed to start live session")?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    session.stop();
    println!();
    info!(interruptions = session.interruptions(), "bye");
    Ok(())
}
