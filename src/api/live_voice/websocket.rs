//! WebSocket connection and wire format for the Gemini Live voice session

use anyhow::{anyhow, Context, Result};
use native_tls::TlsStream;
use serde_json::Value;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, warn};
use tungstenite::{Message, WebSocket};

use super::encoder::{decode_base64, EncodedPacket};
use super::error::{ConnectError, TransportError};
use super::types::{ControlSignal, InboundEvent};
use super::worker::{Connector, LinkMessage, LiveLink};
use crate::config::Config;

/// Read timeout used to poll the socket between outbound sends
pub const LINK_POLL_INTERVAL: Duration = Duration::from_millis(50);

const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub type LiveSocket = WebSocket<TlsStream<TcpStream>>;

/// Open the TLS WebSocket for one live session.
///
/// The key travels as a `key` query parameter; `connect_timeout` bounds the TCP connect.
pub fn connect_live_websocket(
    endpoint: &str,
    api_key: &str,
    connect_timeout: Duration,
) -> Result<LiveSocket> {
    let mut url = url::Url::parse(endpoint).context("invalid live endpoint")?;
    url.query_pairs_mut().append_pair("key", api_key);

    let host = url
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("live endpoint has no host"))?;
    let port = url.port_or_known_default().unwrap_or(443);
    let addr = (host.as_str(), port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", host))?
        .next()
        .ok_or_else(|| anyhow!("{} resolved to no address", host))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout)
        .with_context(|| format!("connecting to {}", addr))?;
    tcp.set_nodelay(true)?;
    tcp.set_write_timeout(Some(IO_TIMEOUT))?;
    // Generous until setup is done; the link shortens it for polling
    tcp.set_read_timeout(Some(IO_TIMEOUT))?;

    let tls = native_tls::TlsConnector::new()?
        .connect(&host, tcp)
        .map_err(|e| anyhow!("TLS handshake with {} failed: {}", host, e))?;
    let (socket, response) = tungstenite::client::client(url.as_str(), tls)
        .map_err(|e| anyhow!("WebSocket upgrade failed: {}", e))?;
    debug!(status = %response.status(), "websocket upgraded");

    Ok(socket)
}

/// Shorten the read timeout so the I/O loop can interleave sends and reads
pub fn set_socket_poll_timeout(socket: &mut LiveSocket, timeout: Duration) -> Result<()> {
    let tcp_stream = socket.get_mut().get_mut();
    tcp_stream.set_read_timeout(Some(timeout))?;
    Ok(())
}

/// Session setup: audio responses, a prebuilt voice, and both transcriptions
pub fn build_setup_message(config: &Config) -> Value {
    let mut setup = serde_json::json!({
        "setup": {
            "model": format!("models/{}", config.model),
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": {
                            "voiceName": config.voice_name
                        }
                    }
                }
            }
        }
    });

    if !config.system_instruction.trim().is_empty() {
        setup["setup"]["systemInstruction"] = serde_json::json!({
            "parts": [{
                "text": config.system_instruction
            }]
        });
    }

    if config.input_transcription {
        setup["setup"]["inputAudioTranscription"] = serde_json::json!({});
    }
    if config.output_transcription {
        setup["setup"]["outputAudioTranscription"] = serde_json::json!({});
    }

    setup
}

/// Wrap one encoded capture frame as realtime input
pub fn build_realtime_input(packet: &EncodedPacket) -> Value {
    serde_json::json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": packet.encoding().mime_type(),
                "data": packet.to_base64()
            }]
        }
    })
}

/// True for the server's `setupComplete` acknowledgement
pub fn is_setup_complete(msg: &str) -> bool {
    serde_json::from_str::<Value>(msg)
        .map(|json| json.get("setupComplete").is_some())
        .unwrap_or(false)
}

/// Message text of a top-level `error` object, or the raw object when it has none
pub fn parse_error(msg: &str) -> Option<String> {
    let json: Value = serde_json::from_str(msg).ok()?;
    let error = json.get("error")?;
    Some(match error.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => error.to_string(),
    })
}

/// Extract the rate from a MIME type like `audio/pcm;rate=24000`
pub fn parse_mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Turn one server message into inbound events.
///
/// Order within a message: input transcript, output transcript, audio, interruption.
/// Audio with broken base64 is dropped here.
pub fn parse_server_message(msg: &str, default_rate: u32) -> Vec<InboundEvent> {
    let mut events = Vec::new();

    let Ok(json) = serde_json::from_str::<Value>(msg) else {
        return events;
    };
    let Some(server_content) = json.get("serverContent") else {
        return events;
    };

    // Don't trim - leading spaces are word separators
    if let Some(text) = server_content
        .get("inputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(InboundEvent::Transcript {
                text: text.to_string(),
                is_input: true,
            });
        }
    }

    if let Some(text) = server_content
        .get("outputTranscription")
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
    {
        if !text.is_empty() {
            events.push(InboundEvent::Transcript {
                text: text.to_string(),
                is_input: false,
            });
        }
    }

    if let Some(parts) = server_content
        .get("modelTurn")
        .and_then(|m| m.get("parts"))
        .and_then(|p| p.as_array())
    {
        for inline in parts.iter().filter_map(|part| part.get("inlineData")) {
            let Some(data) = inline.get("data").and_then(|d| d.as_str()) else {
                continue;
            };
            let sample_rate = inline
                .get("mimeType")
                .and_then(|m| m.as_str())
                .and_then(parse_mime_rate)
                .unwrap_or(default_rate);

            match decode_base64(data) {
                Ok(bytes) => events.push(InboundEvent::Audio {
                    data: bytes,
                    sample_rate,
                }),
                Err(e) => warn!("Dropping malformed audio chunk: {}", e),
            }
        }
    }

    if server_content
        .get("interrupted")
        .and_then(|i| i.as_bool())
        .unwrap_or(false)
    {
        events.push(InboundEvent::Control(ControlSignal::Interrupted));
    }

    events
}

/// Default connector: TLS WebSocket to the configured endpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, config: &Config) -> std::result::Result<Box<dyn LiveLink>, ConnectError> {
        let api_key = config.api_key().ok_or(ConnectError::MissingApiKey)?;
        url::Url::parse(&config.endpoint).map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;

        let mut socket = connect_live_websocket(&config.endpoint, &api_key, config.connect_timeout())
            .map_err(|e| ConnectError::Handshake(format!("{:#}", e)))?;
        set_socket_poll_timeout(&mut socket, LINK_POLL_INTERVAL)
            .map_err(|e| ConnectError::Handshake(format!("{:#}", e)))?;

        debug!(model = %config.model, "live websocket connected");
        Ok(Box::new(WebSocketLink { socket }))
    }
}

struct WebSocketLink {
    socket: LiveSocket,
}

impl LiveLink for WebSocketLink {
    fn send_text(&mut self, text: &str) -> std::result::Result<(), TransportError> {
        self.socket
            .write(Message::Text(text.to_string().into()))
            .and_then(|_| self.socket.flush())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn poll(&mut self) -> std::result::Result<Option<LinkMessage>, TransportError> {
        match self.socket.read() {
            Ok(Message::Text(msg)) => Ok(Some(LinkMessage::Text(msg.as_str().to_string()))),
            // The Live API delivers JSON in binary frames too
            Ok(Message::Binary(data)) => Ok(String::from_utf8(data.to_vec())
                .ok()
                .map(LinkMessage::Text)),
            Ok(Message::Close(_)) => Ok(Some(LinkMessage::Closed)),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(ref e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(Some(LinkMessage::Closed))
            }
            Err(e) => Err(TransportError::Read(e.to_string())),
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.socket.close(None) {
            debug!("close handshake failed: {}", e);
        }
        let _ = self.socket.flush();
    }
}
