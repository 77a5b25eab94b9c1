//! PCM16 framing between float samples and transport packets

use base64::{engine::general_purpose, Engine as _};
use std::fmt;

use super::capture::CaptureFrame;
use super::error::DecodeError;
use super::player::PlaybackFrame;

/// Encoding carried by an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEncoding {
    Pcm16 { sample_rate: u32 },
}

impl PacketEncoding {
    /// MIME type understood by the Live API
    pub fn mime_type(&self) -> String {
        match self {
            PacketEncoding::Pcm16 { sample_rate } => format!("audio/pcm;rate={}", sample_rate),
        }
    }
}

impl fmt::Display for PacketEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketEncoding::Pcm16 { sample_rate } => write!(f, "pcm16@{}", sample_rate),
        }
    }
}

/// One encoded capture frame, sent once and forgotten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    data: Vec<u8>,
    encoding: PacketEncoding,
}

impl EncodedPacket {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn encoding(&self) -> PacketEncoding {
        self.encoding
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }
}

/// Convert a float sample to PCM16.
///
/// No clamping: `round(s * 32768)` is truncated to 16 bits, so anything at or
/// beyond full scale wraps (`1.0` becomes `-32768`).
#[inline]
pub fn sample_to_pcm16(sample: f32) -> i16 {
    (sample * 32768.0).round() as i32 as i16
}

/// Encode a capture frame as little-endian PCM16
pub fn encode(frame: &CaptureFrame) -> EncodedPacket {
    let mut data = Vec::with_capacity(frame.samples().len() * 2);
    for &sample in frame.samples() {
        data.extend_from_slice(&sample_to_pcm16(sample).to_le_bytes());
    }

    EncodedPacket {
        data,
        encoding: PacketEncoding::Pcm16 {
            sample_rate: frame.sample_rate(),
        },
    }
}

/// Decode little-endian PCM16 bytes into a mono playback frame
pub fn decode_pcm16(bytes: &[u8], sample_rate: u32) -> Result<PlaybackFrame, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(PlaybackFrame::new(samples, sample_rate))
}

pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(general_purpose::STANDARD.decode(data)?)
}
