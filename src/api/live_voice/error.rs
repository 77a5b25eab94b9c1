//! Error taxonomy for live voice sessions

/// Audio device acquisition or runtime failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("No microphone available. Please connect a microphone.")]
    NoInputDevice,

    #[error("No audio output device available")]
    NoOutputDevice,

    #[error("Failed to query device config: {0}")]
    Config(String),

    #[error("Failed to build audio stream: {0}")]
    Build(String),

    #[error("Failed to start audio stream: {0}")]
    Play(String),

    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Device thread failed: {0}")]
    Thread(String),

    #[error("Audio device disconnected")]
    Disconnected,
}

/// Handshake or setup failure while opening a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("NO_API_KEY:gemini")]
    MissingApiKey,

    #[error("Invalid endpoint: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Handshake(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Server rejected setup: {0}")]
    Rejected(String),

    #[error("Setup timeout")]
    Timeout,

    #[error("Transport thread failed: {0}")]
    Thread(String),

    #[error("Connection cancelled")]
    Cancelled,
}

/// Mid-session network failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    Send(String),

    #[error("Read error: {0}")]
    Read(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Connection closed")]
    Closed,
}

/// Malformed inbound audio payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid base64 audio: {0}")]
    Base64(String),

    #[error("PCM16 payload has odd length {0}")]
    OddLength(usize),

    #[error("Empty audio payload")]
    Empty,
}

impl From<base64::DecodeError> for DecodeError {
    fn from(err: base64::DecodeError) -> Self {
        DecodeError::Base64(err.to_string())
    }
}

/// Anything a session can report, through `start` or through `on_error`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Session already running")]
    AlreadyRunning,

    #[error("Session stopped while connecting")]
    Cancelled,
}
