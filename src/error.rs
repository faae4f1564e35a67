//! Error types for the voice guide pipeline

use thiserror::Error;

/// Result type alias for voice guide operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice guide pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone denied, absent, or failed to start
    #[error("microphone unavailable: {0}")]
    CaptureUnavailable(String),

    /// Malformed PCM or transport-encoded payload
    #[error("decode error: {0}")]
    Decode(String),

    /// Speech synthesis call failed or returned no audio
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Remote streaming session dropped or refused the handshake
    #[error("transport error: {0}")]
    Transport(String),

    /// Text generation error
    #[error("generation error: {0}")]
    Generation(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Voice session lifecycle error
    #[error("voice error: {0}")]
    Voice(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error should be shown to the user as a transient notice
    ///
    /// Only microphone acquisition and transport failures reach the user;
    /// everything else is contained where it happens.
    #[must_use]
    pub const fn is_user_visible(&self) -> bool {
        matches!(self, Self::CaptureUnavailable(_) | Self::Transport(_))
    }
}
