//! Seam to the streaming conversational service
//!
//! The wire protocol lives outside this crate. A connector performs the
//! handshake and then reports everything the service does as [`LiveEvent`]s
//! on the channel it was given.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::voice::RealtimeInput;

/// Parameters for opening a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSessionRequest {
    pub model: String,
    pub system_prompt: String,
    /// Ask for spoken responses
    pub response_audio: bool,
    /// Ask for transcripts of what the user says
    pub input_transcription: bool,
    /// Ask for transcripts of what the model says
    pub output_transcription: bool,
}

impl LiveSessionRequest {
    /// Audio responses with both transcriptions enabled
    #[must_use]
    pub fn voice(model: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            response_audio: true,
            input_transcription: true,
            output_transcription: true,
        }
    }
}

/// One message from the service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMessage {
    /// Fragment of the user's speech as text
    pub input_transcription: Option<String>,
    /// Fragment of the model's speech as text
    pub output_transcription: Option<String>,
    /// Base64 PCM16LE mono at 24kHz
    pub audio: Option<String>,
    pub turn_complete: bool,
}

/// Everything a live session reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Open,
    Message(ServerMessage),
    /// Remote side closed, with its reason if one was given
    Close(Option<String>),
    Error(String),
}

/// An established session
pub trait LiveSession: Send + Sync {
    /// Send one window of microphone audio; fire-and-forget
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transport`] if the session is gone
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()>;

    /// Close the session
    ///
    /// # Errors
    ///
    /// Returns error if the close could not be delivered
    fn close(&self) -> Result<()>;
}

/// Opens live sessions
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Perform the handshake; events for the session go to `events`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transport`] if the handshake fails
    async fn connect(
        &self,
        request: LiveSessionRequest,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveSession>>;
}
