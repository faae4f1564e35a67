//! Text chat path
//!
//! Streams a reply from the text generation service into the transcript
//! and speaks it through the TTS queue as it arrives.

mod gemini;

pub use gemini::GeminiChat;

use std::pin::Pin;
use std::sync::{Arc, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::Result;
use crate::transcript::{EntryId, Role, SharedTranscript, Transcript};
use crate::voice::{SpeechChunker, TtsQueue};

/// Lazy, finite stream of reply text fragments
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One part of a chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatPart {
    Text(String),
    InlineImage { mime_type: String, data: Vec<u8> },
}

impl ChatPart {
    /// How the part reads in the transcript
    fn display(&self) -> &str {
        match self {
            Self::Text(text) => text,
            Self::InlineImage { .. } => "[image]",
        }
    }
}

/// A completed exchange turn kept as conversation history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub parts: Vec<ChatPart>,
}

/// Streaming text generation service
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Start generating a reply to `parts` given the earlier `history`
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn stream(&self, history: &[ChatTurn], parts: Vec<ChatPart>) -> Result<TextStream>;
}

/// A text conversation that speaks its replies
pub struct ChatSession {
    generator: Arc<dyn TextGenerator>,
    tts: TtsQueue,
    transcript: SharedTranscript,
    history: Vec<ChatTurn>,
}

impl ChatSession {
    #[must_use]
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        tts: TtsQueue,
        transcript: SharedTranscript,
    ) -> Self {
        Self {
            generator,
            tts,
            transcript,
            history: Vec::new(),
        }
    }

    fn transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Send a message and stream the reply
    ///
    /// Each fragment is passed to `on_fragment`, appended to the model's
    /// transcript entry and chunked for speech.
    ///
    /// # Errors
    ///
    /// Returns error if generation fails. A request that fails before the
    /// reply starts leaves the transcript untouched; text received before a
    /// later failure is still shown and spoken
    pub async fn send(
        &mut self,
        parts: Vec<ChatPart>,
        mut on_fragment: impl FnMut(&str) + Send,
    ) -> Result<String> {
        let mut stream = self.generator.stream(&self.history, parts.clone()).await?;

        let shown = parts
            .iter()
            .map(ChatPart::display)
            .collect::<Vec<_>>()
            .join(" ");
        let (user_entry, model_entry) = {
            let mut transcript = self.transcript();
            let user = transcript.push(Role::User, shown);
            let model = transcript.push(Role::Model, "");
            (user, model)
        };
        tracing::debug!(%user_entry, %model_entry, "chat reply streaming");

        let mut reply = String::new();
        let mut chunker = SpeechChunker::new();
        let mut failure = None;

        while let Some(fragment) = stream.next().await {
            match fragment {
                Ok(fragment) => {
                    on_fragment(&fragment);
                    reply.push_str(&fragment);
                    self.transcript().update(model_entry, reply.as_str());
                    if let Some(chunk) = chunker.push(&fragment) {
                        self.speak(chunk, model_entry);
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(chunk) = chunker.finish() {
            self.speak(chunk, model_entry);
        }

        if let Some(e) = failure {
            tracing::warn!(error = %e, received = reply.len(), "chat stream failed");
            return Err(e);
        }

        self.history.push(ChatTurn {
            role: Role::User,
            parts,
        });
        self.history.push(ChatTurn {
            role: Role::Model,
            parts: vec![ChatPart::Text(reply.clone())],
        });

        Ok(reply)
    }

    fn speak(&self, chunk: String, origin: EntryId) {
        self.tts.submit(chunk, origin);
    }
}
