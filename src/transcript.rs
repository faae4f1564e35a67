//! Conversation transcript
//!
//! Entries are addressed by [`EntryId`], never by position, so concurrent
//! updates from the live session and the chat path cannot land on the
//! wrong message. An `EntryId` is also the origin reference carried by
//! TTS audio segments for "currently speaking" highlighting.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Suffix shown on user text that is still being transcribed
pub const IN_PROGRESS_SUFFIX: &str = "...";

/// Stable handle to one transcript entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who produced an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// One message in the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub role: Role,
    pub text: String,
}

/// Ordered list of conversation entries
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    next_id: u64,
}

/// Transcript shared between the live session, the chat path and the UI
pub type SharedTranscript = Arc<Mutex<Transcript>>;

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a new transcript for sharing
    #[must_use]
    pub fn shared() -> SharedTranscript {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Append an entry and return its id
    pub fn push(&mut self, role: Role, text: impl Into<String>) -> EntryId {
        self.next_id += 1;
        let id = EntryId(self.next_id);
        self.entries.push(TranscriptEntry {
            id,
            role,
            text: text.into(),
        });
        id
    }

    /// Replace the text of an entry; returns false if the id is unknown
    pub fn update(&mut self, id: EntryId, text: impl Into<String>) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.text = text.into();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    #[must_use]
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Display form of a user utterance that is still arriving
#[must_use]
pub fn in_progress(text: &str) -> String {
    format!("{text}{IN_PROGRESS_SUFFIX}")
}

/// Final text of a user utterance at the end of a turn
///
/// The accumulated buffer wins; the displayed text is only used, minus its
/// in-progress suffix, when nothing was buffered.
#[must_use]
pub fn finalize_user_text(displayed: &str, buffer: &str) -> String {
    let buffered = buffer.trim();
    if !buffered.is_empty() {
        return buffered
            .strip_suffix(IN_PROGRESS_SUFFIX)
            .unwrap_or(buffered)
            .trim_end()
            .to_string();
    }
    displayed
        .strip_suffix(IN_PROGRESS_SUFFIX)
        .unwrap_or(displayed)
        .trim()
        .to_string()
}
