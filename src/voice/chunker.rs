//! Split streamed model text into speakable chunks

/// A chunk is flushed once it grows past this many characters
pub const FLUSH_THRESHOLD_CHARS: usize = 10;

/// Characters that end a sentence and force a flush
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '…', '。', '！', '？', '\n'];

/// Accumulates text fragments until they are worth synthesizing
#[derive(Debug, Default)]
pub struct SpeechChunker {
    buffer: String,
}

impl SpeechChunker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment; returns the accumulated text when it crosses the
    /// flush threshold
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.buffer.push_str(fragment);

        let long_enough = self.buffer.chars().count() > FLUSH_THRESHOLD_CHARS;
        let sentence_end = fragment.contains(SENTENCE_ENDINGS);
        if long_enough || sentence_end {
            self.take()
        } else {
            None
        }
    }

    /// End of stream: return whatever is left
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    /// Text waiting for the next flush
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn take(&mut self) -> Option<String> {
        let text = std::mem::take(&mut self.buffer);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}
