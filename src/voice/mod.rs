//! Voice processing module
//!
//! Handles microphone capture, PCM conversion, gapless playback scheduling
//! and ordered speech synthesis. Live session audio and TTS audio meet in
//! the [`PlaybackScheduler`].

mod capture;
mod chunker;
mod output;
mod pcm;
mod playback;
mod resample;
mod tts;

pub use capture::{
    CAPTURE_MIME, CaptureConstraints, CaptureHandle, CaptureStream, CpalMicrophone, Microphone,
    RealtimeInput, SAMPLE_RATE, WINDOW_SIZE, WindowFramer, forward_windows, window_len_for,
};
pub use chunker::{FLUSH_THRESHOLD_CHARS, SpeechChunker};
pub use output::{CpalOutput, OutputDevice};
pub use pcm::{
    AudioBuffer, decode_transport, encode_transport, pcm_bytes_to_samples, samples_to_pcm_bytes,
    samples_to_wav,
};
pub use playback::{
    AudioSegment, IDLE_TOLERANCE_SECS, LEAD_IN_SECS, PlaybackScheduler, SEGMENT_SAMPLE_RATE,
};
pub use resample::resample;
pub use tts::{GeminiSpeech, SpeechSynthesizer, TtsQueue};
