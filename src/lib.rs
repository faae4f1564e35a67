//! Voice Guide - Real-time voice pipeline for a virtual tour guide
//!
//! This library provides the client-side audio core of the guide:
//! - Microphone capture framed and streamed to a live conversational model
//! - Gapless playback scheduling shared by live audio and synthesized speech
//! - Ordered text-to-speech for streamed chat replies
//! - A shared transcript and transient user notices
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   windows    ┌────────────────┐  transcripts  ┌────────────┐
//! │  Microphone  │─────────────▶│  Live Session  │──────────────▶│ Transcript │
//! └──────────────┘              └───────┬────────┘               └─────▲──────┘
//!                                       │ audio (no origin)            │
//! ┌──────────────┐   chunks     ┌───────▼────────┐                     │
//! │ Chat Session │─────────────▶│   TTS Queue    │  audio (entry id)   │
//! └──────┬───────┘              └───────┬────────┘                     │
//!        │                              ▼                              │
//!        │                      ┌────────────────┐     speaker         │
//!        └─────────────────────▶│    Playback    │─────────────────────┘
//!          reply text            │   Scheduler    │  "now playing"
//!                               └────────────────┘
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod gemini;
pub mod live;
pub mod notice;
pub mod transcript;
pub mod voice;

pub use chat::{ChatPart, ChatSession, ChatTurn, GeminiChat, TextGenerator, TextStream};
pub use config::Config;
pub use error::{Error, Result};
pub use gemini::GeminiClient;
pub use live::{
    LiveConnector, LiveEvent, LiveSession, LiveSessionController, LiveSessionRequest,
    LiveSessionState, ServerMessage,
};
pub use notice::{NOTICE_TTL, Notice, Notices};
pub use transcript::{EntryId, Role, SharedTranscript, Transcript, TranscriptEntry};
