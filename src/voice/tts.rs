//! Text-to-speech (TTS) request queue
//!
//! Synthesis calls run concurrently and finish in any order. The queue
//! hands their audio to the scheduler strictly in submission order, so
//! speech follows the original text order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::pcm::decode_transport;
use super::playback::{AudioSegment, PlaybackScheduler};
use crate::gemini::{
    Content, GeminiClient, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    PrebuiltVoiceConfig, SpeechConfig, VoiceConfig,
};
use crate::transcript::EntryId;
use crate::{Error, Result};

/// Speech synthesis service
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize text to base64 PCM16LE mono at 24kHz
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    async fn synthesize(&self, text: &str) -> Result<String>;
}

/// A synthesis request waiting its turn
struct TtsJob {
    pending: JoinHandle<Result<String>>,
    origin: EntryId,
}

struct Shared {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    scheduler: PlaybackScheduler,
    jobs: Mutex<VecDeque<TtsJob>>,
    draining: AtomicBool,
    /// Bumped by `cancel_pending`; a result awaited across it is discarded
    epoch: AtomicU64,
}

impl Shared {
    fn jobs(&self) -> MutexGuard<'_, VecDeque<TtsJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain(self: Arc<Self>) {
        loop {
            loop {
                let job = self.jobs().pop_front();
                let Some(job) = job else {
                    break;
                };
                let epoch = self.epoch.load(Ordering::Acquire);
                let origin = job.origin;
                let result = job.pending.await;

                if epoch != self.epoch.load(Ordering::Acquire) {
                    tracing::debug!(%origin, "discarding cancelled speech");
                    continue;
                }

                match result {
                    Ok(Ok(encoded)) => match segment_from(&encoded, origin) {
                        Ok(segment) => self.scheduler.enqueue(segment),
                        Err(e) => tracing::warn!(error = %e, %origin, "dropping speech chunk"),
                    },
                    Ok(Err(e)) => tracing::warn!(error = %e, %origin, "speech synthesis failed"),
                    Err(e) if e.is_cancelled() => tracing::debug!(%origin, "speech synthesis cancelled"),
                    Err(e) => tracing::warn!(error = %e, %origin, "speech synthesis task failed"),
                }
            }

            self.draining.store(false, Ordering::Release);
            // A submit may have slipped in after the last pop
            if self.jobs().is_empty() || self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

fn segment_from(encoded: &str, origin: EntryId) -> Result<AudioSegment> {
    if encoded.trim().is_empty() {
        return Err(Error::Synthesis("empty audio payload".to_string()));
    }
    Ok(AudioSegment::new(decode_transport(encoded)?, Some(origin)))
}

/// Ordered queue of speech synthesis jobs feeding the playback scheduler
#[derive(Clone)]
pub struct TtsQueue {
    shared: Arc<Shared>,
}

impl TtsQueue {
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, scheduler: PlaybackScheduler) -> Self {
        Self {
            shared: Arc::new(Shared {
                synthesizer,
                scheduler,
                jobs: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Start synthesizing `text` and queue its audio behind earlier jobs
    ///
    /// Must be called inside a Tokio runtime.
    pub fn submit(&self, text: impl Into<String>, origin: EntryId) {
        let text = text.into();
        tracing::debug!(%origin, chars = text.chars().count(), "queueing speech");

        let synthesizer = Arc::clone(&self.shared.synthesizer);
        let pending = tokio::spawn(async move { synthesizer.synthesize(&text).await });
        self.shared.jobs().push_back(TtsJob { pending, origin });

        if !self.shared.draining.swap(true, Ordering::AcqRel) {
            tokio::spawn(Arc::clone(&self.shared).drain());
        }
    }

    /// Abort queued synthesis and discard the result currently awaited
    pub fn cancel_pending(&self) {
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        let jobs: Vec<TtsJob> = self.shared.jobs().drain(..).collect();
        for job in &jobs {
            job.pending.abort();
        }
        if !jobs.is_empty() {
            tracing::debug!(count = jobs.len(), "cancelled pending speech");
        }
    }

    /// Jobs not yet handed to the scheduler
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.jobs().len()
    }

    /// No jobs queued and no drain loop running
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let jobs_empty = self.shared.jobs().is_empty();
        jobs_empty && !self.shared.draining.load(Ordering::Acquire)
    }
}

/// Synthesizes speech with Gemini's audio output
pub struct GeminiSpeech {
    client: GeminiClient,
    model: String,
    voice: String,
}

impl GeminiSpeech {
    #[must_use]
    pub const fn new(client: GeminiClient, model: String, voice: String) -> Self {
        Self {
            client,
            model,
            voice,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiSpeech {
    async fn synthesize(&self, text: &str) -> Result<String> {
        let request = GenerateContentRequest {
            contents: vec![Content::text(Some("user"), text)],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                }),
            }),
        };

        let response = self
            .client
            .post(&self.model, "generateContent")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!("Gemini TTS error {status}: {body}")));
        }

        let result: GenerateContentResponse = response.json().await?;
        result
            .audio()
            .map(ToString::to_string)
            .ok_or_else(|| Error::Synthesis("response carried no audio".to_string()))
    }
}
