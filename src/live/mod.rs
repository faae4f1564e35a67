//! Live voice session
//!
//! Owns one bidirectional voice conversation at a time: microphone capture
//! streamed to the remote service, transcripts flowing into the shared
//! transcript, and response audio flowing into the playback scheduler.
//!
//! ```text
//! Idle ──start──▶ Connecting ──handshake──▶ Active
//!   ▲                 │                        │
//!   └──── Closing ◀───┴──── stop / failure ────┘
//! ```

mod transport;

pub use transport::{LiveConnector, LiveEvent, LiveSession, LiveSessionRequest, ServerMessage};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::notice::Notices;
use crate::transcript::{EntryId, Role, SharedTranscript, Transcript, finalize_user_text, in_progress};
use crate::voice::{
    AudioSegment, CaptureConstraints, CaptureHandle, CaptureStream, Microphone, PlaybackScheduler,
    decode_transport, forward_windows,
};
use crate::{Error, Result};

/// Lifecycle state of the live session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LiveSessionState {
    #[default]
    Idle,
    Connecting,
    Active,
    Closing,
}

impl fmt::Display for LiveSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Everything a running session holds that must be released
#[derive(Default)]
struct Resources {
    remote: Option<Arc<dyn LiveSession>>,
    capture: Option<Box<dyn CaptureHandle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Resources {
    /// Release in order: remote session, microphone tracks, capture
    /// pipeline, then background tasks. Never fails.
    fn release(mut self) {
        if let Some(remote) = self.remote.take()
            && let Err(e) = remote.close()
        {
            tracing::warn!(error = %e, "failed to close live session");
        }

        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.stop_tracks() {
                tracing::warn!(error = %e, "failed to stop microphone tracks");
            }
            if let Err(e) = capture.close() {
                tracing::warn!(error = %e, "failed to close capture pipeline");
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Transcript accumulation for the current turn
#[derive(Debug, Default)]
struct Turn {
    user_text: String,
    user_entry: Option<EntryId>,
    model_text: String,
    model_entry: Option<EntryId>,
}

#[derive(Default)]
struct Session {
    state: LiveSessionState,
    /// Bumped on every start; work tagged with an older value is stale
    generation: u64,
    resources: Option<Resources>,
    turn: Turn,
}

impl Session {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
            && matches!(
                self.state,
                LiveSessionState::Connecting | LiveSessionState::Active
            )
    }
}

struct Inner {
    microphone: Arc<dyn Microphone>,
    connector: Arc<dyn LiveConnector>,
    scheduler: PlaybackScheduler,
    notices: Notices,
    transcript: SharedTranscript,
    request: LiveSessionRequest,
    session: Mutex<Session>,
}

/// Drives the live voice session state machine
#[derive(Clone)]
pub struct LiveSessionController {
    inner: Arc<Inner>,
}

impl LiveSessionController {
    #[must_use]
    pub fn new(
        microphone: Arc<dyn Microphone>,
        connector: Arc<dyn LiveConnector>,
        scheduler: PlaybackScheduler,
        notices: Notices,
        transcript: SharedTranscript,
        request: LiveSessionRequest,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                microphone,
                connector,
                scheduler,
                notices,
                transcript,
                request,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn transcript_mut(&self) -> MutexGuard<'_, Transcript> {
        self.inner
            .transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> LiveSessionState {
        self.session().state
    }

    #[must_use]
    pub fn transcript(&self) -> SharedTranscript {
        Arc::clone(&self.inner.transcript)
    }

    /// Acquire the microphone, open the remote session and start streaming
    ///
    /// Returns `Ok` without starting anything if [`stop`](Self::stop) ran
    /// while the handshake was in flight.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Voice`] if a session is already running,
    /// [`Error::CaptureUnavailable`] if the microphone is denied and
    /// [`Error::Transport`] if the handshake fails
    pub async fn start(&self) -> Result<()> {
        let generation = {
            let mut session = self.session();
            if session.state != LiveSessionState::Idle {
                return Err(Error::Voice(format!(
                    "session already running ({})",
                    session.state
                )));
            }
            session.state = LiveSessionState::Connecting;
            session.generation += 1;
            session.turn = Turn::default();
            session.generation
        };
        tracing::info!(generation, "starting live session");

        let constraints = CaptureConstraints::speech();
        let CaptureStream {
            mut windows,
            source_rate,
            mut handle,
        } = match self.inner.microphone.acquire(&constraints).await {
            Ok(capture) => capture,
            Err(e) => {
                self.fail(generation, &e);
                return Err(e);
            }
        };

        {
            let mut session = self.session();
            if !session.is_current(generation) {
                drop(session);
                tracing::info!(generation, "session stopped while acquiring microphone");
                if let Err(e) = handle.stop_tracks() {
                    tracing::warn!(error = %e, "failed to stop microphone tracks");
                }
                if let Err(e) = handle.close() {
                    tracing::warn!(error = %e, "failed to close capture pipeline");
                }
                return Ok(());
            }
            session.resources = Some(Resources {
                capture: Some(handle),
                ..Resources::default()
            });
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let remote = match self
            .inner
            .connector
            .connect(self.inner.request.clone(), events_tx)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                let e = into_transport(e);
                self.fail(generation, &e);
                return Err(e);
            }
        };

        let mut session = self.session();
        if !session.is_current(generation) {
            drop(session);
            tracing::info!(generation, "session stopped during handshake, closing late session");
            if let Err(e) = remote.close() {
                tracing::warn!(error = %e, "failed to close late session");
            }
            return Ok(());
        }

        let mut stale = 0usize;
        while windows.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(stale, "discarded windows captured during handshake");
        }

        let forward = {
            let controller = self.clone();
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                let sent =
                    forward_windows(windows, source_rate, |input| remote.send_realtime_input(input))
                        .await;
                if let Err(e) = sent {
                    controller.fail(generation, &into_transport(e));
                }
            })
        };

        let pump = {
            let controller = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    if !controller.handle_event(generation, event) {
                        return;
                    }
                }
                controller.transport_failed(generation, "event stream ended");
            })
        };

        session.state = LiveSessionState::Active;
        let resources = session.resources.get_or_insert_with(Resources::default);
        resources.remote = Some(remote);
        resources.tasks.extend([forward, pump]);
        drop(session);

        tracing::info!(generation, "live session active");
        Ok(())
    }

    /// Stop the session and release everything it holds
    ///
    /// Safe to call in any state. Release failures are logged.
    pub fn stop(&self) {
        let resources = {
            let mut session = self.session();
            if !matches!(
                session.state,
                LiveSessionState::Connecting | LiveSessionState::Active
            ) {
                return;
            }
            session.state = LiveSessionState::Closing;
            session.resources.take()
        };

        tracing::info!("stopping live session");
        if let Some(resources) = resources {
            resources.release();
        }
        self.finish_closing();
    }

    fn finish_closing(&self) {
        let mut session = self.session();
        session.state = LiveSessionState::Idle;
        session.turn = Turn::default();
    }

    /// Tear down after an unrecoverable error and tell the user
    fn fail(&self, generation: u64, error: &Error) {
        let resources = {
            let mut session = self.session();
            if !session.is_current(generation) {
                tracing::debug!(generation, error = %error, "ignoring failure of stopped session");
                return;
            }
            session.state = LiveSessionState::Closing;
            session.resources.take()
        };

        tracing::warn!(generation, error = %error, "live session failed");
        if let Some(resources) = resources {
            resources.release();
        }
        self.finish_closing();
        self.inner.notices.show(error.to_string());
    }

    fn transport_failed(&self, generation: u64, reason: &str) {
        self.fail(generation, &Error::Transport(reason.to_string()));
    }

    /// Apply one remote event; returns false once the session is over
    fn handle_event(&self, generation: u64, event: LiveEvent) -> bool {
        match event {
            LiveEvent::Open => {
                tracing::debug!(generation, "live session opened");
                true
            }
            LiveEvent::Message(message) => {
                self.apply_message(generation, message);
                true
            }
            LiveEvent::Close(reason) => {
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                self.transport_failed(generation, &format!("session closed: {reason}"));
                false
            }
            LiveEvent::Error(message) => {
                self.transport_failed(generation, &message);
                false
            }
        }
    }

    fn apply_message(&self, generation: u64, message: ServerMessage) {
        let segment = message.audio.as_deref().and_then(|audio| match decode_transport(audio) {
            Ok(payload) => Some(AudioSegment::new(payload, None)),
            Err(e) => {
                tracing::warn!(error = %e, "dropping live audio chunk");
                None
            }
        });

        let mut session = self.session();
        if !session.is_current(generation) {
            tracing::trace!(generation, "dropping message for stopped session");
            return;
        }

        // Enqueue under the session lock; a stop must not land between the
        // generation check and playback
        if let Some(segment) = segment {
            self.inner.scheduler.enqueue(segment);
        }

        let turn = &mut session.turn;
        let mut transcript = self.transcript_mut();

        if let Some(fragment) = message.input_transcription.as_deref() {
            turn.user_text.push_str(fragment);
            let shown = in_progress(&turn.user_text);
            upsert(&mut transcript, &mut turn.user_entry, Role::User, shown);
        }

        if let Some(fragment) = message.output_transcription.as_deref() {
            turn.model_text.push_str(fragment);
            let shown = turn.model_text.clone();
            upsert(&mut transcript, &mut turn.model_entry, Role::Model, shown);
        }

        if message.turn_complete {
            if let Some(id) = turn.user_entry {
                let displayed = transcript.get(id).map(|e| e.text.clone()).unwrap_or_default();
                transcript.update(id, finalize_user_text(&displayed, &turn.user_text));
            }
            tracing::debug!(generation, "turn complete");
            *turn = Turn::default();
        }
    }
}

/// Failures of the remote exchange all surface as transport errors
fn into_transport(error: Error) -> Error {
    match error {
        Error::Transport(_) => error,
        other => Error::Transport(other.to_string()),
    }
}

fn upsert(transcript: &mut Transcript, entry: &mut Option<EntryId>, role: Role, text: String) {
    match *entry {
        Some(id) => {
            transcript.update(id, text);
        }
        None => *entry = Some(transcript.push(role, text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::{AudioBuffer, OutputDevice, encode_transport};
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    /// Collaborators the message path never reaches
    struct Offline;

    #[async_trait]
    impl Microphone for Offline {
        async fn acquire(&self, _: &CaptureConstraints) -> Result<CaptureStream> {
            Err(Error::CaptureUnavailable("offline".to_string()))
        }
    }

    #[async_trait]
    impl LiveConnector for Offline {
        async fn connect(
            &self,
            _: LiveSessionRequest,
            _: mpsc::UnboundedSender<LiveEvent>,
        ) -> Result<Arc<dyn LiveSession>> {
            Err(Error::Transport("offline".to_string()))
        }
    }

    impl OutputDevice for Offline {
        fn current_time(&self) -> f64 {
            0.0
        }

        fn is_suspended(&self) -> bool {
            true
        }

        fn resume(&self) -> Result<()> {
            Ok(())
        }

        fn schedule(&self, _: AudioBuffer, _: f64) -> Result<oneshot::Receiver<()>> {
            Ok(oneshot::channel().1)
        }

        fn stop_all(&self) {}
    }

    fn muted_controller() -> (LiveSessionController, PlaybackScheduler) {
        let scheduler = PlaybackScheduler::new(Arc::new(Offline));
        scheduler.set_output_enabled(false);
        let controller = LiveSessionController::new(
            Arc::new(Offline),
            Arc::new(Offline),
            scheduler.clone(),
            Notices::new(),
            Transcript::shared(),
            LiveSessionRequest::voice("model", "prompt"),
        );
        (controller, scheduler)
    }

    fn audio_message() -> ServerMessage {
        ServerMessage {
            audio: Some(encode_transport(&[0; 480])),
            input_transcription: Some("xin".to_string()),
            ..ServerMessage::default()
        }
    }

    #[test]
    fn stale_generation_audio_never_reaches_scheduler() {
        let (controller, scheduler) = muted_controller();
        {
            let mut session = controller.session();
            session.state = LiveSessionState::Active;
            session.generation = 2;
        }

        controller.apply_message(1, audio_message());
        assert_eq!(scheduler.queued(), 0);
        assert!(controller.transcript().lock().unwrap().is_empty());

        controller.apply_message(2, audio_message());
        assert_eq!(scheduler.queued(), 1);

        controller.session().state = LiveSessionState::Closing;
        controller.apply_message(2, audio_message());
        assert_eq!(scheduler.queued(), 1);
    }

    #[test]
    fn only_connecting_and_active_are_current() {
        let mut session = Session {
            generation: 3,
            ..Session::default()
        };
        assert!(!session.is_current(3));

        session.state = LiveSessionState::Active;
        assert!(session.is_current(3));
        assert!(!session.is_current(2));

        session.state = LiveSessionState::Closing;
        assert!(!session.is_current(3));
    }

    #[test]
    fn upsert_creates_then_updates() {
        let mut transcript = Transcript::new();
        let mut entry = None;

        upsert(&mut transcript, &mut entry, Role::Model, "Xin".to_string());
        upsert(&mut transcript, &mut entry, Role::Model, "Xin chào".to_string());

        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.get(entry.unwrap()).unwrap().text, "Xin chào");
    }
}
