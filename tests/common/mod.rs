//! Shared test utilities
//!
//! Doubles for the audio devices and remote services so the pipeline runs
//! without hardware or network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use voice_guide::voice::{
    AudioBuffer, AudioSegment, CaptureConstraints, CaptureHandle, CaptureStream, Microphone,
    OutputDevice, PlaybackScheduler, RealtimeInput, SAMPLE_RATE, SEGMENT_SAMPLE_RATE,
    SpeechSynthesizer, encode_transport,
};
use voice_guide::{
    Error, LiveConnector, LiveEvent, LiveSession, LiveSessionController, LiveSessionRequest,
    Notices, Result, SharedTranscript, Transcript,
};

/// Ordered record of release calls across doubles
pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn calls(log: &CallLog) -> Vec<&'static str> {
    log.lock().unwrap().clone()
}

/// Poll `check` until it holds, panicking after about two seconds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Let spawned tasks run without advancing past real work
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Silent PCM16LE payload of `samples` samples at 24kHz
pub fn pcm_payload(samples: usize) -> Vec<u8> {
    vec![0; samples * 2]
}

pub fn segment(samples: usize, origin: Option<voice_guide::EntryId>) -> AudioSegment {
    AudioSegment::new(pcm_payload(samples), origin)
}

/// Seconds covered by `samples` at the segment rate
#[allow(clippy::cast_precision_loss)]
pub fn secs(samples: usize) -> f64 {
    samples as f64 / f64::from(SEGMENT_SAMPLE_RATE)
}

/// One buffer handed to the fake device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub start: f64,
    pub duration: f64,
    pub frames: usize,
}

#[derive(Default)]
struct OutputState {
    now: f64,
    suspended: bool,
    resumes: usize,
    stops: usize,
    scheduled: Vec<Scheduled>,
    ended: Vec<Option<oneshot::Sender<()>>>,
}

/// Output device with a manual clock
pub struct FakeOutput {
    state: Mutex<OutputState>,
}

impl FakeOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OutputState {
                suspended: true,
                ..OutputState::default()
            }),
        })
    }

    pub fn set_time(&self, now: f64) {
        self.state.lock().unwrap().now = now;
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn frames(&self) -> Vec<usize> {
        self.scheduled().iter().map(|s| s.frames).collect()
    }

    pub fn resumes(&self) -> usize {
        self.state.lock().unwrap().resumes
    }

    pub fn stops(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    /// Signal that the `index`th scheduled buffer finished playing
    pub fn finish(&self, index: usize) {
        let sender = self.state.lock().unwrap().ended[index].take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn is_suspended(&self) -> bool {
        self.state.lock().unwrap().suspended
    }

    fn resume(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.suspended {
            state.suspended = false;
            state.resumes += 1;
        }
        Ok(())
    }

    fn schedule(&self, buffer: AudioBuffer, start_at: f64) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.scheduled.push(Scheduled {
            start: start_at,
            duration: buffer.duration(),
            frames: buffer.frames(),
        });
        state.ended.push(Some(tx));
        Ok(rx)
    }

    fn stop_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        for sender in &mut state.ended {
            sender.take();
        }
    }
}

/// Runs once from inside the first `schedule` call
pub type ScheduleHook = Box<dyn FnOnce(&PlaybackScheduler) + Send>;

/// Fake output that calls back into its own scheduler mid-pass
///
/// Producers on other tasks enqueue or mute while a scheduling pass is
/// talking to the device; the hook reproduces that from within the call.
pub struct HookedOutput {
    pub inner: Arc<FakeOutput>,
    scheduler: OnceLock<PlaybackScheduler>,
    hook: Mutex<Option<ScheduleHook>>,
}

impl HookedOutput {
    pub fn scheduler(hook: ScheduleHook) -> (Arc<FakeOutput>, PlaybackScheduler) {
        let inner = FakeOutput::new();
        let output = Arc::new(Self {
            inner: inner.clone(),
            scheduler: OnceLock::new(),
            hook: Mutex::new(Some(hook)),
        });
        let scheduler = PlaybackScheduler::new(output.clone());
        let _ = output.scheduler.set(scheduler.clone());
        (inner, scheduler)
    }
}

impl OutputDevice for HookedOutput {
    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    fn is_suspended(&self) -> bool {
        self.inner.is_suspended()
    }

    fn resume(&self) -> Result<()> {
        self.inner.resume()
    }

    fn schedule(&self, buffer: AudioBuffer, start_at: f64) -> Result<oneshot::Receiver<()>> {
        let ended = self.inner.schedule(buffer, start_at)?;
        let hook = self.hook.lock().unwrap().take();
        if let (Some(hook), Some(scheduler)) = (hook, self.scheduler.get()) {
            hook(scheduler);
        }
        Ok(ended)
    }

    fn stop_all(&self) {
        self.inner.stop_all();
    }
}

/// Synthesizer whose calls complete when the test says so
///
/// Each text gets a gate; the call waits until the gate is resolved. Texts
/// without a gate fail.
#[derive(Default)]
pub struct GatedSynthesizer {
    gates: Mutex<HashMap<String, oneshot::Receiver<Result<String>>>>,
}

impl GatedSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gate(&self, text: &str) -> oneshot::Sender<Result<String>> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(text.to_string(), rx);
        tx
    }
}

#[async_trait]
impl SpeechSynthesizer for GatedSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<String> {
        let gate = self.gates.lock().unwrap().remove(text);
        match gate {
            Some(gate) => gate
                .await
                .map_err(|_| Error::Synthesis("gate dropped".to_string()))?,
            None => Err(Error::Synthesis(format!("no gate for {text:?}"))),
        }
    }
}

/// Synthesizer that answers at once with one sample per text byte
///
/// Texts starting with "fail" are rejected.
#[derive(Default)]
pub struct EchoSynthesizer {
    texts: Mutex<Vec<String>>,
}

impl EchoSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<String> {
        self.texts.lock().unwrap().push(text.to_string());
        if text.starts_with("fail") {
            return Err(Error::Synthesis("rejected".to_string()));
        }
        Ok(encode_transport(&pcm_payload(text.len())))
    }
}

struct FakeCaptureHandle {
    log: CallLog,
}

impl CaptureHandle for FakeCaptureHandle {
    fn stop_tracks(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("stop_tracks");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("capture_close");
        Err(Error::Audio("context already closed".to_string()))
    }
}

/// Microphone that is either denied or yields test-fed windows
pub struct FakeMicrophone {
    deny: bool,
    opened: AtomicUsize,
    log: CallLog,
    windows: Mutex<Option<mpsc::Sender<Vec<f32>>>>,
}

impl FakeMicrophone {
    pub fn granted(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            opened: AtomicUsize::new(0),
            log: Arc::clone(log),
            windows: Mutex::new(None),
        })
    }

    pub fn denied(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            opened: AtomicUsize::new(0),
            log: Arc::clone(log),
            windows: Mutex::new(None),
        })
    }

    /// Capture contexts opened so far
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Feed one full window into the running capture
    pub fn push_window(&self, window: Vec<f32>) {
        let tx = self.windows.lock().unwrap().clone();
        tx.expect("microphone not acquired").try_send(window).unwrap();
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&self, _constraints: &CaptureConstraints) -> Result<CaptureStream> {
        if self.deny {
            return Err(Error::CaptureUnavailable("permission denied".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, windows) = mpsc::channel(8);
        *self.windows.lock().unwrap() = Some(tx);
        Ok(CaptureStream {
            windows,
            source_rate: SAMPLE_RATE,
            handle: Box::new(FakeCaptureHandle {
                log: Arc::clone(&self.log),
            }),
        })
    }
}

/// Remote session that records what it is sent
pub struct FakeLiveSession {
    log: CallLog,
    sent: Mutex<Vec<RealtimeInput>>,
    closed: AtomicBool,
    reject_sends: AtomicBool,
}

impl FakeLiveSession {
    pub fn sent(&self) -> Vec<RealtimeInput> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reject_sends(&self) {
        self.reject_sends.store(true, Ordering::SeqCst);
    }
}

impl LiveSession for FakeLiveSession {
    fn send_realtime_input(&self, input: RealtimeInput) -> Result<()> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("socket closed".to_string()));
        }
        self.sent.lock().unwrap().push(input);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.log.lock().unwrap().push("remote_close");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector with a scripted handshake
pub struct ScriptedConnector {
    session: Arc<FakeLiveSession>,
    refuse: Option<String>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    events: Mutex<Option<mpsc::UnboundedSender<LiveEvent>>>,
    requests: Mutex<Vec<LiveSessionRequest>>,
}

impl ScriptedConnector {
    fn build(log: &CallLog, refuse: Option<String>, gate: Option<oneshot::Receiver<()>>) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::new(FakeLiveSession {
                log: Arc::clone(log),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                reject_sends: AtomicBool::new(false),
            }),
            refuse,
            gate: Mutex::new(gate),
            events: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Handshake succeeds immediately
    pub fn accepting(log: &CallLog) -> Arc<Self> {
        Self::build(log, None, None)
    }

    /// Handshake fails with `reason`
    pub fn refusing(log: &CallLog, reason: &str) -> Arc<Self> {
        Self::build(log, Some(reason.to_string()), None)
    }

    /// Handshake completes once the returned sender fires
    pub fn gated(log: &CallLog) -> (Arc<Self>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::build(log, None, Some(rx)), tx)
    }

    pub fn session(&self) -> Arc<FakeLiveSession> {
        Arc::clone(&self.session)
    }

    pub fn requests(&self) -> Vec<LiveSessionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Deliver an event as the remote service would
    pub fn emit(&self, event: LiveEvent) {
        let events = self.events.lock().unwrap().clone();
        events.expect("not connected").send(event).unwrap();
    }

    /// Drop the event channel as a vanished service would
    pub fn hang_up(&self) {
        self.events.lock().unwrap().take();
    }
}

#[async_trait]
impl LiveConnector for ScriptedConnector {
    async fn connect(
        &self,
        request: LiveSessionRequest,
        events: mpsc::UnboundedSender<LiveEvent>,
    ) -> Result<Arc<dyn LiveSession>> {
        self.requests.lock().unwrap().push(request);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if let Some(reason) = &self.refuse {
            return Err(Error::Transport(reason.clone()));
        }
        *self.events.lock().unwrap() = Some(events);
        Ok(self.session())
    }
}

/// A controller wired to fakes
pub struct LiveHarness {
    pub controller: LiveSessionController,
    pub output: Arc<FakeOutput>,
    pub scheduler: PlaybackScheduler,
    pub notices: Notices,
    pub transcript: SharedTranscript,
}

pub fn live_harness(microphone: Arc<FakeMicrophone>, connector: Arc<ScriptedConnector>) -> LiveHarness {
    let output = FakeOutput::new();
    let scheduler = PlaybackScheduler::new(output.clone());
    let notices = Notices::new();
    let transcript = Transcript::shared();
    let controller = LiveSessionController::new(
        microphone,
        connector,
        scheduler.clone(),
        notices.clone(),
        Arc::clone(&transcript),
        LiveSessionRequest::voice("live-test", "You are a tour guide."),
    );
    LiveHarness {
        controller,
        output,
        scheduler,
        notices,
        transcript,
    }
}
