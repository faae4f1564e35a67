//! Gapless playback scheduling
//!
//! Segments from the live session and from TTS share one FIFO queue and one
//! clock cursor. Each segment starts where the previous one ends, so
//! playback order is exactly enqueue order with no gaps and no overlaps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use super::output::OutputDevice;
use super::pcm::pcm_bytes_to_samples;
use crate::transcript::EntryId;

/// Rate of every segment produced by the remote services
pub const SEGMENT_SAMPLE_RATE: u32 = 24000;

/// Minimum offset ahead of the device clock when the cursor fell behind
pub const LEAD_IN_SECS: f64 = 0.05;

/// How close to the end of scheduled audio the "currently playing" marker
/// may be cleared; keeps it steady across back-to-back segments
pub const IDLE_TOLERANCE_SECS: f64 = 0.5;

/// One decodable unit of audio output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    payload: Vec<u8>,
    origin: Option<EntryId>,
}

impl AudioSegment {
    /// `payload` is PCM16LE mono at [`SEGMENT_SAMPLE_RATE`]
    #[must_use]
    pub const fn new(payload: Vec<u8>, origin: Option<EntryId>) -> Self {
        Self { payload, origin }
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Transcript entry this audio belongs to, if any
    #[must_use]
    pub const fn origin(&self) -> Option<EntryId> {
        self.origin
    }
}

struct Shared {
    device: Arc<dyn OutputDevice>,
    queue: Mutex<VecDeque<AudioSegment>>,
    /// Next start time on the device timeline
    cursor: Mutex<f64>,
    in_flight: AtomicBool,
    output_enabled: AtomicBool,
    /// Bumped on mute; completions from older epochs are ignored
    epoch: AtomicU64,
    now_playing: watch::Sender<Option<EntryId>>,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<AudioSegment>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cursor(&self) -> MutexGuard<'_, f64> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn segment_ended(&self, epoch: u64) {
        // Check and clear under the cursor lock so a segment scheduled in
        // between keeps its marker
        let cursor = self.cursor();
        if epoch != self.epoch.load(Ordering::Acquire) {
            return;
        }
        let queue_empty = self.queue().is_empty();
        if queue_empty && *cursor <= self.device.current_time() + IDLE_TOLERANCE_SECS {
            self.now_playing.send_if_modified(|current| current.take().is_some());
        }
    }
}

/// Single authority for audio output order and timing
///
/// Cloning yields another handle to the same queue and clock. Enqueueing
/// must happen inside a Tokio runtime, which watches segment completion.
#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        let (now_playing, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                device,
                queue: Mutex::new(VecDeque::new()),
                cursor: Mutex::new(0.0),
                in_flight: AtomicBool::new(false),
                output_enabled: AtomicBool::new(true),
                epoch: AtomicU64::new(0),
                now_playing,
            }),
        }
    }

    /// Append a segment and schedule whatever is queued
    pub fn enqueue(&self, segment: AudioSegment) {
        self.shared.queue().push_back(segment);
        self.run_scheduling_pass();
    }

    /// Schedule queued segments until the queue is empty
    ///
    /// A call while another pass is running returns immediately; the running
    /// pass re-checks the queue before it finishes, so nothing is stranded.
    pub fn run_scheduling_pass(&self) {
        loop {
            if !self.is_output_enabled() {
                return;
            }
            if self.shared.in_flight.swap(true, Ordering::AcqRel) {
                return;
            }

            while self.is_output_enabled() {
                let next = self.shared.queue().pop_front();
                match next {
                    Some(segment) => self.schedule(segment),
                    None => break,
                }
            }

            self.shared.in_flight.store(false, Ordering::Release);

            if self.shared.queue().is_empty() {
                return;
            }
        }
    }

    fn schedule(&self, segment: AudioSegment) {
        let buffer = match pcm_bytes_to_samples(segment.payload(), SEGMENT_SAMPLE_RATE, 1) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!(error = %e, origin = ?segment.origin(), "dropping undecodable segment");
                return;
            }
        };
        let duration = buffer.duration();
        let device = &self.shared.device;

        // Held across the device call and the marker update so a concurrent
        // mute either stops this segment or is seen before it is scheduled
        let mut cursor = self.shared.cursor();
        if !self.is_output_enabled() {
            return;
        }
        if let Err(e) = device.resume() {
            tracing::warn!(error = %e, "failed to resume audio output");
        }

        let now = device.current_time();
        let start = if *cursor < now { now + LEAD_IN_SECS } else { *cursor };

        let ended = match device.schedule(buffer, start) {
            Ok(ended) => ended,
            Err(e) => {
                tracing::warn!(error = %e, "failed to schedule segment");
                return;
            }
        };
        *cursor = start + duration;
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        self.shared.now_playing.send_replace(segment.origin());
        drop(cursor);

        tracing::debug!(start, duration, origin = ?segment.origin(), "scheduled segment");

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            // A stopped segment resolves with an error; both mean it is over
            let _ = ended.await;
            shared.segment_ended(epoch);
        });
    }

    /// Turn audio output on or off
    ///
    /// Turning it off stops what is playing, clears the queue and the
    /// "currently playing" marker. Producers keep enqueueing; their segments
    /// wait until output is turned back on.
    pub fn set_output_enabled(&self, enabled: bool) {
        if enabled {
            if !self.shared.output_enabled.swap(true, Ordering::AcqRel) {
                tracing::info!("audio output enabled");
                self.run_scheduling_pass();
            }
            return;
        }

        if !self.shared.output_enabled.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut cursor = self.shared.cursor();
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        self.shared.device.stop_all();
        let dropped = {
            let mut queue = self.shared.queue();
            let count = queue.len();
            queue.clear();
            count
        };
        *cursor = 0.0;
        self.shared.now_playing.send_replace(None);
        drop(cursor);

        tracing::info!(dropped, "audio output disabled");
    }

    #[must_use]
    pub fn is_output_enabled(&self) -> bool {
        self.shared.output_enabled.load(Ordering::Acquire)
    }

    /// Entry whose audio was most recently scheduled and is still playing
    #[must_use]
    pub fn now_playing(&self) -> Option<EntryId> {
        *self.shared.now_playing.borrow()
    }

    /// Watch the "currently playing" marker
    #[must_use]
    pub fn subscribe_now_playing(&self) -> watch::Receiver<Option<EntryId>> {
        self.shared.now_playing.subscribe()
    }

    /// Segments waiting to be scheduled
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue().len()
    }

    /// Nothing queued and all scheduled audio has played
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let queue_empty = self.shared.queue().is_empty();
        queue_empty && *self.shared.cursor() <= self.shared.device.current_time()
    }
}
