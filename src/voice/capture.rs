//! Audio capture from microphone
//!
//! The device callback only downmixes and frames samples into fixed windows;
//! encoding and the hand-off to the remote session happen on a Tokio task.

use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::pcm::{encode_transport, samples_to_pcm_bytes};
use super::resample::resample;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per emitted capture window at [`SAMPLE_RATE`]
pub const WINDOW_SIZE: usize = 4096;

/// Mime descriptor for realtime input chunks
pub const CAPTURE_MIME: &str = "audio/pcm;rate=16000";

/// Windows waiting for the worker before new ones are dropped
const WINDOW_QUEUE_DEPTH: usize = 8;

/// Requested microphone processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub noise_suppression: bool,
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
}

impl CaptureConstraints {
    /// Constraints used for the live voice session
    #[must_use]
    pub const fn speech() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
        }
    }
}

/// Splits a continuous sample stream into fixed-size windows
#[derive(Debug)]
pub struct WindowFramer {
    size: usize,
    window: Vec<f32>,
}

impl WindowFramer {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            window: Vec::with_capacity(size),
        }
    }

    /// Append samples, calling `emit` with every window that fills up
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        while !samples.is_empty() {
            let take = (self.size - self.window.len()).min(samples.len());
            self.window.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.window.len() == self.size {
                let full = std::mem::replace(&mut self.window, Vec::with_capacity(self.size));
                emit(full);
            }
        }
    }

    /// Samples buffered in the current partial window
    #[must_use]
    pub fn pending(&self) -> usize {
        self.window.len()
    }

    /// End of stream: the partial window is discarded, not flushed
    ///
    /// Returns the number of samples dropped.
    #[must_use]
    pub fn finish(self) -> usize {
        self.window.len()
    }
}

/// Window length covering the same span as [`WINDOW_SIZE`] at another rate
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn window_len_for(sample_rate: u32) -> usize {
    (WINDOW_SIZE as u64 * u64::from(sample_rate) / u64::from(SAMPLE_RATE)) as usize
}

/// One encoded capture window ready for the remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeInput {
    /// Base64 PCM16LE mono at 16kHz
    pub data: String,
    pub mime_type: String,
}

impl RealtimeInput {
    #[must_use]
    pub fn from_window(samples: &[f32]) -> Self {
        Self {
            data: encode_transport(&samples_to_pcm_bytes(samples)),
            mime_type: CAPTURE_MIME.to_string(),
        }
    }
}

/// Releases a running capture
pub trait CaptureHandle: Send {
    /// Stop the microphone tracks
    ///
    /// # Errors
    ///
    /// Returns error if the device refuses to pause
    fn stop_tracks(&mut self) -> Result<()>;

    /// Tear down the capture pipeline and its audio context
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread cannot be shut down cleanly
    fn close(&mut self) -> Result<()>;
}

/// A running microphone capture
pub struct CaptureStream {
    /// Full windows at `source_rate`
    pub windows: mpsc::Receiver<Vec<f32>>,
    /// Rate the device actually runs at
    pub source_rate: u32,
    pub handle: Box<dyn CaptureHandle>,
}

/// Source of microphone audio
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the microphone
    ///
    /// # Errors
    ///
    /// Returns [`Error::CaptureUnavailable`] if the device is denied or absent
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream>;
}

/// Encode windows as they arrive and hand each one to `send`
///
/// Windows captured at another rate are resampled to 16kHz first. Returns
/// when the capture ends.
///
/// # Errors
///
/// Returns the first error reported by `send`
pub async fn forward_windows<F>(
    mut windows: mpsc::Receiver<Vec<f32>>,
    source_rate: u32,
    mut send: F,
) -> Result<()>
where
    F: FnMut(RealtimeInput) -> Result<()> + Send,
{
    while let Some(window) = windows.recv().await {
        let samples = if source_rate == SAMPLE_RATE {
            window
        } else {
            match resample(&window, source_rate, SAMPLE_RATE) {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping capture window");
                    continue;
                }
            }
        };

        send(RealtimeInput::from_window(&samples))?;
    }

    tracing::debug!("capture window stream ended");
    Ok(())
}

enum Control {
    Pause,
    Close,
}

/// Captures audio from the default input device
///
/// cpal streams are not `Send`, so each capture owns a dedicated thread
/// that builds the stream and waits for control messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<CaptureStream> {
        let (window_tx, windows) = mpsc::channel(WINDOW_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = std::sync::mpsc::channel();
        let constraints = constraints.clone();

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || run_capture_thread(&constraints, window_tx, ready_tx, &control_rx))
            .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

        let source_rate = ready_rx
            .await
            .map_err(|_| Error::CaptureUnavailable("capture thread exited".to_string()))??;

        Ok(CaptureStream {
            windows,
            source_rate,
            handle: Box::new(CpalCaptureHandle {
                control: control_tx,
                thread: Some(thread),
            }),
        })
    }
}

struct CpalCaptureHandle {
    control: std::sync::mpsc::Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for CpalCaptureHandle {
    fn stop_tracks(&mut self) -> Result<()> {
        self.control
            .send(Control::Pause)
            .map_err(|_| Error::Audio("capture thread already stopped".to_string()))
    }

    fn close(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // The thread also exits when the sender is gone
        let _ = self.control.send(Control::Close);
        thread
            .join()
            .map_err(|_| Error::Audio("capture thread panicked".to_string()))
    }
}

impl Drop for CpalCaptureHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "capture teardown failed");
        }
    }
}

fn run_capture_thread(
    constraints: &CaptureConstraints,
    window_tx: mpsc::Sender<Vec<f32>>,
    ready_tx: oneshot::Sender<Result<u32>>,
    control_rx: &std::sync::mpsc::Receiver<Control>,
) {
    let stream = match open_input_stream(constraints, window_tx) {
        Ok((stream, rate)) => {
            let _ = ready_tx.send(Ok(rate));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(control) = control_rx.recv() {
        match control {
            Control::Pause => {
                if let Err(e) = stream.pause() {
                    tracing::warn!(error = %e, "failed to pause capture stream");
                }
            }
            Control::Close => break,
        }
    }

    drop(stream);
    tracing::debug!("audio capture stopped");
}

#[allow(clippy::cast_precision_loss)]
fn open_input_stream(
    constraints: &CaptureConstraints,
    window_tx: mpsc::Sender<Vec<f32>>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::CaptureUnavailable("no input device available".to_string()))?;

    let rate = SampleRate(constraints.sample_rate);
    let preferred = device
        .supported_input_configs()
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == constraints.channels
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
        .map(|c| c.with_sample_rate(rate));

    let supported = match preferred {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|e| Error::CaptureUnavailable(e.to_string()))?,
    };
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels.max(1));
    let source_rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = source_rate,
        channels,
        noise_suppression = constraints.noise_suppression,
        echo_cancellation = constraints.echo_cancellation,
        auto_gain_control = constraints.auto_gain_control,
        "audio capture initialized (processing flags are advisory on this host)"
    );

    let mut framer = WindowFramer::new(window_len_for(source_rate));
    let mut mono = Vec::with_capacity(framer.size);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let emit = |window: Vec<f32>| {
                    if window_tx.try_send(window).is_err() {
                        tracing::debug!("capture window dropped");
                    }
                };

                if channels == 1 {
                    framer.push(data, emit);
                } else {
                    mono.clear();
                    mono.extend(
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                    );
                    framer.push(&mono, emit);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;

    Ok((stream, source_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_full_windows_only() {
        let mut framer = WindowFramer::new(4);
        let mut windows = Vec::new();

        framer.push(&[1.0, 2.0, 3.0], |w| windows.push(w));
        assert!(windows.is_empty());
        assert_eq!(framer.pending(), 3);

        framer.push(&[4.0, 5.0, 6.0, 7.0, 8.0, 9.0], |w| windows.push(w));
        assert_eq!(
            windows,
            vec![vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]]
        );
        assert_eq!(framer.pending(), 1);
    }

    #[test]
    fn partial_window_is_dropped_at_end() {
        let mut framer = WindowFramer::new(WINDOW_SIZE);
        let mut emitted = 0;
        framer.push(&vec![0.1; WINDOW_SIZE + 100], |_| emitted += 1);

        assert_eq!(emitted, 1);
        assert_eq!(framer.finish(), 100);
    }

    #[test]
    fn window_spans_same_time_at_device_rate() {
        assert_eq!(window_len_for(16_000), 4096);
        assert_eq!(window_len_for(48_000), 12_288);
    }

    #[test]
    fn realtime_input_is_pcm16_base64() {
        let input = RealtimeInput::from_window(&[0.0; 4]);
        assert_eq!(input.mime_type, "audio/pcm;rate=16000");
        assert_eq!(input.data, "AAAAAAAAAAA=");
    }

    #[tokio::test]
    async fn forwards_windows_in_order() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![0.0; 8]).await.unwrap();
        tx.send(vec![1.0; 8]).await.unwrap();
        drop(tx);

        let mut sent = Vec::new();
        forward_windows(rx, SAMPLE_RATE, |input| {
            sent.push(input);
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], RealtimeInput::from_window(&[0.0; 8]));
        assert_eq!(sent[1], RealtimeInput::from_window(&[1.0; 8]));
    }

    #[tokio::test]
    async fn stops_on_send_failure() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(vec![0.0; 8]).await.unwrap();
        tx.send(vec![0.0; 8]).await.unwrap();

        let mut attempts = 0;
        let result = forward_windows(rx, SAMPLE_RATE, |_| {
            attempts += 1;
            Err(Error::Transport("closed".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(attempts, 1);
    }
}
