//! Audio output device
//!
//! The scheduler talks to [`OutputDevice`]: a clock, a resume switch and
//! schedule-at-time playback. [`CpalOutput`] implements it with a mixer
//! timeline that the cpal callback renders frame by frame.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::oneshot;

use super::pcm::AudioBuffer;
use super::resample::resample;
use crate::{Error, Result};

/// Preferred device rate (matches live and TTS audio)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Output device with a schedulable timeline
pub trait OutputDevice: Send + Sync {
    /// Current position of the device clock, in seconds
    fn current_time(&self) -> f64;

    /// Whether the clock is frozen
    fn is_suspended(&self) -> bool;

    /// Start the clock if it is suspended
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be resumed
    fn resume(&self) -> Result<()>;

    /// Play `buffer` when the clock reaches `start_at`
    ///
    /// The returned receiver resolves when the buffer finishes; it errors if
    /// the buffer is stopped first.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer cannot be prepared for the device
    fn schedule(&self, buffer: AudioBuffer, start_at: f64) -> Result<oneshot::Receiver<()>>;

    /// Stop everything that is playing or scheduled
    fn stop_all(&self);
}

struct Voice {
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
    ended: Option<oneshot::Sender<()>>,
}

/// Mixer state shared with the device callback
#[derive(Default)]
struct Timeline {
    frame: u64,
    suspended: bool,
    voices: Vec<Voice>,
}

impl Timeline {
    fn render(&mut self, out: &mut [f32], channels: usize) {
        for frame in out.chunks_mut(channels.max(1)) {
            if self.suspended {
                frame.fill(0.0);
                continue;
            }

            let mut mixed = 0.0;
            for voice in &mut self.voices {
                if voice.start_frame <= self.frame && voice.position < voice.samples.len() {
                    mixed += voice.samples[voice.position];
                    voice.position += 1;
                }
            }
            frame.fill(mixed.clamp(-1.0, 1.0));
            self.frame += 1;
        }

        self.voices.retain_mut(|voice| {
            if voice.position < voice.samples.len() {
                return true;
            }
            if let Some(ended) = voice.ended.take() {
                let _ = ended.send(());
            }
            false
        });
    }
}

/// Plays audio to the default output device
pub struct CpalOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device
    ///
    /// The clock starts suspended and only runs after [`OutputDevice::resume`].
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open() -> Result<Self> {
        let timeline = Arc::new(Mutex::new(Timeline {
            suspended: true,
            ..Timeline::default()
        }));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let shared = Arc::clone(&timeline);
        let thread = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || match open_output_stream(shared) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    tracing::debug!("audio output closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| Error::Audio("output thread exited".to_string()))??;

        Ok(Self {
            timeline,
            sample_rate,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Rate the device runs at
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Freeze the clock
    pub fn suspend(&self) {
        self.lock().suspended = true;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl OutputDevice for CpalOutput {
    #[allow(clippy::cast_precision_loss)]
    fn current_time(&self) -> f64 {
        self.lock().frame as f64 / f64::from(self.sample_rate)
    }

    fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    fn resume(&self) -> Result<()> {
        let mut timeline = self.lock();
        if timeline.suspended {
            timeline.suspended = false;
            tracing::debug!("audio output resumed");
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn schedule(&self, buffer: AudioBuffer, start_at: f64) -> Result<oneshot::Receiver<()>> {
        let source_rate = buffer.sample_rate();
        let mono = buffer.into_mono();
        let samples = resample(&mono, source_rate, self.sample_rate)?;

        let (ended, rx) = oneshot::channel();
        let start_frame = (start_at.max(0.0) * f64::from(self.sample_rate)).round() as u64;
        self.lock().voices.push(Voice {
            start_frame,
            samples,
            position: 0,
            ended: Some(ended),
        });
        Ok(rx)
    }

    fn stop_all(&self) {
        let stopped = {
            let mut timeline = self.lock();
            std::mem::take(&mut timeline.voices)
        };
        if !stopped.is_empty() {
            tracing::debug!(count = stopped.len(), "stopped scheduled audio");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_output_stream(timeline: Arc<Mutex<Timeline>>) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let rate = SampleRate(PLAYBACK_SAMPLE_RATE);
    let supports = |channels: u16| {
        move |c: &cpal::SupportedStreamConfigRange| {
            c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        }
    };

    let preferred = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(supports(1))
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(supports(2))
        })
        .map(|c| c.with_sample_rate(rate));

    let supported = match preferred {
        Some(config) => config,
        None => device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?,
    };
    let config: StreamConfig = supported.config();
    let channels = usize::from(config.channels);
    let sample_rate = config.sample_rate.0;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                timeline
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .render(data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    Ok((stream, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(start_frame: u64, samples: Vec<f32>) -> (Voice, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let voice = Voice {
            start_frame,
            samples,
            position: 0,
            ended: Some(tx),
        };
        (voice, rx)
    }

    #[test]
    fn plays_voices_at_their_start_frame() {
        let mut timeline = Timeline::default();
        let (first, _) = voice(0, vec![0.1, 0.1]);
        let (second, _) = voice(2, vec![0.2, 0.2]);
        timeline.voices.extend([first, second]);

        let mut out = [0.0; 5];
        timeline.render(&mut out, 1);

        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.0]);
        assert_eq!(timeline.frame, 5);
        assert!(timeline.voices.is_empty());
    }

    #[test]
    fn suspended_clock_does_not_advance() {
        let mut timeline = Timeline {
            suspended: true,
            ..Timeline::default()
        };
        let (v, _) = voice(0, vec![0.5]);
        timeline.voices.push(v);

        let mut out = [1.0; 4];
        timeline.render(&mut out, 2);

        assert_eq!(out, [0.0; 4]);
        assert_eq!(timeline.frame, 0);
        assert_eq!(timeline.voices.len(), 1);
    }

    #[test]
    fn signals_end_of_voice() {
        let mut timeline = Timeline::default();
        let (v, mut ended) = voice(1, vec![0.3]);
        timeline.voices.push(v);

        let mut out = [0.0; 1];
        timeline.render(&mut out, 1);
        assert!(ended.try_recv().is_err());

        timeline.render(&mut out, 1);
        assert!(ended.try_recv().is_ok());
    }

    #[test]
    fn duplicates_samples_across_channels() {
        let mut timeline = Timeline::default();
        let (v, _) = voice(0, vec![0.25]);
        timeline.voices.push(v);

        let mut out = [0.0; 2];
        timeline.render(&mut out, 2);
        assert_eq!(out, [0.25, 0.25]);
    }
}
