//! PCM16 codec and transport encoding
//!
//! The remote services exchange little-endian signed 16-bit PCM wrapped in
//! base64. Everything inside the pipeline works on normalized `f32` samples.

use base64::Engine as _;

use crate::{Error, Result};

/// A playable, de-interleaved audio buffer
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from per-channel sample arrays
    ///
    /// # Errors
    ///
    /// Returns error if there are no channels, the rate is zero, or the
    /// channels differ in length
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 || channels.is_empty() {
            return Err(Error::Decode("buffer needs a sample rate and a channel".to_string()));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(Error::Decode("channel lengths differ".to_string()));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Single-channel buffer
    #[must_use]
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: vec![samples],
        }
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Number of sample frames
    #[must_use]
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Exact duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> f64 {
        self.frames() as f64 / f64::from(self.sample_rate)
    }

    /// Average all channels into one
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn into_mono(self) -> Vec<f32> {
        if self.channels.len() == 1 {
            return self.channels.into_iter().next().unwrap_or_default();
        }
        let count = self.channels.len() as f32;
        (0..self.frames())
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / count)
            .collect()
    }
}

/// Encode normalized samples as PCM16 little-endian bytes
///
/// Samples are clamped to [-1, 1]; negative values scale by 32768 and
/// non-negative values by 32767.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn samples_to_pcm_bytes(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(scaled.round() as i16).to_le_bytes());
    }
    out
}

/// Decode PCM16 little-endian bytes into a playable buffer at `source_rate`
///
/// No resampling happens here; the output device converts rates.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the byte length is not a multiple of
/// `2 * channels`
pub fn pcm_bytes_to_samples(bytes: &[u8], source_rate: u32, channels: u16) -> Result<AudioBuffer> {
    let channel_count = usize::from(channels);
    if channel_count == 0 {
        return Err(Error::Decode("channel count must be positive".to_string()));
    }
    if bytes.len() % (2 * channel_count) != 0 {
        return Err(Error::Decode(format!(
            "{} bytes is not a whole number of {channel_count}-channel PCM16 frames",
            bytes.len()
        )));
    }

    let frames = bytes.len() / (2 * channel_count);
    let mut planes = vec![Vec::with_capacity(frames); channel_count];
    for (i, word) in bytes.chunks_exact(2).enumerate() {
        let sample = f32::from(i16::from_le_bytes([word[0], word[1]])) / 32768.0;
        planes[i % channel_count].push(sample);
    }

    AudioBuffer::new(source_rate, planes)
}

/// Encode bytes for text transport
#[must_use]
pub fn encode_transport(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode transport text back into bytes
///
/// # Errors
///
/// Returns [`Error::Decode`] if the text is not valid base64
pub fn decode_transport(text: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Decode(format!("invalid transport encoding: {e}")))
}

/// Convert f32 samples to WAV bytes for saving recordings
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for word in samples_to_pcm_bytes(samples).chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([word[0], word[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
