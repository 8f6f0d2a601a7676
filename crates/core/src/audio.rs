//! Audio chunk type and WAV framing
//!
//! Chunks carry raw PCM plus the format needed to reframe them as WAV for
//! the carrier. Duration is authoritative; byte length is derived.

use std::collections::HashMap;
use std::io::Cursor;

use crate::error::{Error, Result};

/// A chunk of PCM audio with playback metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    /// Raw sample bytes (interleaved, little-endian)
    pub data: Vec<u8>,
    /// Playback duration in milliseconds
    pub duration_ms: f64,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bytes per sample (1 or 2)
    pub sample_width: u16,
    /// Channel count
    pub channels: u16,
    /// Free-form metadata (fragment index, provider, ...)
    pub metadata: HashMap<String, String>,
}

impl AudioChunk {
    /// Create a chunk from raw PCM, deriving duration from the format.
    pub fn from_pcm(data: Vec<u8>, sample_rate: u32, sample_width: u16, channels: u16) -> Self {
        let frame_bytes = sample_width as usize * channels as usize;
        let frames = if frame_bytes > 0 {
            data.len() / frame_bytes
        } else {
            0
        };
        let duration_ms = frames as f64 / sample_rate as f64 * 1000.0;

        Self {
            data,
            duration_ms,
            sample_rate,
            sample_width,
            channels,
            metadata: HashMap::new(),
        }
    }

    /// Create a silent chunk of the given duration.
    pub fn silence(duration_ms: f64, sample_rate: u32, sample_width: u16, channels: u16) -> Self {
        let frames = (duration_ms / 1000.0 * sample_rate as f64).round() as usize;
        let data = vec![0u8; frames * sample_width as usize * channels as usize];

        Self {
            data,
            duration_ms,
            sample_rate,
            sample_width,
            channels,
            metadata: HashMap::new(),
        }
    }

    /// Size of the raw payload in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Attach a metadata entry, builder style
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Encode the chunk as a standalone WAV file.
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: self.sample_width * 8,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| Error::InvalidInput(format!("wav encode: {e}")))?;

            match self.sample_width {
                1 => {
                    for &byte in &self.data {
                        writer
                            .write_sample(byte as i8)
                            .map_err(|e| Error::InvalidInput(format!("wav encode: {e}")))?;
                    }
                }
                2 => {
                    for pair in self.data.chunks_exact(2) {
                        let sample = i16::from_le_bytes([pair[0], pair[1]]);
                        writer
                            .write_sample(sample)
                            .map_err(|e| Error::InvalidInput(format!("wav encode: {e}")))?;
                    }
                }
                other => {
                    return Err(Error::InvalidInput(format!(
                        "unsupported sample width: {other} bytes"
                    )));
                }
            }

            writer
                .finalize()
                .map_err(|e| Error::InvalidInput(format!("wav encode: {e}")))?;
        }

        Ok(cursor.into_inner())
    }

    /// Decode a WAV file into a chunk.
    ///
    /// Duration is recomputed from the frame count so round-trips through
    /// `to_wav` preserve it exactly.
    pub fn from_wav(wav: &[u8]) -> Result<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(wav))
            .map_err(|e| Error::InvalidInput(format!("wav decode: {e}")))?;
        let spec = reader.spec();

        if spec.sample_format != hound::SampleFormat::Int {
            return Err(Error::InvalidInput("float wav not supported".into()));
        }

        let sample_width = spec.bits_per_sample / 8;
        let mut data = Vec::new();
        match spec.bits_per_sample {
            8 => {
                for sample in reader.samples::<i8>() {
                    let s = sample.map_err(|e| Error::InvalidInput(format!("wav decode: {e}")))?;
                    data.push(s as u8);
                }
            }
            16 => {
                for sample in reader.samples::<i16>() {
                    let s = sample.map_err(|e| Error::InvalidInput(format!("wav decode: {e}")))?;
                    data.extend_from_slice(&s.to_le_bytes());
                }
            }
            other => {
                return Err(Error::InvalidInput(format!(
                    "unsupported bit depth: {other}"
                )));
            }
        }

        Ok(Self::from_pcm(data, spec.sample_rate, sample_width, spec.channels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_duration_is_derived() {
        // 8 kHz mono 16-bit: 160 frames = 20 ms
        let chunk = AudioChunk::from_pcm(vec![0u8; 320], 8000, 2, 1);
        assert!((chunk.duration_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn silence_has_expected_size() {
        let chunk = AudioChunk::silence(100.0, 8000, 2, 1);
        assert_eq!(chunk.size(), 1600);
        assert!((chunk.duration_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn wav_round_trip_preserves_format() {
        let samples: Vec<u8> = (0..640).map(|i| (i % 251) as u8).collect();
        let chunk = AudioChunk::from_pcm(samples, 8000, 2, 1);

        let wav = chunk.to_wav().unwrap();
        let decoded = AudioChunk::from_wav(&wav).unwrap();

        assert_eq!(decoded.sample_rate, chunk.sample_rate);
        assert_eq!(decoded.channels, chunk.channels);
        assert_eq!(decoded.sample_width, chunk.sample_width);
        assert_eq!(decoded.data, chunk.data);
        assert!((decoded.duration_ms - chunk.duration_ms).abs() < 1e-9);
    }

    #[test]
    fn malformed_wav_is_invalid_input() {
        let err = AudioChunk::from_wav(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }
}
