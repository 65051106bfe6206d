// ABOUTME: Core audio type definitions
// ABOUTME: SampleFormat derived from the codec header, PcmChunk with server timestamp

use crate::protocol::Timeval;
use std::fmt;
use std::time::Duration;

/// Sample format of a stream
///
/// 24-bit samples travel in 4-byte little-endian containers, so the sample
/// size is not always `bits / 8`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleFormat {
    /// Sample rate in Hz (e.g., 48000)
    pub rate: u32,
    /// Bit depth per sample (8, 16, 24 or 32)
    pub bits: u16,
    /// Number of audio channels (1 = mono, 2 = stereo)
    pub channels: u16,
}

impl SampleFormat {
    /// Create a new sample format
    pub fn new(rate: u32, bits: u16, channels: u16) -> Self {
        Self {
            rate,
            bits,
            channels,
        }
    }

    /// Bytes per sample of a single channel
    #[inline]
    pub fn sample_size(&self) -> usize {
        if self.bits == 24 {
            4
        } else {
            (self.bits as usize).div_ceil(8)
        }
    }

    /// Bytes per interleaved frame
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.sample_size() * self.channels as usize
    }

    /// Whether every field is usable for playback
    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.channels > 0 && matches!(self.bits, 8 | 16 | 24 | 32)
    }

    /// Number of frames covering `duration`
    #[inline]
    pub fn frames_for(&self, duration: Duration) -> usize {
        (duration.as_micros() * self.rate as u128 / 1_000_000) as usize
    }

    /// Number of frames covering `micros` microseconds (negative clamps to 0)
    #[inline]
    pub fn frames_for_micros(&self, micros: i64) -> usize {
        if micros <= 0 {
            return 0;
        }
        (micros as i128 * self.rate as i128 / 1_000_000) as usize
    }

    /// Playback duration of `frames` frames, in microseconds
    #[inline]
    pub fn micros_for(&self, frames: usize) -> i64 {
        if self.rate == 0 {
            return 0;
        }
        (frames as i128 * 1_000_000 / self.rate as i128) as i64
    }

    /// Playback duration of `frames` frames
    #[inline]
    pub fn duration_for(&self, frames: usize) -> Duration {
        Duration::from_micros(self.micros_for(frames).max(0) as u64)
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.rate, self.bits, self.channels)
    }
}

/// Decoded, timestamped chunk of interleaved PCM
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcmChunk {
    /// Server time at which the first frame should be played
    pub timestamp: Timeval,
    /// Interleaved little-endian samples
    pub payload: Vec<u8>,
    /// Format of `payload`
    pub format: SampleFormat,
}

impl PcmChunk {
    /// Create a chunk from raw payload
    pub fn new(timestamp: Timeval, payload: Vec<u8>, format: SampleFormat) -> Self {
        Self {
            timestamp,
            payload,
            format,
        }
    }

    /// Number of complete frames in the payload
    #[inline]
    pub fn frame_count(&self) -> usize {
        match self.format.frame_size() {
            0 => 0,
            size => self.payload.len() / size,
        }
    }

    /// Server time of the first frame, in microseconds
    #[inline]
    pub fn start_micros(&self) -> i64 {
        self.timestamp.to_micros()
    }

    /// Playback duration of the chunk
    pub fn duration(&self) -> Duration {
        self.format.duration_for(self.frame_count())
    }
}
