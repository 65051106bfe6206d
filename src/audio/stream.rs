// ABOUTME: Jitter buffer between the network dispatch and the audio device
// ABOUTME: Converts server timestamps into local play deadlines and fills device requests

use crate::audio::types::{PcmChunk, SampleFormat};
use crate::sync::TimeSync;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default drift tolerated before playback is resynchronized
pub const DEFAULT_RESYNC_THRESHOLD: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct StreamState {
    chunks: VecDeque<PcmChunk>,
    /// Frames already consumed from the front chunk
    read_frames: usize,
    /// Unread frames across all chunks
    buffered_frames: usize,
    buffer_len_us: i64,
    playing: bool,
    arrivals: u64,
    resync_threshold_us: i64,
}

impl StreamState {
    /// Server time of the next unread frame
    fn position_micros(&self, format: &SampleFormat) -> Option<i64> {
        self.chunks
            .front()
            .map(|chunk| chunk.start_micros() + format.micros_for(self.read_frames))
    }

    /// Drop every unread frame scheduled before server time `due_us`
    fn drop_before(&mut self, due_us: i64, format: &SampleFormat) -> usize {
        let mut dropped = 0;
        while let Some(front) = self.chunks.front() {
            let frames = front.frame_count();
            let start = front.start_micros();
            if start + format.micros_for(frames) <= due_us {
                let remaining = frames - self.read_frames;
                self.chunks.pop_front();
                self.read_frames = 0;
                self.buffered_frames -= remaining;
                dropped += remaining;
                continue;
            }
            let target = format.frames_for_micros(due_us - start).min(frames);
            if target > self.read_frames {
                let skipped = target - self.read_frames;
                self.read_frames = target;
                self.buffered_frames -= skipped;
                dropped += skipped;
            }
            break;
        }
        dropped
    }

    fn copy_frames(&mut self, out: &mut Vec<u8>, mut frames: usize, frame_size: usize) {
        while frames > 0 {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let remaining = front.frame_count() - self.read_frames;
            let take = remaining.min(frames);
            let start = self.read_frames * frame_size;
            out.extend_from_slice(&front.payload[start..start + take * frame_size]);

            self.buffered_frames -= take;
            frames -= take;
            if take == remaining {
                self.chunks.pop_front();
                self.read_frames = 0;
            } else {
                self.read_frames += take;
            }
        }
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.read_frames = 0;
        self.buffered_frames = 0;
        self.playing = false;
    }
}

/// Ordered buffer of decoded chunks of one sample format
///
/// Written by the network dispatch, read by the device thread.
#[derive(Debug)]
pub struct Stream {
    format: SampleFormat,
    time_sync: Arc<TimeSync>,
    state: Mutex<StreamState>,
    chunk_arrived: Condvar,
}

impl Stream {
    /// Create an empty stream for `format`
    pub fn new(format: SampleFormat, time_sync: Arc<TimeSync>) -> Self {
        Self {
            format,
            time_sync,
            state: Mutex::new(StreamState {
                chunks: VecDeque::new(),
                read_frames: 0,
                buffered_frames: 0,
                buffer_len_us: 0,
                playing: false,
                arrivals: 0,
                resync_threshold_us: DEFAULT_RESYNC_THRESHOLD.as_micros() as i64,
            }),
            chunk_arrived: Condvar::new(),
        }
    }

    /// Set the drift tolerated while playing before a hard resync
    pub fn with_resync_threshold(self, threshold: Duration) -> Self {
        self.state.lock().resync_threshold_us = threshold.as_micros() as i64;
        self
    }

    /// Sample format of every chunk in this stream
    pub fn format(&self) -> SampleFormat {
        self.format
    }

    /// Append a decoded chunk and wake waiting readers
    ///
    /// Chunks in a different format, or without a single complete frame, are dropped.
    pub fn add_chunk(&self, chunk: PcmChunk) {
        if chunk.format != self.format {
            log::warn!(
                "Dropping chunk with format {}, stream format is {}",
                chunk.format,
                self.format
            );
            return;
        }
        let frames = chunk.frame_count();
        if frames == 0 {
            return;
        }

        let mut state = self.state.lock();
        state.chunks.push_back(chunk);
        state.buffered_frames += frames;
        state.arrivals = state.arrivals.wrapping_add(1);
        drop(state);

        self.chunk_arrived.notify_all();
    }

    /// Fill `out` with exactly `frames` frames due for playback
    ///
    /// `requested_latency` is the time until a frame written now is audible.
    /// Returns `false` without touching `out` when fewer than `frames` frames
    /// are buffered; the next successful read then resynchronizes.
    pub fn get_player_chunk(
        &self,
        out: &mut Vec<u8>,
        requested_latency: Duration,
        frames: usize,
    ) -> bool {
        let frame_size = self.format.frame_size();
        let latency_us = requested_latency.as_micros() as i64;
        let mut state = self.state.lock();

        if state.buffered_frames < frames {
            state.playing = false;
            return false;
        }

        out.clear();
        out.reserve(frames * frame_size);

        if state.playing {
            let age = self.age_micros(&state, latency_us);
            if age.abs() > state.resync_threshold_us {
                log::info!("Playback drifted {}us from the server clock, resyncing", age);
                state.playing = false;
            }
        }

        if !state.playing {
            let age = self.age_micros(&state, latency_us);
            if age > 0 {
                let due = self.time_sync.server_now_micros() - state.buffer_len_us + latency_us;
                let dropped = state.drop_before(due, &self.format);
                log::debug!("Dropped {} stale frames ({}us late)", dropped, age);
                if state.buffered_frames < frames {
                    return false;
                }
            }

            let age = self.age_micros(&state, latency_us);
            if age < 0 {
                let gap = self.format.frames_for_micros(-age);
                if gap >= frames {
                    out.resize(frames * frame_size, self.silence());
                    return true;
                }
                out.resize(gap * frame_size, self.silence());
                state.copy_frames(out, frames - gap, frame_size);
                state.playing = true;
                return true;
            }
            state.playing = true;
        }

        state.copy_frames(out, frames, frame_size);
        true
    }

    /// Block until a chunk is added or `timeout` elapses
    ///
    /// Returns `true` if a chunk arrived or [`Stream::wake_readers`] was called.
    pub fn wait_for_chunk(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        let seen = state.arrivals;
        while state.arrivals == seen {
            if self.chunk_arrived.wait_until(&mut state, deadline).timed_out() {
                return state.arrivals != seen;
            }
        }
        true
    }

    /// Wake threads blocked in [`Stream::wait_for_chunk`] without adding audio
    pub fn wake_readers(&self) {
        let mut state = self.state.lock();
        state.arrivals = state.arrivals.wrapping_add(1);
        drop(state);
        self.chunk_arrived.notify_all();
    }

    /// Set the end-to-end buffer target (server buffer minus latencies)
    pub fn set_buffer_len(&self, buffer_len: Duration) {
        self.state.lock().buffer_len_us = buffer_len.as_micros() as i64;
    }

    /// Current end-to-end buffer target
    pub fn buffer_len(&self) -> Duration {
        Duration::from_micros(self.state.lock().buffer_len_us.max(0) as u64)
    }

    /// Drop all buffered audio
    pub fn clear_chunks(&self) {
        self.state.lock().reset();
    }

    /// Unread frames
    pub fn buffered_frames(&self) -> usize {
        self.state.lock().buffered_frames
    }

    /// Playback duration of the unread frames
    pub fn buffered_duration(&self) -> Duration {
        self.format.duration_for(self.buffered_frames())
    }

    /// Whether the read position is locked to the server clock
    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// How late the next unread frame would be if written now (negative when early)
    fn age_micros(&self, state: &StreamState, latency_us: i64) -> i64 {
        match state.position_micros(&self.format) {
            Some(position) => {
                self.time_sync.server_now_micros() - position - state.buffer_len_us + latency_us
            }
            None => 0,
        }
    }

    fn silence(&self) -> u8 {
        // 8-bit WAV samples are unsigned
        if self.format.bits == 8 {
            0x80
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Timeval;

    fn format() -> SampleFormat {
        SampleFormat::new(48000, 16, 2)
    }

    fn chunk_at(start_us: i64, frames: usize, fill: u8) -> PcmChunk {
        PcmChunk::new(
            Timeval::from_micros(start_us),
            vec![fill; frames * format().frame_size()],
            format(),
        )
    }

    #[test]
    fn test_format_mismatch_is_dropped() {
        let stream = Stream::new(format(), Arc::new(TimeSync::new()));
        let other = PcmChunk::new(Timeval::default(), vec![0; 64], SampleFormat::new(44100, 16, 2));
        stream.add_chunk(other);
        assert_eq!(stream.buffered_frames(), 0);
    }

    #[test]
    fn test_partial_reads_keep_cursor() {
        let stream = Stream::new(format(), Arc::new(TimeSync::new()));
        stream.add_chunk(chunk_at(0, 480, 1));
        stream.add_chunk(chunk_at(10_000, 480, 2));

        let mut state = stream.state.lock();
        let mut out = Vec::new();
        state.copy_frames(&mut out, 240, 4);
        assert_eq!(out.len(), 240 * 4);
        assert_eq!(state.buffered_frames, 720);
        assert_eq!(state.position_micros(&format()), Some(5_000));

        // Spans the chunk boundary
        out.clear();
        state.copy_frames(&mut out, 480, 4);
        assert!(out[..240 * 4].iter().all(|&b| b == 1));
        assert!(out[240 * 4..].iter().all(|&b| b == 2));
        assert_eq!(state.chunks.len(), 1);
        assert_eq!(state.position_micros(&format()), Some(15_000));
    }

    #[test]
    fn test_drop_before_removes_stale_chunks_then_seeks() {
        let stream = Stream::new(format(), Arc::new(TimeSync::new()));
        stream.add_chunk(chunk_at(0, 480, 1));
        stream.add_chunk(chunk_at(10_000, 480, 2));
        stream.add_chunk(chunk_at(500_000, 480, 3));

        let mut state = stream.state.lock();
        // 12.5ms: the first chunk is gone, 120 frames into the second
        assert_eq!(state.drop_before(12_500, &format()), 600);
        assert_eq!(state.chunks.len(), 2);
        assert_eq!(state.read_frames, 120);
        assert_eq!(state.buffered_frames, 840);

        // A gap before the next chunk does not eat into it
        assert_eq!(state.drop_before(100_000, &format()), 360);
        assert_eq!(state.chunks.len(), 1);
        assert_eq!(state.read_frames, 0);
        assert_eq!(state.buffered_frames, 480);
    }

    #[test]
    fn test_eight_bit_silence_is_midpoint() {
        let format = SampleFormat::new(8000, 8, 1);
        let sync = Arc::new(TimeSync::new());
        let stream = Stream::new(format, Arc::clone(&sync));
        let start = sync.server_now_micros() + 10_000_000;
        stream.add_chunk(PcmChunk::new(
            Timeval::from_micros(start),
            vec![7; 80],
            format,
        ));

        let mut out = Vec::new();
        assert!(stream.get_player_chunk(&mut out, Duration::ZERO, 40));
        assert!(out.iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_wait_for_chunk_times_out() {
        let stream = Stream::new(format(), Arc::new(TimeSync::new()));
        assert!(!stream.wait_for_chunk(Duration::from_millis(20)));
    }
}
