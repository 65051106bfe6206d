// ABOUTME: cpal-backed output device
// ABOUTME: Bounded f32 ring fed by the device loop and drained by the cpal callback

use super::DeviceError;
use crate::audio::types::SampleFormat;
use crate::config::PlayerSettings;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, StreamConfig};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Ring {
    samples: VecDeque<f32>,
    /// Callback output has started (enough data was queued once)
    started: bool,
    /// The callback ran dry; cleared by `prepare`
    xrun: bool,
    /// Callback-to-DAC latency reported by the last callback
    hardware_latency: Duration,
    failure: Option<String>,
}

struct Shared {
    ring: Mutex<Ring>,
    drained: Condvar,
}

/// Output device on a cpal stream
///
/// Emulates a blocking PCM device: `avail` is the free space of the ring and
/// `delay` the queued audio plus the latency the callback reports.
pub struct CpalDevice {
    stream: cpal::Stream,
    shared: Arc<Shared>,
    format: SampleFormat,
    channels: usize,
    buffer_frames: usize,
    period_frames: usize,
}

impl CpalDevice {
    /// Open the configured (or default) device and start its stream
    pub fn open(settings: &PlayerSettings, format: SampleFormat) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = match settings.device.as_deref() {
            Some(name) => host
                .output_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?
                .find(|device| device.name().ok().as_deref() == Some(name))
                .ok_or_else(|| DeviceError::NotFound(name.to_string()))?,
            None => host
                .default_output_device()
                .ok_or_else(|| DeviceError::NotFound("default output device".to_string()))?,
        };
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let channels = format.channels as usize;
        let buffer_frames = format.frames_for(settings.effective_buffer_time()).max(1);
        let period_frames = format.frames_for(settings.period_time()).max(1);

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(Shared {
            ring: Mutex::new(Ring {
                samples: VecDeque::with_capacity(buffer_frames * channels),
                ..Ring::default()
            }),
            drained: Condvar::new(),
        });

        let callback_shared = Arc::clone(&shared);
        let error_shared = Arc::clone(&shared);
        let start_threshold = period_frames * channels;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let ts = info.timestamp();
                    let latency = ts
                        .playback
                        .duration_since(&ts.callback)
                        .unwrap_or(Duration::ZERO);

                    let mut ring = callback_shared.ring.lock();
                    ring.hardware_latency = latency;

                    if !ring.started && ring.samples.len() >= start_threshold {
                        ring.started = true;
                    }
                    if !ring.started {
                        data.fill(0.0);
                        return;
                    }

                    let available = ring.samples.len().min(data.len());
                    for (out, sample) in data.iter_mut().zip(ring.samples.drain(..available)) {
                        *out = sample;
                    }
                    if available < data.len() {
                        data[available..].fill(0.0);
                        ring.started = false;
                        ring.xrun = true;
                    }
                    drop(ring);
                    callback_shared.drained.notify_all();
                },
                move |err| {
                    error_shared.ring.lock().failure = Some(err.to_string());
                    error_shared.drained.notify_all();
                },
                None,
            )
            .map_err(|e| match e {
                BuildStreamError::DeviceNotAvailable => DeviceError::Busy(name.clone()),
                BuildStreamError::StreamConfigNotSupported => {
                    DeviceError::Unsupported(format!("{} on {}", format, name))
                }
                other => DeviceError::Backend(other.to_string()),
            })?;

        stream
            .play()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        log::info!(
            "Opened cpal device \"{}\" ({}), buffer: {} frames, period: {} frames",
            name,
            format,
            buffer_frames,
            period_frames
        );

        Ok(Self {
            stream,
            shared,
            format,
            channels,
            buffer_frames,
            period_frames,
        })
    }

    /// Frames per period
    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Wait until frames can be written
    pub fn wait(&mut self, timeout: Duration) -> Result<bool, DeviceError> {
        let deadline = Instant::now() + timeout;
        let mut ring = self.shared.ring.lock();
        loop {
            if let Some(failure) = ring.failure.take() {
                return Err(DeviceError::Backend(failure));
            }
            if ring.xrun {
                return Err(DeviceError::Underrun);
            }
            if self.free_frames(&ring) > 0 {
                return Ok(true);
            }
            if self.shared.drained.wait_until(&mut ring, deadline).timed_out() {
                return Ok(self.free_frames(&ring) > 0);
            }
        }
    }

    /// Writable frames and the time until a frame written now is heard
    pub fn avail_delay(&mut self) -> Result<(usize, Duration), DeviceError> {
        let ring = self.shared.ring.lock();
        if ring.xrun {
            return Err(DeviceError::Underrun);
        }
        let queued = ring.samples.len() / self.channels;
        let delay = self.format.duration_for(queued) + ring.hardware_latency;
        Ok((self.free_frames(&ring), delay))
    }

    /// Recover from an underrun; drops queued audio
    pub fn prepare(&mut self) -> Result<(), DeviceError> {
        let mut ring = self.shared.ring.lock();
        ring.samples.clear();
        ring.started = false;
        ring.xrun = false;
        Ok(())
    }

    /// Queue interleaved little-endian samples; returns frames written
    pub fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        let mut ring = self.shared.ring.lock();
        if ring.xrun {
            return Err(DeviceError::Underrun);
        }
        let frames = frames.min(self.free_frames(&ring));
        let bytes = frames * self.format.frame_size();
        let sample_size = self.format.sample_size();
        let bits = self.format.bits;
        ring.samples.extend(
            data[..bytes.min(data.len())]
                .chunks_exact(sample_size)
                .map(|sample| to_f32(sample, bits)),
        );
        Ok(frames)
    }

    fn free_frames(&self, ring: &Ring) -> usize {
        self.buffer_frames
            .saturating_sub(ring.samples.len() / self.channels)
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let _ = self.stream.pause();
    }
}

/// Convert one little-endian sample to f32 in [-1, 1)
fn to_f32(sample: &[u8], bits: u16) -> f32 {
    match bits {
        8 => (sample[0] as f32 - 128.0) / 128.0,
        16 => i16::from_le_bytes([sample[0], sample[1]]) as f32 / 32_768.0,
        24 => {
            let raw = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
            // Sign-extend the low 24 bits of the container
            ((raw << 8) >> 8) as f32 / 8_388_608.0
        }
        _ => i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]) as f32
            / 2_147_483_648.0,
    }
}
