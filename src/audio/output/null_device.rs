// ABOUTME: Clock-driven virtual output device
// ABOUTME: Consumes frames at the sample rate and discards them

use super::DeviceError;
use crate::audio::types::SampleFormat;
use crate::config::PlayerSettings;
use std::time::{Duration, Instant};

/// Output device that plays into nothing at real-time speed
#[derive(Debug)]
pub struct NullDevice {
    format: SampleFormat,
    buffer_frames: usize,
    period_frames: usize,
    /// Frames queued at `anchor`
    queued_at_anchor: usize,
    anchor: Instant,
}

impl NullDevice {
    /// Create a sink with the configured buffer geometry
    pub fn open(settings: &PlayerSettings, format: SampleFormat) -> Result<Self, DeviceError> {
        if !format.is_valid() {
            return Err(DeviceError::Unsupported(format.to_string()));
        }
        let buffer_frames = format.frames_for(settings.effective_buffer_time()).max(1);
        let period_frames = format.frames_for(settings.period_time()).max(1);
        log::info!(
            "Opened null device ({}), buffer: {} frames, period: {} frames",
            format,
            buffer_frames,
            period_frames
        );
        Ok(Self {
            format,
            buffer_frames,
            period_frames,
            queued_at_anchor: 0,
            anchor: Instant::now(),
        })
    }

    /// Frames per period
    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Wait until frames can be written
    pub fn wait(&mut self, timeout: Duration) -> Result<bool, DeviceError> {
        let free = self.free_frames();
        if free > 0 {
            return Ok(true);
        }
        // Full: sleep until one period has played out
        let until_period = self.format.duration_for(self.period_frames);
        std::thread::sleep(until_period.min(timeout));
        Ok(self.free_frames() > 0)
    }

    /// Writable frames and the time until a frame written now is heard
    pub fn avail_delay(&mut self) -> Result<(usize, Duration), DeviceError> {
        let queued = self.queued_frames();
        Ok((
            self.buffer_frames.saturating_sub(queued),
            self.format.duration_for(queued),
        ))
    }

    /// Drop queued frames
    pub fn prepare(&mut self) -> Result<(), DeviceError> {
        self.queued_at_anchor = 0;
        self.anchor = Instant::now();
        Ok(())
    }

    /// Queue frames; returns frames accepted
    pub fn write(&mut self, _data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        let queued = self.queued_frames();
        let frames = frames.min(self.buffer_frames.saturating_sub(queued));
        self.queued_at_anchor = queued + frames;
        self.anchor = Instant::now();
        Ok(frames)
    }

    fn queued_frames(&self) -> usize {
        let played = self.format.frames_for(self.anchor.elapsed());
        self.queued_at_anchor.saturating_sub(played)
    }

    fn free_frames(&self) -> usize {
        self.buffer_frames.saturating_sub(self.queued_frames())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> NullDevice {
        NullDevice::open(&PlayerSettings::default(), SampleFormat::new(48000, 16, 2)).unwrap()
    }

    #[test]
    fn test_geometry_from_settings() {
        let device = device();
        // 80 ms buffer, 4 fragments
        assert_eq!(device.buffer_frames, 3840);
        assert_eq!(device.period_frames(), 960);
    }

    #[test]
    fn test_write_fills_and_drains() {
        let mut device = device();
        let (avail, delay) = device.avail_delay().unwrap();
        assert_eq!(avail, 3840);
        assert_eq!(delay, Duration::ZERO);

        assert_eq!(device.write(&[], 5000).unwrap(), 3840);
        let (avail, delay) = device.avail_delay().unwrap();
        assert!(avail < 3840);
        assert!(delay > Duration::from_millis(60));

        // A full device becomes writable again after a period plays out
        assert!(device.wait(Duration::from_millis(200)).unwrap());
    }

    #[test]
    fn test_prepare_drops_queue() {
        let mut device = device();
        device.write(&[], 1000).unwrap();
        device.prepare().unwrap();
        assert_eq!(device.avail_delay().unwrap().0, 3840);
    }

    #[test]
    fn test_invalid_format() {
        let result = NullDevice::open(&PlayerSettings::default(), SampleFormat::new(48000, 12, 2));
        assert!(matches!(result, Err(DeviceError::Unsupported(_))));
    }
}
