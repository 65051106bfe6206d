// ABOUTME: Audio output: device abstraction and the device loop thread
// ABOUTME: Pulls due frames from the Stream and writes them to the selected backend

mod cpal_device;
mod null_device;

pub use cpal_device::CpalDevice;
pub use null_device::NullDevice;

use crate::audio::stream::Stream;
use crate::audio::types::SampleFormat;
use crate::config::{PlayerBackend, PlayerSettings};
use crate::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use tokio::sync::oneshot;

/// Pause after a failed device open
const REOPEN_DELAY: Duration = Duration::from_millis(100);

/// Upper bound for waiting on device readiness and on new chunks
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Longest sleep when the device has no room
const MAX_FULL_SLEEP: Duration = Duration::from_millis(10);

/// Minimum spacing of "waiting for chunk" log lines
const WAITING_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Errors reported by an output device
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device is in use or temporarily unavailable
    #[error("device busy: {0}")]
    Busy(String),

    /// The device ran out of data
    #[error("underrun")]
    Underrun,

    /// No device with the requested name
    #[error("device not found: {0}")]
    NotFound(String),

    /// The device cannot play the stream format
    #[error("unsupported format: {0}")]
    Unsupported(String),

    /// Any other backend failure
    #[error("backend error: {0}")]
    Backend(String),
}

/// Output device of one of the supported backends
pub enum Device {
    /// System device through cpal
    Cpal(CpalDevice),
    /// Virtual real-time sink
    Null(NullDevice),
}

impl Device {
    /// Open the backend selected in `settings` for `format`
    pub fn open(settings: &PlayerSettings, format: SampleFormat) -> Result<Self, DeviceError> {
        match settings.backend {
            PlayerBackend::Cpal => CpalDevice::open(settings, format).map(Device::Cpal),
            PlayerBackend::Null => NullDevice::open(settings, format).map(Device::Null),
        }
    }

    /// Wait up to `timeout` for room in the device buffer
    pub fn wait(&mut self, timeout: Duration) -> Result<bool, DeviceError> {
        match self {
            Device::Cpal(device) => device.wait(timeout),
            Device::Null(device) => device.wait(timeout),
        }
    }

    /// Writable frames and current output delay
    pub fn avail_delay(&mut self) -> Result<(usize, Duration), DeviceError> {
        match self {
            Device::Cpal(device) => device.avail_delay(),
            Device::Null(device) => device.avail_delay(),
        }
    }

    /// Recover from an underrun
    pub fn prepare(&mut self) -> Result<(), DeviceError> {
        match self {
            Device::Cpal(device) => device.prepare(),
            Device::Null(device) => device.prepare(),
        }
    }

    /// Write `frames` interleaved frames from `data`
    pub fn write(&mut self, data: &[u8], frames: usize) -> Result<usize, DeviceError> {
        match self {
            Device::Cpal(device) => device.write(data, frames),
            Device::Null(device) => device.write(data, frames),
        }
    }

    /// Frames per device period
    pub fn period_frames(&self) -> usize {
        match self {
            Device::Cpal(device) => device.period_frames(),
            Device::Null(device) => device.period_frames(),
        }
    }
}

/// Plays a [`Stream`] on an output device from a dedicated thread
pub struct AudioOutput {
    settings: PlayerSettings,
    stream: Arc<Stream>,
    active: Arc<AtomicBool>,
    frames_written: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl AudioOutput {
    /// Create a stopped output for `stream`
    pub fn new(settings: &PlayerSettings, stream: Arc<Stream>) -> Self {
        Self {
            settings: settings.clone(),
            stream,
            active: Arc::new(AtomicBool::new(false)),
            frames_written: Arc::new(AtomicU64::new(0)),
            worker: None,
        }
    }

    /// Start the device thread and wait for its first device open
    ///
    /// The open runs on the device thread; this only awaits its report. A
    /// busy device is not an error, the thread keeps retrying.
    pub async fn start(&mut self) -> Result<(), Error> {
        let Some(opened) = self.spawn()? else {
            return Ok(());
        };
        let result = startup_result(opened.await.ok());
        if result.is_err() {
            self.stop().await;
        }
        result
    }

    /// [`AudioOutput::start`] for callers outside an async runtime
    pub fn blocking_start(&mut self) -> Result<(), Error> {
        let Some(opened) = self.spawn()? else {
            return Ok(());
        };
        let result = startup_result(opened.blocking_recv().ok());
        if result.is_err() {
            self.blocking_stop();
        }
        result
    }

    /// Stop the device thread and release the device
    ///
    /// The join runs on the blocking pool, so the calling runtime keeps
    /// serving its other tasks meanwhile.
    pub async fn stop(&mut self) {
        let Some(worker) = self.halt() else {
            return;
        };
        match tokio::task::spawn_blocking(move || worker.join()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::error!("Output thread panicked"),
            Err(e) => log::error!("Failed to join the output thread: {}", e),
        }
    }

    /// [`AudioOutput::stop`] for callers outside an async runtime
    pub fn blocking_stop(&mut self) {
        if let Some(worker) = self.halt() {
            if worker.join().is_err() {
                log::error!("Output thread panicked");
            }
        }
    }

    fn spawn(&mut self) -> Result<Option<oneshot::Receiver<Result<(), DeviceError>>>, Error> {
        if self.worker.is_some() {
            return Ok(None);
        }
        self.active.store(true, Ordering::SeqCst);

        let (opened_tx, opened_rx) = oneshot::channel();
        let device_loop = DeviceLoop {
            settings: self.settings.clone(),
            stream: Arc::clone(&self.stream),
            active: Arc::clone(&self.active),
            frames_written: Arc::clone(&self.frames_written),
        };
        let worker = thread::Builder::new()
            .name("syncast-output".to_string())
            .spawn(move || device_loop.run(opened_tx))?;
        self.worker = Some(worker);
        Ok(Some(opened_rx))
    }

    /// Ask the device thread to exit and hand back its handle
    fn halt(&mut self) -> Option<JoinHandle<()>> {
        self.active.store(false, Ordering::SeqCst);
        self.stream.wake_readers();
        self.worker.take()
    }

    /// Whether the device thread is alive
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Total frames handed to the device since creation
    pub fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::Relaxed)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.blocking_stop();
    }
}

/// Map the device thread's open report onto the result of `start`
fn startup_result(report: Option<Result<(), DeviceError>>) -> Result<(), Error> {
    match report {
        Some(Ok(())) => Ok(()),
        Some(Err(DeviceError::Busy(name))) => {
            log::warn!("Output device {} is busy, will keep retrying", name);
            Ok(())
        }
        Some(Err(e)) => Err(e.into()),
        None => Err(Error::Output("output thread exited during startup".to_string())),
    }
}

struct DeviceLoop {
    settings: PlayerSettings,
    stream: Arc<Stream>,
    active: Arc<AtomicBool>,
    frames_written: Arc<AtomicU64>,
}

impl DeviceLoop {
    fn run(self, opened_tx: oneshot::Sender<Result<(), DeviceError>>) {
        let format = self.stream.format();
        let mut full_sleep = MAX_FULL_SLEEP;
        let mut opened_tx = Some(opened_tx);
        let mut device: Option<Device> = None;
        let mut buffer = Vec::new();
        let mut last_chunk = Instant::now();
        let mut last_waiting_log: Option<Instant> = None;

        while self.active.load(Ordering::SeqCst) {
            if device.is_none() {
                match Device::open(&self.settings, format) {
                    Ok(opened) => {
                        full_sleep = (format.duration_for(opened.period_frames()) / 2)
                            .min(MAX_FULL_SLEEP);
                        // Stall detection starts over on a fresh device
                        last_chunk = Instant::now();
                        if let Some(tx) = opened_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                        device = Some(opened);
                    }
                    Err(e) => {
                        log::error!("Failed to open output device: {}", e);
                        let retry = matches!(e, DeviceError::Busy(_));
                        if let Some(tx) = opened_tx.take() {
                            let _ = tx.send(Err(e));
                            if !retry {
                                return;
                            }
                        }
                        thread::sleep(REOPEN_DELAY);
                        continue;
                    }
                }
            }
            let Some(dev) = device.as_mut() else {
                continue;
            };

            match dev.wait(WAIT_TIMEOUT) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(DeviceError::Underrun) => {
                    log::warn!("Underrun while waiting for the device");
                    if let Err(e) = dev.prepare() {
                        log::error!("Failed to recover from underrun: {}", e);
                    }
                }
                Err(e) => {
                    log::error!("Can't wait for the device to become ready: {}", e);
                    device = None;
                    continue;
                }
            }

            let (avail, delay) = match dev.avail_delay() {
                Ok(avail_delay) => avail_delay,
                Err(e) => {
                    log::debug!("Failed to query device delay: {}", e);
                    thread::sleep(MAX_FULL_SLEEP);
                    if let Err(e) = dev.prepare() {
                        log::error!("Failed to recover the device: {}", e);
                        device = None;
                    }
                    continue;
                }
            };

            if avail == 0 {
                thread::sleep(full_sleep);
                continue;
            }

            if self.stream.get_player_chunk(&mut buffer, delay, avail) {
                last_chunk = Instant::now();
                match dev.write(&buffer, avail) {
                    Ok(written) => {
                        self.frames_written
                            .fetch_add(written as u64, Ordering::Relaxed);
                    }
                    Err(DeviceError::Underrun) => {
                        log::warn!("Underrun while writing to the device");
                        if let Err(e) = dev.prepare() {
                            log::error!("Failed to recover from underrun: {}", e);
                            device = None;
                        }
                    }
                    Err(e) => {
                        log::error!("Can't write to the device: {}", e);
                        device = None;
                    }
                }
            } else {
                log::debug!("Not enough audio buffered for {} frames", avail);
                while self.active.load(Ordering::SeqCst)
                    && !self.stream.wait_for_chunk(WAIT_TIMEOUT)
                {
                    if last_waiting_log.map_or(true, |at| at.elapsed() >= WAITING_LOG_INTERVAL)
                    {
                        log::debug!("Waiting for chunk");
                        last_waiting_log = Some(Instant::now());
                    }
                    if device.is_some() && last_chunk.elapsed() > self.settings.stall_timeout {
                        log::info!(
                            "No chunk received for {}ms, releasing the output device",
                            self.settings.stall_timeout.as_millis()
                        );
                        device = None;
                        self.stream.clear_chunks();
                    }
                }
            }
        }

        if let Some(tx) = opened_tx.take() {
            let _ = tx.send(Err(DeviceError::Backend("stopped before open".to_string())));
        }
        log::debug!("Output thread finished");
    }
}
