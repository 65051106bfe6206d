// ABOUTME: Client configuration
// ABOUTME: Server endpoint, player parameters and per-session client settings

use crate::error::Error;
use std::fmt;
use std::time::Duration;

/// Default TCP port of the stream server
pub const DEFAULT_PORT: u16 = 1704;

/// Default device buffer time
pub const DEFAULT_BUFFER_TIME: Duration = Duration::from_millis(80);

/// Smallest accepted device buffer time
pub const MIN_BUFFER_TIME: Duration = Duration::from_millis(10);

/// Default number of device periods
pub const DEFAULT_FRAGMENTS: u32 = 4;

/// Smallest accepted number of device periods
pub const MIN_FRAGMENTS: u32 = 2;

/// The device buffer always holds at least this many periods
pub const MIN_PERIODS: u32 = 3;

/// Default time without audio before the device is released
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Smallest accepted stall timeout
pub const MIN_STALL_TIMEOUT: Duration = Duration::from_millis(100);

/// Smallest accepted resync threshold
pub const MIN_RESYNC_THRESHOLD: Duration = Duration::from_millis(1);

/// Address of a stream server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// Host name or IP address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServerEndpoint {
    /// Create an endpoint from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host`, `host:port` or `[v6addr]:port`, using `default_port` when absent
    pub fn parse(address: &str, default_port: u16) -> Result<Self, Error> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::Config("empty server address".to_string()));
        }

        if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("invalid server address: {}", address)))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port)?,
                None if tail.is_empty() => default_port,
                None => {
                    return Err(Error::Config(format!(
                        "invalid server address: {}",
                        address
                    )))
                }
            };
            return Ok(Self::new(host, port));
        }

        match address.rsplit_once(':') {
            // More than one colon without brackets is a bare IPv6 address
            Some((host, _)) if host.contains(':') => Ok(Self::new(address, default_port)),
            Some((host, port)) => Ok(Self::new(host, parse_port(port)?)),
            None => Ok(Self::new(address, default_port)),
        }
    }
}

fn parse_port(port: &str) -> Result<u16, Error> {
    port.parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| Error::Config(format!("invalid port: {}", port)))
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Audio output backend
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum PlayerBackend {
    /// System audio device through cpal
    #[default]
    Cpal,
    /// Clock-driven sink that discards audio
    Null,
}

impl fmt::Display for PlayerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerBackend::Cpal => write!(f, "cpal"),
            PlayerBackend::Null => write!(f, "null"),
        }
    }
}

/// Audio output configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerSettings {
    /// Output backend
    pub backend: PlayerBackend,
    /// Output device name (`None` = system default)
    pub device: Option<String>,
    /// Requested device buffer time
    pub buffer_time: Duration,
    /// Requested number of device periods
    pub fragments: u32,
    /// Additional output latency in milliseconds, subtracted from the buffer target
    pub latency_ms: i32,
    /// Time without audio before the device is released
    pub stall_timeout: Duration,
    /// Drift tolerated while playing before a hard resync
    pub resync_threshold: Duration,
}

impl PlayerSettings {
    /// Set the output backend
    pub fn backend(mut self, backend: PlayerBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the output device name
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Set the device buffer time (clamped to 10 ms)
    pub fn buffer_time(mut self, buffer_time: Duration) -> Self {
        self.buffer_time = buffer_time.max(MIN_BUFFER_TIME);
        self
    }

    /// Set the number of periods (clamped to 2)
    pub fn fragments(mut self, fragments: u32) -> Self {
        self.fragments = fragments.max(MIN_FRAGMENTS);
        self
    }

    /// Set the additional output latency in milliseconds
    pub fn latency_ms(mut self, latency_ms: i32) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set the stall timeout (clamped to 100 ms)
    pub fn stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout.max(MIN_STALL_TIMEOUT);
        self
    }

    /// Set the resync threshold (clamped to 1 ms)
    pub fn resync_threshold(mut self, threshold: Duration) -> Self {
        self.resync_threshold = threshold.max(MIN_RESYNC_THRESHOLD);
        self
    }

    /// Apply a parameter string such as `buffer_time=80,fragments=4`
    ///
    /// Unknown keys are ignored with a warning; bad values are errors.
    pub fn with_params(mut self, params: &str) -> Result<Self, Error> {
        for pair in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("expected key=value, got {}", pair)))?;
            let number = || {
                value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| Error::Config(format!("invalid value for {}: {}", key, value)))
            };
            match key.trim() {
                "buffer_time" => self = self.buffer_time(Duration::from_millis(number()?)),
                "fragments" => {
                    let fragments = u32::try_from(number()?)
                        .map_err(|_| Error::Config(format!("invalid fragments: {}", value)))?;
                    self = self.fragments(fragments);
                }
                other => log::warn!("Ignoring unknown player parameter: {}", other),
            }
        }
        Ok(self)
    }

    /// Duration of one device period
    pub fn period_time(&self) -> Duration {
        self.buffer_time / self.fragments.max(1)
    }

    /// Device buffer time after raising it to hold at least three periods
    pub fn effective_buffer_time(&self) -> Duration {
        let periods = self.fragments.max(MIN_PERIODS);
        self.buffer_time.max(self.period_time() * periods)
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            backend: PlayerBackend::default(),
            device: None,
            buffer_time: DEFAULT_BUFFER_TIME,
            fragments: DEFAULT_FRAGMENTS,
            latency_ms: 0,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            resync_threshold: crate::audio::stream::DEFAULT_RESYNC_THRESHOLD,
        }
    }
}

/// Settings of one streaming session
///
/// Replaced as a whole on every start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSettings {
    /// Server to stream from
    pub server: ServerEndpoint,
    /// Audio output configuration
    pub player: PlayerSettings,
    /// Instance number, distinguishes several clients on one host
    pub instance: u32,
    /// Client id reported to the server
    ///
    /// Empty means "derive from the MAC address or host name on connect".
    pub host_id: String,
}

impl ClientSettings {
    /// Create settings for `server` with default player parameters
    pub fn new(server: ServerEndpoint) -> Self {
        Self {
            server,
            ..Default::default()
        }
    }

    /// Set the server endpoint
    pub fn server(mut self, server: ServerEndpoint) -> Self {
        self.server = server;
        self
    }

    /// Set the player configuration
    pub fn player(mut self, player: PlayerSettings) -> Self {
        self.player = player;
        self
    }

    /// Set the instance number (minimum 1)
    pub fn instance(mut self, instance: u32) -> Self {
        self.instance = instance.max(1);
        self
    }

    /// Set the client id
    pub fn host_id(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = host_id.into();
        self
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server: ServerEndpoint::default(),
            player: PlayerSettings::default(),
            instance: 1,
            host_id: String::new(),
        }
    }
}
