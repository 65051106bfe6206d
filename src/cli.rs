// ABOUTME: Command-line arguments for the client binary
// ABOUTME: Tracing setup and conversion of flags into ClientSettings

use crate::config::{
    ClientSettings, PlayerBackend, PlayerSettings, ServerEndpoint, DEFAULT_PORT,
};
use crate::control::DEFAULT_SOCKET_PATH;
use crate::error::Error;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Client arguments
///
/// Flattened into the binary's parser with `#[command(flatten)]`.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Control socket path
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    pub socket: PathBuf,

    /// Output device name (see --list-devices)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Output backend
    #[arg(long, value_enum, default_value_t = PlayerBackend::Cpal)]
    pub backend: PlayerBackend,

    /// Player parameters, e.g. "buffer_time=80,fragments=4"
    #[arg(long)]
    pub player_params: Option<String>,

    /// Device buffer time in milliseconds (overrides --player-params)
    #[arg(long)]
    pub buffer_time: Option<u64>,

    /// Number of device periods (overrides --player-params)
    #[arg(long)]
    pub fragments: Option<u32>,

    /// Additional output latency in milliseconds
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub latency: i32,

    /// Milliseconds without audio before the output device is released
    #[arg(long, default_value = "5000")]
    pub stall_timeout: u64,

    /// Milliseconds of drift tolerated before playback is resynchronized
    #[arg(long, default_value = "50")]
    pub resync_threshold: u64,

    /// Server port used when an address has none
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Start streaming from this server right away
    #[arg(short, long)]
    pub connect: Option<String>,

    /// Instance number when running several clients on one host
    #[arg(short, long, default_value = "1")]
    pub instance: u32,

    /// Client id reported to the server (MAC address or host name when omitted)
    #[arg(long)]
    pub host_id: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ClientArgs {
    /// Initialize tracing based on verbosity flag
    pub fn init_tracing(&self) {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let filter = if self.verbose {
            "syncast=debug"
        } else {
            "syncast=info"
        };

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| filter.into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    /// Log startup information
    pub fn log_startup_info(&self) {
        tracing::info!("syncast v{}", env!("CARGO_PKG_VERSION"));
        tracing::info!("Control socket: {}", self.socket.display());
        tracing::info!(
            "Output: {} ({})",
            self.backend,
            self.device.as_deref().unwrap_or("default device")
        );
    }

    /// Build the player configuration from these args
    pub fn build_player(&self) -> Result<PlayerSettings, Error> {
        let mut player = PlayerSettings::default()
            .backend(self.backend)
            .latency_ms(self.latency)
            .stall_timeout(Duration::from_millis(self.stall_timeout))
            .resync_threshold(Duration::from_millis(self.resync_threshold));
        if let Some(device) = &self.device {
            player = player.device(device.clone());
        }
        if let Some(params) = &self.player_params {
            player = player.with_params(params)?;
        }
        if let Some(buffer_time) = self.buffer_time {
            player = player.buffer_time(Duration::from_millis(buffer_time));
        }
        if let Some(fragments) = self.fragments {
            player = player.fragments(fragments);
        }
        Ok(player)
    }

    /// Build the session template from these args
    pub fn build_settings(&self) -> Result<ClientSettings, Error> {
        let mut settings = ClientSettings::default()
            .server(ServerEndpoint::new("localhost", self.port))
            .player(self.build_player()?)
            .instance(self.instance);
        if let Some(host_id) = &self.host_id {
            settings = settings.host_id(host_id.clone());
        }
        Ok(settings)
    }

    /// Address for `--connect`, with `--port` applied when it has none
    pub fn initial_server(&self) -> Result<Option<String>, Error> {
        self.connect
            .as_deref()
            .map(|address| ServerEndpoint::parse(address, self.port).map(|e| e.to_string()))
            .transpose()
    }
}
