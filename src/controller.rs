// ABOUTME: Connection state machine for one streaming session
// ABOUTME: Hello, time sync, message dispatch and reconnect with backoff

use crate::audio::{AudioOutput, Decoder, PcmChunk, SampleFormat, Stream};
use crate::config::ClientSettings;
use crate::error::Error;
use crate::host;
use crate::protocol::connection::{ResponseFuture, WireConnection};
use crate::protocol::messages::{CodecHeader, Frame, Message, ServerSettings, WireChunk};
use crate::sync::{TimeSync, QUICK_SYNC_INTERVAL, QUICK_SYNC_ROUNDS, SYNC_INTERVAL, SYNC_TIMEOUT};
use futures_util::future::OptionFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Pause between a lost connection and the next attempt
pub const RECONNECT_DELAY: Duration = Duration::from_millis(50);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, and none being attempted
    Disconnected,
    /// TCP connect and Hello in progress
    Connecting,
    /// Initial time sync burst in progress
    Syncing,
    /// Receiving and playing audio
    Streaming,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Syncing => "Syncing",
            ConnectionState::Streaming => "Streaming",
        };
        f.write_str(name)
    }
}

/// Playback objects built from a codec header
///
/// Fields drop in declaration order: the device thread stops before the
/// stream and decoder it reads from go away.
struct PlayerChain {
    output: AudioOutput,
    stream: Arc<Stream>,
    decoder: Decoder,
    format: SampleFormat,
}

/// Drives one server session: connect, sync, dispatch, reconnect
pub struct Controller {
    settings: ClientSettings,
    time_sync: Arc<TimeSync>,
    state_tx: watch::Sender<ConnectionState>,
    server_settings: Option<ServerSettings>,
    player: Option<PlayerChain>,
}

impl Controller {
    /// Create a controller for `settings`
    pub fn new(settings: ClientSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            time_sync: Arc::new(TimeSync::new()),
            state_tx,
            server_settings: None,
            player: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receive state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Settings of this session
    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Clock offset estimate shared with the playback stream
    pub fn time_sync(&self) -> &Arc<TimeSync> {
        &self.time_sync
    }

    /// Stream of the current codec header, if one was received
    pub fn stream(&self) -> Option<Arc<Stream>> {
        self.player.as_ref().map(|player| Arc::clone(&player.stream))
    }

    /// Whether the device thread of the current player is alive
    pub fn output_running(&self) -> bool {
        self.player
            .as_ref()
            .is_some_and(|player| player.output.is_running())
    }

    /// Run sessions until `shutdown` turns true or a protocol error occurs
    ///
    /// Transport errors reconnect after [`RECONNECT_DELAY`].
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        log::info!("Streaming from {}", self.settings.server);

        loop {
            let result = tokio::select! {
                result = self.run_session() => result,
                _ = shutdown_requested(&mut shutdown) => Ok(()),
            };
            self.reset().await;

            match result {
                Err(e) if e.is_fatal() => {
                    log::error!("Session with {} ended: {}", self.settings.server, e);
                    return Err(e);
                }
                Err(e) => log::warn!("Connection to {} lost: {}", self.settings.server, e),
                Ok(()) => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        log::info!("Controller stopped");
        Ok(())
    }

    /// One connection from connect to error
    async fn run_session(&mut self) -> Result<(), Error> {
        self.set_state(ConnectionState::Connecting);
        let mut connection =
            WireConnection::connect(&self.settings.server, *self.time_sync.clock()).await?;

        let result = self.serve(&mut connection).await;
        connection.disconnect();
        result
    }

    async fn serve(&mut self, connection: &mut WireConnection) -> Result<(), Error> {
        let mac = host::mac_address().unwrap_or_else(|| host::UNKNOWN_MAC.to_string());
        if self.settings.host_id.is_empty() {
            self.settings.host_id = host::host_id(&mac);
            log::info!("Using host id {}", self.settings.host_id);
        }
        let settings = connection
            .request_server_settings(host::hello(&self.settings, &mac))
            .await?;
        self.handle_message(Message::ServerSettings(settings)).await?;

        self.set_state(ConnectionState::Syncing);
        self.sync_burst(connection).await?;
        log::info!(
            "Time synced with {}: diff to server {}us, round trip {:?}",
            connection.peer(),
            self.time_sync.diff_to_server(),
            self.time_sync.round_trip()
        );

        self.set_state(ConnectionState::Streaming);
        let mut sync_timer = interval_at(Instant::now() + SYNC_INTERVAL, SYNC_INTERVAL);
        sync_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut pending_time: Option<ResponseFuture> = None;

        loop {
            tokio::select! {
                _ = sync_timer.tick() => {
                    if pending_time.is_none() {
                        pending_time = Some(connection.request_time(SYNC_TIMEOUT));
                    }
                }
                Some(response) = OptionFuture::from(pending_time.as_mut()) => {
                    pending_time = None;
                    record_time(&self.time_sync, &response?)?;
                }
                frame = connection.next_message() => {
                    self.handle_message(frame?.message).await?;
                }
            }
        }
    }

    /// Quick time sync rounds; messages arriving meanwhile are dispatched
    async fn sync_burst(&mut self, connection: &mut WireConnection) -> Result<(), Error> {
        for _ in 0..QUICK_SYNC_ROUNDS {
            let mut response = connection.request_time(SYNC_TIMEOUT);
            loop {
                tokio::select! {
                    response = &mut response => {
                        record_time(&self.time_sync, &response?)?;
                        break;
                    }
                    frame = connection.next_message() => {
                        self.handle_message(frame?.message).await?;
                    }
                }
            }
            tokio::time::sleep(QUICK_SYNC_INTERVAL).await;
        }
        Ok(())
    }

    /// Dispatch one unsolicited message from the server
    pub async fn handle_message(&mut self, message: Message) -> Result<(), Error> {
        match message {
            Message::CodecHeader(header) => self.on_codec_header(&header).await,
            Message::ServerSettings(settings) => {
                log::info!(
                    "Server settings: buffer {}ms, latency {}ms, volume {}, muted {}",
                    settings.buffer_ms,
                    settings.latency,
                    settings.volume,
                    settings.muted
                );
                self.server_settings = Some(settings);
                if let Some(player) = &self.player {
                    player.stream.set_buffer_len(self.buffer_target());
                }
                Ok(())
            }
            Message::WireChunk(chunk) => {
                self.on_wire_chunk(chunk);
                Ok(())
            }
            other => {
                log::debug!("Ignoring message of type {}", other.kind());
                Ok(())
            }
        }
    }

    async fn on_codec_header(&mut self, header: &CodecHeader) -> Result<(), Error> {
        log::info!("Codec header: {}", header.codec);
        self.stop_player().await;

        let mut decoder = Decoder::for_codec(&header.codec)?;
        let format = decoder.set_header(header)?;
        let stream = Arc::new(
            Stream::new(format, Arc::clone(&self.time_sync))
                .with_resync_threshold(self.settings.player.resync_threshold),
        );
        stream.set_buffer_len(self.buffer_target());

        let mut output = AudioOutput::new(&self.settings.player, Arc::clone(&stream));
        output.start().await?;
        log::info!(
            "Playing {} at {} with a {:?} buffer",
            decoder.name(),
            format,
            stream.buffer_len()
        );

        self.player = Some(PlayerChain {
            output,
            stream,
            decoder,
            format,
        });
        Ok(())
    }

    fn on_wire_chunk(&mut self, chunk: WireChunk) {
        let Some(player) = self.player.as_mut() else {
            log::debug!("Dropping chunk received before a codec header");
            return;
        };
        let mut pcm = PcmChunk::new(chunk.timestamp, chunk.payload, player.format);
        if player.decoder.decode(&mut pcm) {
            player.stream.add_chunk(pcm);
        } else {
            log::debug!("Dropping chunk that failed to decode");
        }
    }

    /// End-to-end buffer the stream aims for
    fn buffer_target(&self) -> Duration {
        let Some(settings) = &self.server_settings else {
            return Duration::ZERO;
        };
        let ms = settings.buffer_ms as i64
            - settings.latency as i64
            - self.settings.player.latency_ms as i64;
        Duration::from_millis(ms.max(0) as u64)
    }

    async fn stop_player(&mut self) {
        if let Some(mut player) = self.player.take() {
            player.output.stop().await;
        }
    }

    async fn reset(&mut self) {
        self.stop_player().await;
        self.server_settings = None;
        self.time_sync.reset();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Connection state: {} -> {}", current, state);
            *current = state;
            true
        });
    }
}

fn record_time(time_sync: &TimeSync, frame: &Frame) -> Result<(), Error> {
    let Message::Time(time) = &frame.message else {
        return Err(Error::InvalidMessage(format!(
            "expected time response, got message type {}",
            frame.header.kind
        )));
    };
    time_sync.record_round_trip(frame.header.sent, frame.header.received, time.latency);
    Ok(())
}

/// Resolves once the shutdown flag is set or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
