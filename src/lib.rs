// ABOUTME: Main library entry point for syncast
// ABOUTME: Exports the streaming client, playback pipeline and control surface

//! # syncast
//!
//! Synchronized PCM streaming client for Snapcast-compatible audio servers.
//!
//! The client connects to a server over TCP, keeps its clock aligned with the
//! server clock, buffers timestamped PCM chunks and plays them out through a
//! local audio device so that every client in a room hears the same sample at
//! the same time.
//!
//! ## Features
//!
//! - **Controller**: connection state machine (hello, time sync, dispatch, reconnect)
//! - **Stream**: jitter buffer that turns server timestamps into local deadlines
//! - **AudioOutput**: device loop that adapts to device buffering and stalls
//! - **StreamingClient**: thread-safe `start`/`stop` handle for a control process
//!
//! ## Example: Streaming from a server
//!
//! ```no_run
//! use syncast::{ClientSettings, StreamingClient};
//!
//! let client = StreamingClient::new(ClientSettings::default());
//! if client.start("192.168.1.10") {
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//! }
//! client.stop();
//! ```

#![warn(missing_docs)]

/// Audio types, decoding, buffering and device output
pub mod audio;
/// Command-line arguments for the client binary
pub mod cli;
/// Thread-safe start/stop handle around the streaming worker
pub mod client;
/// Local control socket protocol and server
pub mod control;
/// Connection state machine driving the playback pipeline
pub mod controller;
/// Client configuration
pub mod config;
/// Host identity reported to the server
pub mod host;
/// Wire protocol implementation for the server connection
pub mod protocol;
/// Clock synchronization with the server
pub mod sync;

pub use audio::{Decoder, SampleFormat, Stream};
pub use client::StreamingClient;
pub use config::{ClientSettings, PlayerBackend, PlayerSettings, ServerEndpoint};
pub use controller::{ConnectionState, Controller};
pub use protocol::connection::WireConnection;
pub use sync::TimeSync;

/// Result type for syncast operations
pub type Result<T> = std::result::Result<T, error::Error>;

/// Error types for syncast
pub mod error {
    use thiserror::Error;

    /// Error types for syncast operations
    #[derive(Error, Debug)]
    pub enum Error {
        /// Connection-related error (connect, read, write, closed socket)
        #[error("Connection error: {0}")]
        Connection(String),

        /// A request did not receive its response in time
        #[error("Timeout waiting for {0}")]
        Timeout(String),

        /// Malformed header or unexpected message on the wire
        #[error("Invalid message: {0}")]
        InvalidMessage(String),

        /// Protocol violation that ends the current session
        #[error("Protocol error: {0}")]
        Protocol(String),

        /// The server announced a codec this client cannot decode
        #[error("Codec not supported: \"{0}\"")]
        UnsupportedCodec(String),

        /// Audio output error
        #[error("Audio output error: {0}")]
        Output(String),

        /// Audio device error
        #[error("Audio device error: {0}")]
        Device(#[from] crate::audio::output::DeviceError),

        /// Invalid configuration value
        #[error("Configuration error: {0}")]
        Config(String),

        /// Underlying I/O error
        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        /// JSON payload could not be encoded or decoded
        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),
    }

    impl Error {
        /// Whether the error ends the streaming session instead of triggering a reconnect
        pub fn is_fatal(&self) -> bool {
            matches!(
                self,
                Error::Protocol(_) | Error::UnsupportedCodec(_) | Error::Config(_)
            )
        }
    }
}
