// ABOUTME: Unix socket control server
// ABOUTME: Accepts controlling processes and maps their commands onto the client

use crate::client::StreamingClient;
use crate::control::frame::{read_control_frame, write_control_response, ControlCommand, ControlResponse};
use crate::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

/// Default socket path, relative to the working directory
pub const DEFAULT_SOCKET_PATH: &str = "./syncast-control.sock";

/// Control socket server
pub struct ControlServer {
    path: PathBuf,
    client: Arc<StreamingClient>,
}

impl ControlServer {
    /// Create a server for `client` on the socket at `path`
    pub fn new(path: impl Into<PathBuf>, client: Arc<StreamingClient>) -> Self {
        Self {
            path: path.into(),
            client,
        }
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bind the socket and serve connections until `shutdown` turns true
    ///
    /// A stale socket file from a previous run is replaced.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        let listener = UnixListener::bind(&self.path)?;
        log::info!("Control socket listening on {}", self.path.display());

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, _)) => {
                            log::debug!("Control connection accepted");
                            tokio::spawn(handle_connection(socket, Arc::clone(&self.client)));
                        }
                        Err(e) => log::warn!("Failed to accept control connection: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        drop(listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::debug!("Failed to remove {}: {}", self.path.display(), e);
        }
        log::info!("Control socket closed");
        Ok(())
    }
}

/// Serve one controlling process until it disconnects, sends STOP or misbehaves
pub async fn handle_connection(mut socket: UnixStream, client: Arc<StreamingClient>) {
    loop {
        let body = match read_control_frame(&mut socket).await {
            Ok(Some(body)) => body,
            Ok(None) => {
                log::debug!("Control connection closed by peer");
                return;
            }
            Err(e) => {
                log::warn!("Dropping control connection: {}", e);
                return;
            }
        };

        let command = match ControlCommand::parse(&body) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Dropping control connection: {}", e);
                return;
            }
        };
        log::info!("Control command: {:?}", command);

        let (response, close) = match execute(command, Arc::clone(&client)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("Control command failed: {}", e);
                return;
            }
        };

        if let Err(e) = write_control_response(&mut socket, &response).await {
            log::warn!("Failed to answer control command: {}", e);
            return;
        }
        if close {
            return;
        }
    }
}

/// Run a command against the client; the flag asks to close the connection
async fn execute(
    command: ControlCommand,
    client: Arc<StreamingClient>,
) -> Result<(ControlResponse, bool), Error> {
    // Client calls block until the worker thread answers
    tokio::task::spawn_blocking(move || match command {
        ControlCommand::Start { server } => (ControlResponse::started(client.start(&server)), false),
        ControlCommand::Stop => {
            client.stop();
            (ControlResponse::stopped(), true)
        }
        ControlCommand::Report => {
            let status = client.status();
            let server = status
                .server
                .map(|server| server.to_string())
                .unwrap_or_default();
            (ControlResponse::report(status.state.to_string(), server), false)
        }
    })
    .await
    .map_err(|e| Error::Io(std::io::Error::other(e)))
}
