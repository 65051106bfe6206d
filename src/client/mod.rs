// ABOUTME: Thread-safe start/stop handle for the streaming client
// ABOUTME: Commands cross into a worker thread that runs one event loop per session

use crate::config::{ClientSettings, ServerEndpoint};
use crate::controller::{ConnectionState, Controller};
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;

/// Capacity of the worker command queue
const COMMAND_QUEUE: usize = 8;

enum Command {
    Start {
        settings: ClientSettings,
        reply: Sender<bool>,
    },
    Stop {
        reply: Sender<()>,
    },
    Exit,
}

struct ActiveSession {
    server: ServerEndpoint,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<ConnectionState>,
}

/// Snapshot reported to the control socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    /// Connection state of the current session
    pub state: ConnectionState,
    /// Server of the current session
    pub server: Option<ServerEndpoint>,
}

/// Streaming client driven by start/stop calls from any thread
///
/// Calls are serialized; `start` while streaming re-targets to the new server.
pub struct StreamingClient {
    settings: Mutex<ClientSettings>,
    commands: Sender<Command>,
    active: Arc<Mutex<Option<ActiveSession>>>,
    op_lock: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingClient {
    /// Create a client; `settings` is the template for every session
    pub fn new(settings: ClientSettings) -> Self {
        let (commands, command_rx) = bounded(COMMAND_QUEUE);
        let active = Arc::new(Mutex::new(None));

        let worker_active = Arc::clone(&active);
        let worker = thread::Builder::new()
            .name("syncast-client".to_string())
            .spawn(move || worker_loop(command_rx, worker_active))
            .map_err(|e| log::error!("Failed to spawn client worker: {}", e))
            .ok();

        Self {
            settings: Mutex::new(settings),
            commands,
            active,
            op_lock: Mutex::new(()),
            worker: Mutex::new(worker),
        }
    }

    /// Replace the template used by the next `start`
    pub fn set_settings(&self, settings: ClientSettings) {
        *self.settings.lock() = settings;
    }

    /// Start streaming from `address` (`host` or `host:port`)
    ///
    /// Addresses without a port use the port of the template's server.
    /// Returns whether the session was started; connection problems after
    /// that are retried in the background.
    pub fn start(&self, address: &str) -> bool {
        let _op = self.op_lock.lock();

        let default_port = self.settings.lock().server.port;
        let server = match ServerEndpoint::parse(address, default_port) {
            Ok(server) => server,
            Err(e) => {
                log::warn!("Refusing to start: {}", e);
                return false;
            }
        };
        if self.signal_shutdown() {
            log::info!("Re-targeting to {}", server);
        }

        let settings = self.settings.lock().clone().server(server);
        let (reply_tx, reply_rx) = bounded(1);
        if self
            .commands
            .send(Command::Start {
                settings,
                reply: reply_tx,
            })
            .is_err()
        {
            log::error!("Client worker is gone");
            return false;
        }
        reply_rx.recv().unwrap_or(false)
    }

    /// Stop streaming; returns once the session is torn down
    ///
    /// Does nothing when no session is active.
    pub fn stop(&self) {
        let _op = self.op_lock.lock();
        if !self.signal_shutdown() {
            return;
        }

        let (reply_tx, reply_rx) = bounded(1);
        if self.commands.send(Command::Stop { reply: reply_tx }).is_ok() {
            let _ = reply_rx.recv();
        }
    }

    /// Current connection state and server
    pub fn status(&self) -> ClientStatus {
        match self.active.lock().as_ref() {
            Some(session) => ClientStatus {
                state: *session.state.borrow(),
                server: Some(session.server.clone()),
            },
            None => ClientStatus {
                state: ConnectionState::Disconnected,
                server: None,
            },
        }
    }

    /// Stop streaming and join the worker thread
    pub fn shutdown(&self) {
        let _op = self.op_lock.lock();
        self.signal_shutdown();
        let _ = self.commands.send(Command::Exit);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("Client worker panicked");
            }
        }
    }

    /// Ask the running session to end; false if there is none
    fn signal_shutdown(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(session) => {
                session.shutdown.send_replace(true);
                true
            }
            None => false,
        }
    }
}

impl Drop for StreamingClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(commands: Receiver<Command>, active: Arc<Mutex<Option<ActiveSession>>>) {
    for command in commands.iter() {
        match command {
            Command::Start { settings, reply } => run_session(settings, reply, &active),
            Command::Stop { reply } => {
                let _ = reply.send(());
            }
            Command::Exit => break,
        }
    }
    log::debug!("Client worker finished");
}

fn run_session(
    settings: ClientSettings,
    reply: Sender<bool>,
    active: &Mutex<Option<ActiveSession>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build the session runtime: {}", e);
            let _ = reply.send(false);
            return;
        }
    };

    let server = settings.server.clone();
    let mut controller = Controller::new(settings);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    *active.lock() = Some(ActiveSession {
        server: server.clone(),
        shutdown: shutdown_tx,
        state: controller.subscribe(),
    });
    let _ = reply.send(true);

    if let Err(e) = runtime.block_on(controller.run(shutdown_rx)) {
        log::error!("Streaming from {} stopped: {}", server, e);
    }
    drop(controller);
    *active.lock() = None;
}
