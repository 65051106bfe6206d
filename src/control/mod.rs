// ABOUTME: Local control interface
// ABOUTME: Framed JSON commands (start, stop, report) over a Unix stream socket

/// Frame codec and command payloads
pub mod frame;
/// Socket accept loop and command execution
pub mod server;

pub use frame::{ControlCommand, ControlResponse};
pub use server::{ControlServer, DEFAULT_SOCKET_PATH};
