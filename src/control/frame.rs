// ABOUTME: Control socket framing and command payloads
// ABOUTME: Big-endian key/size header followed by a JSON command or response

use crate::error::Error;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic value that starts every control frame
pub const FRAME_KEY: u32 = 0x9876;

/// Size of the key/size header
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest accepted JSON body
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Command number of START
pub const CMD_START: u32 = 1;
/// Command number of STOP
pub const CMD_STOP: u32 = 2;
/// Command number of REPORT
pub const CMD_REPORT: u32 = 3;

/// Command sent by the controlling process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Stream from `server` (`host` or `host:port`)
    Start {
        /// Server address
        server: String,
    },
    /// Stop streaming and close the control connection
    Stop,
    /// Report connection state
    Report,
}

#[derive(Deserialize)]
struct RawCommand {
    #[serde(rename = "Cmd")]
    cmd: u32,
    #[serde(rename = "SnapServerIPAddr", default)]
    server: Option<String>,
}

impl ControlCommand {
    /// Parse a JSON command body
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let raw: RawCommand = serde_json::from_slice(body)?;
        match raw.cmd {
            CMD_START => raw
                .server
                .map(|server| ControlCommand::Start { server })
                .ok_or_else(|| Error::InvalidMessage("START without SnapServerIPAddr".to_string())),
            CMD_STOP => Ok(ControlCommand::Stop),
            CMD_REPORT => Ok(ControlCommand::Report),
            other => Err(Error::InvalidMessage(format!(
                "unknown control command {}",
                other
            ))),
        }
    }
}

/// Response to a control command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Command being answered
    #[serde(rename = "Cmd")]
    pub cmd: u32,
    /// 1 on success, 0 on failure (START only)
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none", default)]
    pub result: Option<u8>,
    /// Connection state (REPORT only)
    #[serde(rename = "State", skip_serializing_if = "Option::is_none", default)]
    pub state: Option<String>,
    /// Current server (REPORT only)
    #[serde(rename = "Server", skip_serializing_if = "Option::is_none", default)]
    pub server: Option<String>,
}

impl ControlResponse {
    /// Answer to START
    pub fn started(success: bool) -> Self {
        Self {
            cmd: CMD_START,
            result: Some(success as u8),
            state: None,
            server: None,
        }
    }

    /// Answer to STOP
    pub fn stopped() -> Self {
        Self {
            cmd: CMD_STOP,
            result: None,
            state: None,
            server: None,
        }
    }

    /// Answer to REPORT
    pub fn report(state: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            cmd: CMD_REPORT,
            result: None,
            state: Some(state.into()),
            server: Some(server.into()),
        }
    }
}

/// Read one frame body; `None` on a clean end of stream before a header
pub async fn read_control_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Connection("control frame header truncated".to_string()));
        }
        filled += n;
    }

    let key = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if key != FRAME_KEY {
        return Err(Error::InvalidMessage(format!("bad control frame key {:#x}", key)));
    }
    let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if size > MAX_FRAME_SIZE {
        return Err(Error::InvalidMessage(format!(
            "control frame of {} bytes exceeds {}",
            size, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Encode a frame around `body`
pub fn encode_control_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&FRAME_KEY.to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Serialize and write a response
pub async fn write_control_response<W>(writer: &mut W, response: &ControlResponse) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(response)?;
    writer.write_all(&encode_control_frame(&body)).await?;
    writer.flush().await?;
    Ok(())
}
