// ABOUTME: Wire message type definitions and binary serialization
// ABOUTME: Base header, codec header, wire chunk, server settings, time, hello

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Size of the fixed base header preceding every message
pub const HEADER_SIZE: usize = 26;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Protocol version announced in the hello message
pub const STREAM_PROTOCOL_VERSION: u32 = 2;

/// Timestamp as carried on the wire (seconds + microseconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeval {
    /// Whole seconds
    pub sec: i32,
    /// Microseconds within the second
    pub usec: i32,
}

impl Timeval {
    /// Build a timestamp from signed microseconds
    pub fn from_micros(micros: i64) -> Self {
        Self {
            sec: micros.div_euclid(1_000_000) as i32,
            usec: micros.rem_euclid(1_000_000) as i32,
        }
    }

    /// Total value in microseconds
    #[inline]
    pub fn to_micros(self) -> i64 {
        self.sec as i64 * 1_000_000 + self.usec as i64
    }

    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sec.to_le_bytes());
        out.extend_from_slice(&self.usec.to_le_bytes());
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, Error> {
        Ok(Self {
            sec: reader.i32()?,
            usec: reader.i32()?,
        })
    }
}

/// Message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Bare header without payload semantics
    Base = 0,
    /// Codec name plus codec-specific header blob
    CodecHeader = 1,
    /// Timestamped chunk of encoded audio
    WireChunk = 2,
    /// Buffer and latency settings from the server
    ServerSettings = 3,
    /// Time synchronization round trip
    Time = 4,
    /// Client hello handshake
    Hello = 5,
    /// Stream metadata tags
    StreamTags = 6,
    /// Client volume/mute report
    ClientInfo = 7,
}

impl MessageType {
    /// Map a wire tag to a known message type
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Base),
            1 => Some(Self::CodecHeader),
            2 => Some(Self::WireChunk),
            3 => Some(Self::ServerSettings),
            4 => Some(Self::Time),
            5 => Some(Self::Hello),
            6 => Some(Self::StreamTags),
            7 => Some(Self::ClientInfo),
            _ => None,
        }
    }
}

/// Fixed-size header that precedes every message on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw message type tag
    pub kind: u16,
    /// Request id assigned by the sender (0 for unsolicited messages)
    pub id: u16,
    /// Id of the request this message answers
    pub refers_to: u16,
    /// Sender clock when the message left
    pub sent: Timeval,
    /// Receiver clock when the message arrived (stamped locally)
    pub received: Timeval,
    /// Exact payload length in bytes
    pub size: u32,
}

impl MessageHeader {
    /// Serialize to the 26-byte little-endian layout
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = Vec::with_capacity(HEADER_SIZE);
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.refers_to.to_le_bytes());
        self.sent.write(&mut out);
        self.received.write(&mut out);
        out.extend_from_slice(&self.size.to_le_bytes());

        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&out);
        bytes
    }

    /// Parse a header, rejecting payload sizes above [`MAX_PAYLOAD_SIZE`]
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidMessage(format!(
                "header too short: {} bytes",
                bytes.len()
            )));
        }
        let mut reader = PayloadReader::new(&bytes[..HEADER_SIZE]);
        let header = Self {
            kind: reader.u16()?,
            id: reader.u16()?,
            refers_to: reader.u16()?,
            sent: Timeval::read(&mut reader)?,
            received: Timeval::read(&mut reader)?,
            size: reader.u32()?,
        };
        if header.size > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidMessage(format!(
                "payload size {} exceeds limit",
                header.size
            )));
        }
        Ok(header)
    }

    /// Known message type, if any
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u16(self.kind)
    }
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Codec announcement, starts a new stream format
    CodecHeader(CodecHeader),
    /// Encoded audio chunk
    WireChunk(WireChunk),
    /// Server buffer/latency settings
    ServerSettings(ServerSettings),
    /// Time synchronization
    Time(Time),
    /// Client hello
    Hello(Hello),
    /// Client volume/mute report
    ClientInfo(ClientInfo),
    /// Stream tags (kept opaque)
    StreamTags(serde_json::Value),
    /// Any type tag this client does not understand
    Unknown {
        /// Raw type tag
        kind: u16,
        /// Raw payload
        payload: Vec<u8>,
    },
}

impl Message {
    /// Wire type tag for this message
    pub fn kind(&self) -> u16 {
        match self {
            Message::CodecHeader(_) => MessageType::CodecHeader as u16,
            Message::WireChunk(_) => MessageType::WireChunk as u16,
            Message::ServerSettings(_) => MessageType::ServerSettings as u16,
            Message::Time(_) => MessageType::Time as u16,
            Message::Hello(_) => MessageType::Hello as u16,
            Message::ClientInfo(_) => MessageType::ClientInfo as u16,
            Message::StreamTags(_) => MessageType::StreamTags as u16,
            Message::Unknown { kind, .. } => *kind,
        }
    }

    /// Serialize the payload (without header)
    pub fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        match self {
            Message::CodecHeader(header) => {
                write_bytes(&mut out, header.codec.as_bytes());
                write_bytes(&mut out, &header.payload);
            }
            Message::WireChunk(chunk) => {
                chunk.timestamp.write(&mut out);
                write_bytes(&mut out, &chunk.payload);
            }
            Message::ServerSettings(settings) => write_json(&mut out, settings)?,
            Message::Time(time) => time.latency.write(&mut out),
            Message::Hello(hello) => write_json(&mut out, hello)?,
            Message::ClientInfo(info) => write_json(&mut out, info)?,
            Message::StreamTags(tags) => write_json(&mut out, tags)?,
            Message::Unknown { payload, .. } => out.extend_from_slice(payload),
        }
        Ok(out)
    }

    /// Parse a payload according to its header's type tag
    pub fn decode_payload(kind: u16, payload: &[u8]) -> Result<Self, Error> {
        let mut reader = PayloadReader::new(payload);
        let message = match MessageType::from_u16(kind) {
            Some(MessageType::CodecHeader) => {
                let codec = String::from_utf8(reader.bytes()?.to_vec())
                    .map_err(|e| Error::InvalidMessage(format!("codec name: {}", e)))?;
                let payload = reader.bytes()?.to_vec();
                Message::CodecHeader(CodecHeader { codec, payload })
            }
            Some(MessageType::WireChunk) => {
                let timestamp = Timeval::read(&mut reader)?;
                let payload = reader.bytes()?.to_vec();
                Message::WireChunk(WireChunk { timestamp, payload })
            }
            Some(MessageType::ServerSettings) => {
                Message::ServerSettings(serde_json::from_slice(reader.bytes()?)?)
            }
            Some(MessageType::Time) => Message::Time(Time {
                latency: Timeval::read(&mut reader)?,
            }),
            Some(MessageType::Hello) => Message::Hello(serde_json::from_slice(reader.bytes()?)?),
            Some(MessageType::ClientInfo) => {
                Message::ClientInfo(serde_json::from_slice(reader.bytes()?)?)
            }
            Some(MessageType::StreamTags) => {
                Message::StreamTags(serde_json::from_slice(reader.bytes()?)?)
            }
            Some(MessageType::Base) | None => Message::Unknown {
                kind,
                payload: payload.to_vec(),
            },
        };
        Ok(message)
    }
}

/// A header together with its decoded message
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Wire header (size is recomputed on encode)
    pub header: MessageHeader,
    /// Message body
    pub message: Message,
}

impl Frame {
    /// Wrap a message with a fresh header
    pub fn new(message: Message) -> Self {
        Self {
            header: MessageHeader {
                kind: message.kind(),
                ..MessageHeader::default()
            },
            message,
        }
    }

    /// Set the request id
    pub fn with_id(mut self, id: u16) -> Self {
        self.header.id = id;
        self
    }

    /// Mark this frame as the response to request `id`
    pub fn refers_to(mut self, id: u16) -> Self {
        self.header.refers_to = id;
        self
    }

    /// Serialize header and payload into one buffer
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let payload = self.message.encode_payload()?;
        let header = MessageHeader {
            kind: self.message.kind(),
            size: payload.len() as u32,
            ..self.header
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a payload read after `header`
    pub fn decode(header: MessageHeader, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() != header.size as usize {
            return Err(Error::InvalidMessage(format!(
                "payload length {} does not match header size {}",
                payload.len(),
                header.size
            )));
        }
        Ok(Self {
            header,
            message: Message::decode_payload(header.kind, payload)?,
        })
    }
}

/// Codec header message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    /// Codec name (e.g. "pcm", "null")
    pub codec: String,
    /// Codec-specific header blob (RIFF header for PCM)
    pub payload: Vec<u8>,
}

/// Encoded audio chunk message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireChunk {
    /// Server time at which the first sample should be played
    pub timestamp: Timeval,
    /// Encoded audio data
    pub payload: Vec<u8>,
}

/// Server settings message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// End-to-end buffer length in milliseconds
    #[serde(rename = "bufferMs", default)]
    pub buffer_ms: i32,
    /// Latency configured for this client on the server, in milliseconds
    #[serde(default)]
    pub latency: i32,
    /// Volume (0-100)
    #[serde(default)]
    pub volume: u16,
    /// Mute state
    #[serde(default)]
    pub muted: bool,
}

/// Time sync message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Time {
    /// Client to server latency measured by the server (zero in requests)
    pub latency: Timeval,
}

/// Client hello message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// MAC address of the interface used for the connection
    #[serde(rename = "MAC")]
    pub mac: String,
    /// Host name
    #[serde(rename = "HostName")]
    pub host_name: String,
    /// Client software version
    #[serde(rename = "Version")]
    pub version: String,
    /// Client software name
    #[serde(rename = "ClientName")]
    pub client_name: String,
    /// Operating system
    #[serde(rename = "OS")]
    pub os: String,
    /// CPU architecture
    #[serde(rename = "Arch")]
    pub arch: String,
    /// Instance number when several clients run on one host
    #[serde(rename = "Instance")]
    pub instance: u32,
    /// Unique client identifier
    #[serde(rename = "ID")]
    pub id: String,
    /// Stream protocol version
    #[serde(rename = "SnapStreamProtocolVersion")]
    pub protocol_version: u32,
}

impl Default for Hello {
    fn default() -> Self {
        Self {
            mac: "00:00:00:00:00:00".to_string(),
            host_name: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            instance: 1,
            id: String::new(),
            protocol_version: STREAM_PROTOCOL_VERSION,
        }
    }
}

/// Client info message (client -> server)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Current volume (0-100)
    #[serde(default)]
    pub volume: u16,
    /// Mute state
    #[serde(default)]
    pub muted: bool,
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_json<T: Serialize>(out: &mut Vec<u8>, value: &T) -> Result<(), Error> {
    let json = serde_json::to_vec(value)?;
    write_bytes(out, &json);
    Ok(())
}

/// Bounds-checked little-endian cursor over a payload
struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::InvalidMessage(format!(
                    "truncated payload: need {} bytes at offset {}, have {}",
                    len,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        Ok(self.u32()? as i32)
    }

    fn bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
