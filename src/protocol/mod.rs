// ABOUTME: Protocol module for the server connection
// ABOUTME: Wire messages, async framing and the client-side connection

/// Client connection with request/response correlation
pub mod connection;
/// Wire message definitions and binary layout
pub mod messages;

use crate::error::Error;
use messages::{Frame, MessageHeader, HEADER_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use connection::{ResponseFuture, WireConnection};
pub use messages::{Message, MessageType, Timeval};

/// Read one complete frame (header + exact payload) from `reader`
///
/// `received` is written into the header before the payload is decoded, so
/// callers get the local arrival time of every message.
pub async fn read_frame<R>(reader: &mut R, received: impl FnOnce() -> Timeval) -> Result<Frame, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(|e| Error::Connection(format!("read header: {}", e)))?;

    let mut header = MessageHeader::decode(&header_buf)?;
    header.received = received();

    let mut payload = vec![0u8; header.size as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Connection(format!("read payload: {}", e)))?;

    Frame::decode(header, &payload)
}

/// Stamp `sent` and write one frame to `writer`
pub async fn write_frame<W>(writer: &mut W, mut frame: Frame, sent: Timeval) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    frame.header.sent = sent;
    let bytes = frame.encode()?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| Error::Connection(format!("write: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Connection(format!("flush: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::messages::{CodecHeader, Time};
    use super::*;

    #[tokio::test]
    async fn test_read_frame_stamps_received() {
        let frame = Frame::new(Message::Time(Time {
            latency: Timeval { sec: 0, usec: 250 },
        }))
        .with_id(7);
        let bytes = frame.encode().unwrap();

        let mut mock = tokio_test::io::Builder::new().read(&bytes).build();
        let decoded = read_frame(&mut mock, || Timeval { sec: 5, usec: 6 })
            .await
            .unwrap();

        assert_eq!(decoded.header.id, 7);
        assert_eq!(decoded.header.received, Timeval { sec: 5, usec: 6 });
        assert_eq!(decoded.message, frame.message);
    }

    #[tokio::test]
    async fn test_read_frame_split_reads() {
        let frame = Frame::new(Message::CodecHeader(CodecHeader {
            codec: "pcm".to_string(),
            payload: vec![1, 2, 3, 4],
        }));
        let bytes = frame.encode().unwrap();

        // Header and payload arrive in separate segments
        let mut mock = tokio_test::io::Builder::new()
            .read(&bytes[..10])
            .read(&bytes[10..HEADER_SIZE + 3])
            .read(&bytes[HEADER_SIZE + 3..])
            .build();
        let decoded = read_frame(&mut mock, Timeval::default).await.unwrap();
        assert_eq!(decoded.message, frame.message);
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_connection_error() {
        let mut mock = tokio_test::io::Builder::new().read(&[0u8; 5]).build();
        let result = read_frame(&mut mock, Timeval::default).await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_write_frame_stamps_sent() {
        let mut expected = Frame::new(Message::Time(Time::default())).with_id(3);
        expected.header.sent = Timeval { sec: 9, usec: 1 };
        let bytes = expected.encode().unwrap();

        let mut mock = tokio_test::io::Builder::new().write(&bytes).build();
        write_frame(
            &mut mock,
            Frame::new(Message::Time(Time::default())).with_id(3),
            Timeval { sec: 9, usec: 1 },
        )
        .await
        .unwrap();
    }
}
