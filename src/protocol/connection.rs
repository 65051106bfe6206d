// ABOUTME: Client-side TCP connection to the audio server
// ABOUTME: Reader/writer tasks, request id correlation and response timeouts

use crate::config::ServerEndpoint;
use crate::error::Error;
use crate::protocol::messages::{Frame, Hello, Message, MessageType, ServerSettings, Time};
use crate::protocol::{read_frame, write_frame};
use crate::sync::LocalClock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Upper bound for establishing the TCP connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the server to answer the Hello
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// Unsolicited frames held before the reader stops draining the socket
pub const INBOUND_QUEUE: usize = 256;

/// Future resolving to the response of a request
///
/// Owns everything it needs, so it can be held across `next_message` calls.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Result<Frame, Error>> + Send>>;

type PendingMap = Arc<Mutex<HashMap<u16, oneshot::Sender<Result<Frame, Error>>>>>;

/// Framed connection to a server
///
/// Inbound frames whose `refers_to` matches an outstanding request complete
/// that request; every other frame is queued for [`WireConnection::next_message`].
/// A full queue pauses the reader, so a slow consumer pushes back on the
/// server through TCP flow control. Responses queued behind it wait too.
pub struct WireConnection {
    peer: String,
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: mpsc::Receiver<Result<Frame, Error>>,
    pending: PendingMap,
    next_id: AtomicU16,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WireConnection {
    /// Connect to `endpoint` and start the I/O tasks on the current runtime
    ///
    /// Every inbound header is stamped with `clock` on arrival and every
    /// outbound header right before it is written.
    pub async fn connect(endpoint: &ServerEndpoint, clock: LocalClock) -> Result<Self, Error> {
        let address = endpoint.to_string();
        log::debug!("Connecting to {}", address);

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address.as_str()))
            .await
            .map_err(|_| Error::Timeout(format!("connection to {}", address)))?
            .map_err(|e| Error::Connection(format!("connect to {}: {}", address, e)))?;

        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or(address);

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(read_loop(
            read_half,
            clock,
            Arc::clone(&pending),
            inbound_tx.clone(),
        ));
        let writer = tokio::spawn(write_loop(write_half, clock, outbound_rx, inbound_tx));

        log::info!("Connected to {}", peer);

        Ok(Self {
            peer,
            outbound: outbound_tx,
            inbound: inbound_rx,
            pending,
            next_id: AtomicU16::new(1),
            reader,
            writer,
        })
    }

    /// Address of the server
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a message that expects no response
    pub fn send(&self, message: Message) -> Result<(), Error> {
        self.enqueue(Frame::new(message))
    }

    /// Queue a request and return a future for its response
    pub fn send_request(&self, message: Message, timeout: Duration) -> ResponseFuture {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.enqueue(Frame::new(message).with_id(id)) {
            self.pending.lock().remove(&id);
            return Box::pin(async move { Err(e) });
        }

        let pending = Arc::clone(&self.pending);
        Box::pin(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::Connection(
                    "connection closed before response".to_string(),
                )),
                Err(_) => {
                    pending.lock().remove(&id);
                    Err(Error::Timeout(format!("response to request {}", id)))
                }
            }
        })
    }

    /// Send the Hello and wait for the server settings it is answered with
    pub async fn request_server_settings(&self, hello: Hello) -> Result<ServerSettings, Error> {
        let frame = self
            .send_request(Message::Hello(hello), HELLO_TIMEOUT)
            .await?;
        match frame.message {
            Message::ServerSettings(settings) => Ok(settings),
            other => Err(Error::InvalidMessage(format!(
                "expected server settings, got message type {}",
                other.kind()
            ))),
        }
    }

    /// Send a time request
    ///
    /// The returned frame carries the server's `sent` stamp, the local
    /// `received` stamp and the latency the server measured.
    pub fn request_time(&self, timeout: Duration) -> ResponseFuture {
        let response = self.send_request(Message::Time(Time::default()), timeout);
        Box::pin(async move {
            let frame = response.await?;
            if frame.header.message_type() != Some(MessageType::Time) {
                return Err(Error::InvalidMessage(format!(
                    "expected time response, got message type {}",
                    frame.header.kind
                )));
            }
            Ok(frame)
        })
    }

    /// Next frame that is not a response to a request
    pub async fn next_message(&mut self) -> Result<Frame, Error> {
        match self.inbound.recv().await {
            Some(result) => result,
            None => Err(Error::Connection("connection closed".to_string())),
        }
    }

    /// Stop the I/O tasks and fail all outstanding requests
    pub fn disconnect(&mut self) {
        self.reader.abort();
        self.writer.abort();
        fail_pending(&self.pending, "disconnected");
        self.inbound.close();
    }

    fn enqueue(&self, frame: Frame) -> Result<(), Error> {
        self.outbound
            .send(frame)
            .map_err(|_| Error::Connection("connection closed".to_string()))
    }

    fn next_request_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            // 0 means "not a response" in refers_to
            if id != 0 {
                return id;
            }
        }
    }
}

impl Drop for WireConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    for (_, waiter) in pending.lock().drain() {
        let _ = waiter.send(Err(Error::Connection(reason.to_string())));
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    clock: LocalClock,
    pending: PendingMap,
    inbound: mpsc::Sender<Result<Frame, Error>>,
) {
    loop {
        match read_frame(&mut reader, || clock.now()).await {
            Ok(frame) => {
                let waiter = match frame.header.refers_to {
                    0 => None,
                    id => pending.lock().remove(&id),
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(frame));
                    }
                    None => {
                        if inbound.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                log::debug!("Read loop ended: {}", e);
                fail_pending(&pending, &e.to_string());
                let _ = inbound.send(Err(e)).await;
                break;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    clock: LocalClock,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::Sender<Result<Frame, Error>>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, frame, clock.now()).await {
            log::debug!("Write loop ended: {}", e);
            let _ = inbound.send(Err(e)).await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{CodecHeader, Timeval, WireChunk};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ServerEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, ServerEndpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let result = WireConnection::connect(&endpoint, LocalClock::new()).await;
        assert!(matches!(
            result,
            Err(Error::Connection(_)) | Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_response_is_routed_by_refers_to() {
        let (listener, endpoint) = listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut socket, Timeval::default).await.unwrap();
            assert_eq!(request.header.kind, MessageType::Hello as u16);

            // An unsolicited message first, then the response
            let codec = Frame::new(Message::CodecHeader(CodecHeader {
                codec: "null".to_string(),
                payload: Vec::new(),
            }));
            write_frame(&mut socket, codec, Timeval::default()).await.unwrap();

            let settings = Frame::new(Message::ServerSettings(ServerSettings {
                buffer_ms: 1000,
                latency: 10,
                ..Default::default()
            }))
            .refers_to(request.header.id);
            write_frame(&mut socket, settings, Timeval::default()).await.unwrap();
            socket
        });

        let mut connection = WireConnection::connect(&endpoint, LocalClock::new())
            .await
            .unwrap();
        let settings = connection
            .request_server_settings(Hello::default())
            .await
            .unwrap();
        assert_eq!(settings.buffer_ms, 1000);

        let unsolicited = connection.next_message().await.unwrap();
        assert!(matches!(unsolicited.message, Message::CodecHeader(_)));

        let _socket = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_flood_is_delivered_in_order() {
        let (listener, endpoint) = listener().await;
        let count = 2 * INBOUND_QUEUE;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            for i in 0..count {
                let chunk = Frame::new(Message::WireChunk(WireChunk {
                    timestamp: Timeval::from_micros(i as i64),
                    payload: vec![0; 4],
                }));
                write_frame(&mut socket, chunk, Timeval::default()).await.unwrap();
            }
            let request = read_frame(&mut socket, Timeval::default).await.unwrap();
            let response = Frame::new(Message::Time(Time::default())).refers_to(request.header.id);
            write_frame(&mut socket, response, Timeval::default()).await.unwrap();
            socket
        });

        let mut connection = WireConnection::connect(&endpoint, LocalClock::new())
            .await
            .unwrap();
        // Let the queue fill up and the reader stall
        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = connection.request_time(Duration::from_secs(5));

        for i in 0..count {
            let frame = connection.next_message().await.unwrap();
            let Message::WireChunk(chunk) = frame.message else {
                panic!("expected chunk {}, got {:?}", i, frame.message);
            };
            assert_eq!(chunk.timestamp.to_micros(), i as i64);
        }
        // The response was behind the flood and arrives once it is drained
        assert!(response.await.is_ok());

        let _socket = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(socket);
        });

        let connection = WireConnection::connect(&endpoint, LocalClock::new())
            .await
            .unwrap();
        let result = connection
            .request_time(Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(connection.pending.lock().is_empty());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_socket_fails_next_message() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let mut connection = WireConnection::connect(&endpoint, LocalClock::new())
            .await
            .unwrap();
        server.await.unwrap();

        let result = connection.next_message().await;
        assert!(matches!(result, Err(Error::Connection(_))));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(socket);
        });

        let mut connection = WireConnection::connect(&endpoint, LocalClock::new())
            .await
            .unwrap();
        let response = connection.request_time(Duration::from_secs(5));
        connection.disconnect();

        assert!(matches!(response.await, Err(Error::Connection(_))));
        server.await.unwrap();
    }
}
