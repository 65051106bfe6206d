use std::time::Duration;
use syncast::audio::decode::riff_header;
use syncast::audio::SampleFormat;
use syncast::protocol::messages::{CodecHeader, Frame, Message, ServerSettings, Time, WireChunk};
use syncast::protocol::connection::INBOUND_QUEUE;
use syncast::protocol::{read_frame, write_frame, Timeval};
use syncast::sync::LocalClock;
use syncast::{
    ClientSettings, ConnectionState, Controller, PlayerBackend, PlayerSettings, ServerEndpoint,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const CHUNKS: usize = 10;
const CHUNK_FRAMES: usize = 480;

fn format() -> SampleFormat {
    SampleFormat::new(48000, 16, 2)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn settings(port: u16) -> ClientSettings {
    ClientSettings::new(ServerEndpoint::new("127.0.0.1", port))
        .player(PlayerSettings::default().backend(PlayerBackend::Null))
        .host_id("session-test")
}

async fn send(socket: &mut TcpStream, clock: &LocalClock, frame: Frame) {
    write_frame(socket, frame, clock.now()).await.unwrap();
}

/// Read the client's Hello and answer it with server settings
async fn greet(socket: &mut TcpStream, clock: &LocalClock) {
    let hello = read_frame(socket, || clock.now()).await.unwrap();
    let Message::Hello(body) = &hello.message else {
        panic!("expected hello, got {:?}", hello.message);
    };
    assert_eq!(body.id, "session-test");

    let settings = ServerSettings {
        buffer_ms: 1000,
        latency: 0,
        volume: 100,
        muted: false,
    };
    send(
        socket,
        clock,
        Frame::new(Message::ServerSettings(settings)).refers_to(hello.header.id),
    )
    .await;
}

/// Minimal server: greets, streams `chunks` chunks far in the future and answers time requests
async fn serve_audio(listener: TcpListener, chunks: usize) {
    let clock = LocalClock::new();
    let (mut socket, _) = listener.accept().await.unwrap();
    greet(&mut socket, &clock).await;

    send(
        &mut socket,
        &clock,
        Frame::new(Message::CodecHeader(CodecHeader {
            codec: "pcm".to_string(),
            payload: riff_header(format()),
        })),
    )
    .await;
    let start = clock.now_micros() + 60_000_000;
    for i in 0..chunks {
        let chunk = WireChunk {
            timestamp: Timeval::from_micros(start + i as i64 * 10_000),
            payload: vec![1; CHUNK_FRAMES * format().frame_size()],
        };
        send(&mut socket, &clock, Frame::new(Message::WireChunk(chunk))).await;
    }

    while let Ok(request) = read_frame(&mut socket, || clock.now()).await {
        if let Message::Time(_) = request.message {
            let latency = Timeval::from_micros(
                request.header.received.to_micros() - request.header.sent.to_micros(),
            );
            send(
                &mut socket,
                &clock,
                Frame::new(Message::Time(Time { latency })).refers_to(request.header.id),
            )
            .await;
        }
    }
}

#[tokio::test]
async fn test_session_streams_audio() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(serve_audio(listener, CHUNKS));

    let mut controller = Controller::new(settings(port));
    let mut state = controller.subscribe();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        result = controller.run(shutdown_rx) => panic!("controller exited: {:?}", result),
        _ = async {
            state.wait_for(|s| *s == ConnectionState::Streaming).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        } => {}
    }

    assert!(controller.time_sync().samples() >= 50);
    assert!(controller.output_running());
    let stream = controller.stream().expect("player built from the codec header");
    assert_eq!(stream.format(), format());
    assert_eq!(stream.buffered_frames(), CHUNKS * CHUNK_FRAMES);
    assert_eq!(stream.buffer_len(), Duration::from_millis(1000));
}

#[tokio::test]
async fn test_session_syncs_through_a_chunk_flood() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // More chunks than the inbound queue holds, all ahead of the first time response
    let chunks = 3 * INBOUND_QUEUE;
    tokio::spawn(serve_audio(listener, chunks));

    let mut controller = Controller::new(settings(port));
    let mut state = controller.subscribe();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        result = controller.run(shutdown_rx) => panic!("controller exited: {:?}", result),
        _ = async {
            tokio::time::timeout(
                Duration::from_secs(10),
                state.wait_for(|s| *s == ConnectionState::Streaming),
            )
            .await
            .expect("sync burst completes")
            .unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        } => {}
    }

    let stream = controller.stream().expect("player built from the codec header");
    assert_eq!(stream.buffered_frames(), chunks * CHUNK_FRAMES);
}

#[tokio::test]
async fn test_session_reconnects_after_drop() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut controller = Controller::new(settings(port));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = async {
        let clock = LocalClock::new();
        let (mut first, _) = listener.accept().await.unwrap();
        greet(&mut first, &clock).await;
        drop(first);

        let (mut second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("client reconnects")
            .unwrap();
        let hello = read_frame(&mut second, || clock.now()).await.unwrap();
        assert!(matches!(hello.message, Message::Hello(_)));
        shutdown_tx.send(true).unwrap();
    };

    let (result, ()) = tokio::join!(controller.run(shutdown_rx), server);
    assert!(result.is_ok());
    assert_eq!(controller.state(), ConnectionState::Disconnected);
    assert!(controller.stream().is_none());
}

#[tokio::test]
async fn test_unknown_codec_ends_session() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let clock = LocalClock::new();
        let (mut socket, _) = listener.accept().await.unwrap();
        greet(&mut socket, &clock).await;
        send(
            &mut socket,
            &clock,
            Frame::new(Message::CodecHeader(CodecHeader {
                codec: "mp3".to_string(),
                payload: Vec::new(),
            })),
        )
        .await;
        // Keep answering so the sync burst completes
        while let Ok(request) = read_frame(&mut socket, || clock.now()).await {
            send(
                &mut socket,
                &clock,
                Frame::new(Message::Time(Time::default())).refers_to(request.header.id),
            )
            .await;
        }
    });

    let mut controller = Controller::new(settings(port));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), controller.run(shutdown_rx))
        .await
        .expect("controller gives up");
    assert!(matches!(result, Err(syncast::error::Error::UnsupportedCodec(_))));
}
