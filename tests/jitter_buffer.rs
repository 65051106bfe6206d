use std::sync::Arc;
use std::time::Duration;
use syncast::audio::{PcmChunk, SampleFormat, Stream};
use syncast::protocol::Timeval;
use syncast::sync::TimeSync;

const CHUNK_FRAMES: usize = 480;

fn format() -> SampleFormat {
    SampleFormat::new(48000, 16, 2)
}

fn chunk(start_us: i64, marker: u8) -> PcmChunk {
    PcmChunk::new(
        Timeval::from_micros(start_us),
        vec![marker; CHUNK_FRAMES * format().frame_size()],
        format(),
    )
}

fn new_stream() -> (Arc<TimeSync>, Stream) {
    let sync = Arc::new(TimeSync::new());
    let stream = Stream::new(format(), Arc::clone(&sync));
    (sync, stream)
}

#[test]
fn test_contiguous_chunks_are_delivered_in_order() {
    let sync = Arc::new(TimeSync::new());
    let stream = Stream::new(format(), Arc::clone(&sync))
        .with_resync_threshold(Duration::from_secs(3600));

    // In the future: reads return silence until the first frame is due, nothing is dropped
    let start = sync.server_now_micros() + 50_000;
    for i in 0..10u8 {
        stream.add_chunk(chunk(start + i as i64 * 10_000, i + 1));
    }

    let mut played = Vec::new();
    let mut out = Vec::new();
    loop {
        let frames = stream.buffered_frames().min(CHUNK_FRAMES);
        if frames == 0 {
            break;
        }
        assert!(stream.get_player_chunk(&mut out, Duration::ZERO, frames));
        assert_eq!(out.len(), frames * format().frame_size());
        played.extend(out.iter().copied().filter(|&b| b != 0));
    }

    assert_eq!(played.len(), 10 * CHUNK_FRAMES * format().frame_size());
    assert!(played.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(played.first(), Some(&1));
    assert_eq!(played.last(), Some(&10));
}

#[test]
fn test_short_buffer_fails_without_writing() {
    let (sync, stream) = new_stream();
    stream.add_chunk(chunk(sync.server_now_micros(), 1));

    let mut out = vec![9u8; 16];
    assert!(!stream.get_player_chunk(&mut out, Duration::ZERO, CHUNK_FRAMES + 1));
    assert_eq!(out, vec![9u8; 16]);
    assert_eq!(stream.buffered_frames(), CHUNK_FRAMES);
    assert!(!stream.is_playing());
}

#[test]
fn test_early_chunk_yields_silence_without_consuming() {
    let (sync, stream) = new_stream();
    stream.add_chunk(chunk(sync.server_now_micros() + 10_000_000, 7));

    let mut out = Vec::new();
    assert!(stream.get_player_chunk(&mut out, Duration::ZERO, 240));
    assert_eq!(out.len(), 240 * format().frame_size());
    assert!(out.iter().all(|&b| b == 0));
    assert_eq!(stream.buffered_frames(), CHUNK_FRAMES);
    assert!(!stream.is_playing());
}

#[test]
fn test_stale_chunks_are_dropped() {
    let (sync, stream) = new_stream();
    let now = sync.server_now_micros();
    stream.add_chunk(chunk(now - 10_000_000, 1));
    stream.add_chunk(chunk(now - 9_990_000, 2));

    let mut out = Vec::new();
    assert!(!stream.get_player_chunk(&mut out, Duration::ZERO, 240));
    assert_eq!(stream.buffered_frames(), 0);
}

#[test]
fn test_stale_drop_keeps_future_chunk() {
    let (sync, stream) = new_stream();
    let now = sync.server_now_micros();
    stream.add_chunk(chunk(now - 1_000_000, 1));
    stream.add_chunk(chunk(now + 1_000_000, 2));

    let mut out = Vec::new();
    assert!(stream.get_player_chunk(&mut out, Duration::ZERO, 240));
    assert!(out.iter().all(|&b| b == 0));
    assert_eq!(stream.buffered_frames(), CHUNK_FRAMES);
}

#[test]
fn test_buffer_len_delays_playback() {
    let (sync, stream) = new_stream();
    stream.set_buffer_len(Duration::from_secs(5));
    // Half a second old, but inside the 5s buffer: still early
    stream.add_chunk(chunk(sync.server_now_micros() - 500_000, 3));

    let mut out = Vec::new();
    assert!(stream.get_player_chunk(&mut out, Duration::ZERO, 240));
    assert!(out.iter().all(|&b| b == 0));
    assert_eq!(stream.buffered_frames(), CHUNK_FRAMES);
    assert_eq!(stream.buffer_len(), Duration::from_secs(5));
}

#[test]
fn test_clear_chunks_empties_the_buffer() {
    let (sync, stream) = new_stream();
    let now = sync.server_now_micros();
    for i in 0..4 {
        stream.add_chunk(chunk(now + i * 10_000, 1));
    }
    assert_eq!(stream.buffered_duration(), Duration::from_millis(40));

    stream.clear_chunks();
    assert_eq!(stream.buffered_frames(), 0);
    let mut out = Vec::new();
    assert!(!stream.get_player_chunk(&mut out, Duration::ZERO, 1));
}

#[test]
fn test_wait_for_chunk_wakes_on_add() {
    let (sync, stream) = new_stream();
    let stream = Arc::new(stream);

    let writer = Arc::clone(&stream);
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        writer.add_chunk(chunk(sync.server_now_micros(), 1));
    });

    assert!(stream.wait_for_chunk(Duration::from_secs(5)));
    handle.join().unwrap();
}
