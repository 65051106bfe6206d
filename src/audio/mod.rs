// ABOUTME: Audio pipeline
// ABOUTME: Sample types, codec decoding, the jitter buffer and device output

/// Codec decoders
pub mod decode;
/// Output device enumeration
pub mod devices;
/// Device backends and the device loop
pub mod output;
/// Jitter buffer
pub mod stream;
/// Sample format and chunk types
pub mod types;

pub use decode::Decoder;
pub use devices::{list_output_devices, OutputDevice};
pub use output::{AudioOutput, DeviceError};
pub use stream::Stream;
pub use types::{PcmChunk, SampleFormat};
