// ABOUTME: Audio decoders for the codecs the server may announce
// ABOUTME: PCM (RIFF/WAVE header) and the null pass-through codec

use crate::audio::types::{PcmChunk, SampleFormat};
use crate::error::Error;
use crate::protocol::messages::CodecHeader;

/// Format the null codec reports
const NULL_FORMAT: SampleFormat = SampleFormat {
    rate: 48000,
    bits: 16,
    channels: 2,
};

/// Decoder for the active codec
///
/// The set of codecs is closed, so this is an enum rather than a trait object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoder {
    /// Linear PCM, chunks already carry raw interleaved samples
    Pcm(PcmDecoder),
    /// No-op codec
    Null,
}

impl Decoder {
    /// Create the decoder for a codec name
    pub fn for_codec(codec: &str) -> Result<Self, Error> {
        match codec {
            "pcm" => Ok(Decoder::Pcm(PcmDecoder::default())),
            "null" => Ok(Decoder::Null),
            other => Err(Error::UnsupportedCodec(other.to_string())),
        }
    }

    /// Codec name
    pub fn name(&self) -> &'static str {
        match self {
            Decoder::Pcm(_) => "pcm",
            Decoder::Null => "null",
        }
    }

    /// Parse the codec header and return the format of all following chunks
    pub fn set_header(&mut self, header: &CodecHeader) -> Result<SampleFormat, Error> {
        match self {
            Decoder::Pcm(pcm) => pcm.set_header(&header.payload),
            Decoder::Null => Ok(NULL_FORMAT),
        }
    }

    /// Decode a chunk in place
    ///
    /// Returns `false` when the chunk cannot be decoded; it must then be dropped.
    pub fn decode(&mut self, chunk: &mut PcmChunk) -> bool {
        match self {
            Decoder::Pcm(pcm) => pcm.decode(chunk),
            Decoder::Null => true,
        }
    }
}

/// PCM decoder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcmDecoder {
    format: Option<SampleFormat>,
}

impl PcmDecoder {
    /// Parse a RIFF/WAVE header and extract the sample format
    pub fn set_header(&mut self, riff: &[u8]) -> Result<SampleFormat, Error> {
        if riff.len() < 12 || &riff[0..4] != b"RIFF" {
            return Err(Error::Protocol("PCM header is not a RIFF file".to_string()));
        }
        if &riff[8..12] != b"WAVE" {
            return Err(Error::Protocol("PCM header is not a WAVE file".to_string()));
        }

        let mut pos = 12;
        let format = loop {
            let Some(chunk_header) = riff.get(pos..pos + 8) else {
                return Err(Error::Protocol("PCM header has no fmt chunk".to_string()));
            };
            let id = &chunk_header[0..4];
            let size = u32::from_le_bytes([
                chunk_header[4],
                chunk_header[5],
                chunk_header[6],
                chunk_header[7],
            ]) as usize;
            let body_start = pos + 8;

            if id == b"fmt " {
                let body = riff
                    .get(body_start..body_start + 16)
                    .ok_or_else(|| Error::Protocol("PCM fmt chunk truncated".to_string()))?;
                let channels = u16::from_le_bytes([body[2], body[3]]);
                let rate = u32::from_le_bytes([body[4], body[5], body[6], body[7]]);
                let bits = u16::from_le_bytes([body[14], body[15]]);
                break SampleFormat::new(rate, bits, channels);
            }

            // Chunks are word aligned
            pos = body_start + size + (size & 1);
        };

        if !format.is_valid() {
            return Err(Error::Protocol(format!("unsupported PCM format {}", format)));
        }
        self.format = Some(format);
        Ok(format)
    }

    /// PCM chunks are already raw samples; reject partial frames
    pub fn decode(&mut self, chunk: &mut PcmChunk) -> bool {
        let frame_size = chunk.format.frame_size();
        frame_size > 0 && chunk.payload.len() % frame_size == 0
    }
}

/// Build a canonical 44-byte RIFF/WAVE header for `format`
pub fn riff_header(format: SampleFormat) -> Vec<u8> {
    let block_align = format.frame_size() as u16;
    let byte_rate = format.rate * block_align as u32;

    let mut out = Vec::with_capacity(44);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&36u32.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&format.bits.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}
