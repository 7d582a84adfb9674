//! Stream scheduling: per-member encoded frame production with
//! presentation-time pacing and mid-stream format adaptation.
//!
//! Codec implementations are external collaborators: the core consumes
//! them through [`AudioEncoder`] / [`EncoderFactory`] and pulls raw audio
//! through [`AudioSource`].

mod scheduler;

pub use scheduler::{StreamConfig, StreamController, StreamHandle};

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::messages::{AudioFormat, Codec};

/// Errors from external encoder implementations.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The factory cannot produce an encoder for the requested format.
    #[error("unsupported format: {0}")]
    Unsupported(String),

    /// The encoder failed mid-stream.
    #[error("encode failed: {0}")]
    Failed(String),
}

/// Pull source of raw interleaved PCM at a fixed source format.
pub trait AudioSource: Send {
    /// Returns up to `frames` sample frames. `None` means the source is
    /// exhausted and the stream should end.
    fn pull(&mut self, frames: usize) -> Option<Bytes>;
}

/// One encoder instance bound to a target format.
pub trait AudioEncoder: Send {
    /// The format this encoder produces.
    fn format(&self) -> AudioFormat;

    /// Codec-specific initialization blob for `stream/start`, if any.
    fn codec_header(&self) -> Option<Bytes>;

    /// Encodes one block of source PCM into one wire payload.
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, EncoderError>;
}

/// Creates encoders and negotiates stream formats against member support.
pub trait EncoderFactory: Send + Sync {
    /// Picks the stream format for a member from its declared formats.
    /// Grounded policy: prefer an exact source-format PCM match, then the
    /// member's first format the factory can service.
    fn negotiate(&self, source: &AudioFormat, supported: &[AudioFormat]) -> Option<AudioFormat>;

    /// Builds an encoder from the source format to `target`.
    fn create(
        &self,
        source: &AudioFormat,
        target: &AudioFormat,
    ) -> Result<Box<dyn AudioEncoder>, EncoderError>;
}

/// Derives visualizer feature frames from produced audio.
pub trait VisualizerSource: Send {
    /// Feature payload for one PCM block, or `None` to skip the block.
    fn features(&mut self, pcm: &[u8], format: &AudioFormat) -> Option<Bytes>;
}

/// Uncompressed byte rate of a format; used as the in-flight estimate for
/// buffer-capacity gating (an upper bound for compressed codecs).
pub fn byte_rate(format: &AudioFormat) -> u64 {
    u64::from(format.sample_rate) * u64::from(format.channels) * u64::from(format.bit_depth) / 8
}

/// Bytes per sample frame at the given format.
pub fn frame_bytes(format: &AudioFormat) -> usize {
    usize::from(format.channels) * usize::from(format.bit_depth) / 8
}

/// True when a format describes raw PCM identical to the source.
pub fn is_passthrough(source: &AudioFormat, target: &AudioFormat) -> bool {
    target.codec == Codec::Pcm && source == target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_rate_matches_pcm_math() {
        let format = AudioFormat {
            codec: Codec::Pcm,
            channels: 2,
            sample_rate: 48_000,
            bit_depth: 16,
        };
        assert_eq!(byte_rate(&format), 192_000);
        assert_eq!(frame_bytes(&format), 4);
    }
}
