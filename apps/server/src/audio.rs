//! Demo audio pipeline for the reference server.
//!
//! The core treats codecs and audio sources as external collaborators;
//! this module supplies the simplest useful set: an endless sine-tone
//! source and a PCM passthrough encoder factory. Real deployments replace
//! these with an actual media pipeline and Opus/FLAC encoders.

use std::f32::consts::TAU;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use resonate_core::group::{MediaController, StreamFactory};
use resonate_core::protocol::messages::{AudioFormat, Codec, ControllerCommandKind};
use resonate_core::stream::{
    frame_bytes, AudioEncoder, AudioSource, EncoderError, EncoderFactory, StreamConfig,
};

/// Source format of the demo pipeline: CD-style stereo PCM at 48 kHz.
pub fn source_format() -> AudioFormat {
    AudioFormat {
        codec: Codec::Pcm,
        channels: 2,
        sample_rate: 48_000,
        bit_depth: 16,
    }
}

/// Endless stereo sine tone at a fixed frequency.
pub struct ToneSource {
    format: AudioFormat,
    frequency: f32,
    phase: f32,
}

impl ToneSource {
    pub fn new(format: AudioFormat, frequency: f32) -> Self {
        Self {
            format,
            frequency,
            phase: 0.0,
        }
    }
}

impl AudioSource for ToneSource {
    fn pull(&mut self, frames: usize) -> Option<Bytes> {
        let step = TAU * self.frequency / self.format.sample_rate as f32;
        let mut buf = BytesMut::with_capacity(frames * frame_bytes(&self.format));
        for _ in 0..frames {
            let sample = (self.phase.sin() * 0.2 * f32::from(i16::MAX)) as i16;
            self.phase = (self.phase + step) % TAU;
            for _ in 0..self.format.channels {
                buf.put_i16_le(sample);
            }
        }
        Some(buf.freeze())
    }
}

/// Passthrough "encoder": source PCM goes out unchanged.
struct PcmPassthrough {
    format: AudioFormat,
}

impl AudioEncoder for PcmPassthrough {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn codec_header(&self) -> Option<Bytes> {
        None
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, EncoderError> {
        Ok(Bytes::copy_from_slice(pcm))
    }
}

/// Factory that only services PCM at the source format.
pub struct PcmEncoderFactory;

impl EncoderFactory for PcmEncoderFactory {
    fn negotiate(&self, source: &AudioFormat, supported: &[AudioFormat]) -> Option<AudioFormat> {
        supported
            .iter()
            .find(|f| **f == *source)
            .or_else(|| supported.iter().find(|f| f.codec == Codec::Pcm))
            .copied()
    }

    fn create(
        &self,
        source: &AudioFormat,
        target: &AudioFormat,
    ) -> Result<Box<dyn AudioEncoder>, EncoderError> {
        if target.codec != Codec::Pcm || target != source {
            return Err(EncoderError::Unsupported(format!(
                "passthrough factory cannot produce {:?}@{}",
                target.codec, target.sample_rate
            )));
        }
        Ok(Box::new(PcmPassthrough { format: *target }))
    }
}

/// Stream factory handing out a fresh tone source per stream.
pub struct ToneStreamFactory {
    frequency: f32,
}

impl ToneStreamFactory {
    pub fn new(frequency: f32) -> Arc<Self> {
        Arc::new(Self { frequency })
    }
}

impl StreamFactory for ToneStreamFactory {
    fn create_stream(&self, group_id: &str) -> Option<StreamConfig> {
        log::info!(
            "[Audio] Starting {}Hz tone stream for group {}",
            self.frequency,
            group_id
        );
        let format = source_format();
        Some(StreamConfig {
            source_format: format,
            source: Box::new(ToneSource::new(format, self.frequency)),
            encoders: Arc::new(PcmEncoderFactory),
            visualizer: None,
        })
    }
}

/// Demo transport controls: playback only, no track navigation.
pub struct DemoMediaController;

impl MediaController for DemoMediaController {
    fn capabilities(&self) -> Vec<ControllerCommandKind> {
        use ControllerCommandKind::*;
        vec![Play, Pause, Stop, Volume, Mute, Switch]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tone_source_fills_requested_frames() {
        let format = source_format();
        let mut source = ToneSource::new(format, 440.0);
        let block = source.pull(960).unwrap();
        assert_eq!(block.len(), 960 * frame_bytes(&format));
    }

    #[test]
    fn factory_negotiates_pcm_and_rejects_the_rest() {
        let factory = PcmEncoderFactory;
        let source = source_format();
        let opus = AudioFormat {
            codec: Codec::Opus,
            ..source
        };
        assert_eq!(factory.negotiate(&source, &[opus, source]), Some(source));
        assert!(factory.create(&source, &source).is_ok());
        assert!(factory.create(&source, &opus).is_err());
    }
}
