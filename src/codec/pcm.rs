//! PCM passthrough decoder and sample conversion helpers

use bytes::Bytes;
use crate::codec::{AudioDecoder, AudioFormatSpec, DecoderStats, Lifecycle};
use crate::error::CodecError;

/// Decoder for raw PCM streams: frames are already playable
#[derive(Debug, Default)]
pub struct PcmPassthrough {
    state: Lifecycle<usize>,
    stats: DecoderStats,
}

impl PcmPassthrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a raw PCM format
    pub fn validate(format: &AudioFormatSpec) -> Result<(), CodecError> {
        if !(1..=8).contains(&format.channels) {
            return Err(CodecError::UnsupportedChannels(format.channels));
        }
        if !(8000..=384_000).contains(&format.sample_rate) {
            return Err(CodecError::UnsupportedSampleRate(format.sample_rate));
        }
        if !matches!(format.bit_depth, 16 | 24 | 32) {
            return Err(CodecError::UnsupportedBitDepth(format.bit_depth));
        }
        Ok(())
    }
}

impl AudioDecoder for PcmPassthrough {
    fn configure(&mut self, format: &AudioFormatSpec) -> Result<(), CodecError> {
        self.state.ensure_configurable()?;
        Self::validate(format)?;
        self.state = Lifecycle::Ready(format.bytes_per_frame());
        self.stats = DecoderStats::default();
        Ok(())
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Bytes, CodecError> {
        let frame_bytes = *self.state.ready_mut()?;
        if frame.len() % frame_bytes != 0 {
            tracing::debug!(
                len = frame.len(),
                frame_bytes,
                "pcm: frame is not aligned to whole sample frames"
            );
        }
        self.stats.frames_decoded += 1;
        self.stats.bytes_produced += frame.len() as u64;
        Ok(Bytes::copy_from_slice(frame))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        self.state.ready_mut().map(|_| ())
    }

    fn release(&mut self) {
        self.state.release();
    }

    fn stats(&self) -> DecoderStats {
        self.stats
    }
}

/// Convert interleaved little-endian PCM into normalized `f32` samples.
///
/// Trailing bytes that do not form a whole sample are ignored.
pub fn pcm_to_f32(pcm: &[u8], bit_depth: u16, out: &mut Vec<f32>) {
    match bit_depth {
        24 => out.extend(pcm.chunks_exact(3).map(|b| {
            let v = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
            v as f32 / 8_388_608.0
        })),
        32 => out.extend(pcm.chunks_exact(4).map(|b| {
            i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0
        })),
        _ => out.extend(
            pcm.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
        ),
    }
}
