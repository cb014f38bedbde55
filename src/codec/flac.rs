//! FLAC decoder
//!
//! Each wire frame carries exactly one FLAC frame. The stream parameters come
//! from the codec header (`fLaC` marker + STREAMINFO block, or a bare
//! STREAMINFO block); without a header a STREAMINFO block is synthesized from
//! the announced format.

use bytes::Bytes;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_FLAC};
use symphonia::core::formats::Packet;
use crate::codec::{push_sample_i32, AudioDecoder, AudioFormatSpec, DecoderStats, Lifecycle};
use crate::error::CodecError;

const STREAMINFO_LEN: usize = 34;
const FLAC_MARKER: &[u8] = b"fLaC";

struct FlacState {
    decoder: Box<dyn Decoder>,
    bit_depth: u16,
    /// Timestamp handed to the next packet
    next_ts: u64,
}

/// FLAC frame decoder backed by symphonia
pub struct FlacDecoder {
    state: Lifecycle<FlacState>,
    stats: DecoderStats,
}

impl FlacDecoder {
    pub fn new() -> Self {
        Self {
            state: Lifecycle::Unconfigured,
            stats: DecoderStats::default(),
        }
    }
}

impl Default for FlacDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the STREAMINFO block body from a codec header
fn stream_info_from_header(header: &[u8]) -> Result<Vec<u8>, CodecError> {
    let body = if header.starts_with(FLAC_MARKER) {
        // marker (4) + metadata block header (4)
        header.get(8..)
    } else {
        Some(header)
    };
    match body {
        Some(body) if body.len() >= STREAMINFO_LEN => Ok(body[..STREAMINFO_LEN].to_vec()),
        _ => Err(CodecError::DecoderInit(format!(
            "flac codec header too short: {} bytes",
            header.len()
        ))),
    }
}

/// Build a STREAMINFO block describing `format` with unknown frame sizes,
/// unknown length and no MD5.
fn synthesize_stream_info(format: &AudioFormatSpec) -> Vec<u8> {
    let mut info = Vec::with_capacity(STREAMINFO_LEN);
    // min/max block size
    info.extend_from_slice(&16u16.to_be_bytes());
    info.extend_from_slice(&u16::MAX.to_be_bytes());
    // min/max frame size (0 = unknown)
    info.extend_from_slice(&[0u8; 6]);
    // 20 bits rate | 3 bits channels-1 | 5 bits bps-1 | 36 bits total samples
    let packed: u64 = ((format.sample_rate as u64 & 0xF_FFFF) << 44)
        | (((format.channels as u64 - 1) & 0x7) << 41)
        | (((format.bit_depth as u64 - 1) & 0x1F) << 36);
    info.extend_from_slice(&packed.to_be_bytes());
    info.extend_from_slice(&[0u8; 16]);
    info
}

impl AudioDecoder for FlacDecoder {
    fn configure(&mut self, format: &AudioFormatSpec) -> Result<(), CodecError> {
        self.state.ensure_configurable()?;

        if !(1..=8).contains(&format.channels) {
            return Err(CodecError::UnsupportedChannels(format.channels));
        }
        if format.sample_rate == 0 || format.sample_rate > 655_350 {
            return Err(CodecError::UnsupportedSampleRate(format.sample_rate));
        }
        if !(4..=32).contains(&format.bit_depth) {
            return Err(CodecError::UnsupportedBitDepth(format.bit_depth));
        }

        let stream_info = match &format.codec_header {
            Some(header) => stream_info_from_header(header)?,
            None => synthesize_stream_info(format),
        };

        let mut params = CodecParameters::new();
        params
            .for_codec(CODEC_TYPE_FLAC)
            .with_sample_rate(format.sample_rate)
            .with_extra_data(stream_info.into_boxed_slice());

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        let bit_depth = format.output_bit_depth();
        if bit_depth != format.bit_depth {
            tracing::warn!(
                bit_depth = format.bit_depth,
                output = bit_depth,
                "flac: bit depth has no PCM container, converting output to 16-bit"
            );
        }

        self.state = Lifecycle::Ready(FlacState {
            decoder,
            bit_depth,
            next_ts: 0,
        });
        self.stats = DecoderStats::default();
        Ok(())
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Bytes, CodecError> {
        let state = self.state.ready_mut()?;

        let packet = Packet::new_from_slice(0, state.next_ts, 0, frame);
        let decoded = match state.decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "flac: dropping undecodable frame");
                self.stats.frames_dropped += 1;
                return Ok(Bytes::new());
            }
        };

        let frames = decoded.frames();
        let mut sample_buf = SampleBuffer::<i32>::new(frames as u64, *decoded.spec());
        sample_buf.copy_interleaved_ref(decoded);
        state.next_ts += frames as u64;

        let samples = sample_buf.samples();
        let mut out = Vec::with_capacity(samples.len() * state.bit_depth as usize / 8);
        for &sample in samples {
            push_sample_i32(&mut out, sample, state.bit_depth);
        }

        self.stats.frames_decoded += 1;
        self.stats.bytes_produced += out.len() as u64;
        Ok(Bytes::from(out))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        let state = self.state.ready_mut()?;
        state.decoder.reset();
        state.next_ts = 0;
        Ok(())
    }

    fn release(&mut self) {
        self.state.release();
    }

    fn stats(&self) -> DecoderStats {
        self.stats
    }
}
