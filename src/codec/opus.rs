//! Opus decoder wrapper
//!
//! Decodes one Opus packet per wire frame into interleaved PCM.

use bytes::Bytes;
use ::opus::{Channels, Decoder};
use crate::codec::{push_sample_i32, AudioDecoder, AudioFormatSpec, DecoderStats, Lifecycle};
use crate::constants::{OPUS_MAX_FRAME_SAMPLES, OPUS_SAMPLE_RATES};
use crate::error::CodecError;

struct OpusState {
    decoder: Decoder,
    channels: usize,
    /// Container width of the produced PCM
    bit_depth: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
}

/// Opus decoder
pub struct OpusDecoder {
    state: Lifecycle<OpusState>,
    stats: DecoderStats,
}

impl OpusDecoder {
    /// Create an unconfigured decoder
    pub fn new() -> Self {
        Self {
            state: Lifecycle::Unconfigured,
            stats: DecoderStats::default(),
        }
    }

    /// Check channel count and sample rate against what libopus supports
    pub fn validate(format: &AudioFormatSpec) -> Result<Channels, CodecError> {
        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(CodecError::UnsupportedChannels(other)),
        };
        if !OPUS_SAMPLE_RATES.contains(&format.sample_rate) {
            return Err(CodecError::UnsupportedSampleRate(format.sample_rate));
        }
        Ok(channels)
    }
}

impl Default for OpusDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for OpusDecoder {
    fn configure(&mut self, format: &AudioFormatSpec) -> Result<(), CodecError> {
        self.state.ensure_configurable()?;
        let opus_channels = Self::validate(format)?;

        let bit_depth = match format.bit_depth {
            16 | 24 | 32 => format.bit_depth,
            other => {
                tracing::warn!(bit_depth = other, "opus: unsupported output bit depth, using 16");
                16
            }
        };

        let decoder = Decoder::new(format.sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        let channels = format.channels as usize;
        self.state = Lifecycle::Ready(OpusState {
            decoder,
            channels,
            bit_depth,
            decode_buffer: vec![0i16; OPUS_MAX_FRAME_SAMPLES * channels],
        });
        self.stats = DecoderStats::default();

        tracing::debug!(
            sample_rate = format.sample_rate,
            channels,
            bit_depth,
            "opus: decoder configured"
        );
        Ok(())
    }

    fn decode(&mut self, frame: &[u8]) -> Result<Bytes, CodecError> {
        let state = self.state.ready_mut()?;

        if frame.is_empty() {
            self.stats.frames_dropped += 1;
            return Ok(Bytes::new());
        }

        let samples = match state.decoder.decode(frame, &mut state.decode_buffer, false) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "opus: dropping undecodable packet");
                self.stats.frames_dropped += 1;
                return Ok(Bytes::new());
            }
        };

        let total = samples * state.channels;
        let mut out = Vec::with_capacity(total * state.bit_depth as usize / 8);
        for &sample in &state.decode_buffer[..total] {
            push_sample_i32(&mut out, (sample as i32) << 16, state.bit_depth);
        }

        self.stats.frames_decoded += 1;
        self.stats.bytes_produced += out.len() as u64;
        Ok(Bytes::from(out))
    }

    fn reset(&mut self) -> Result<(), CodecError> {
        let state = self.state.ready_mut()?;
        state
            .decoder
            .reset_state()
            .map_err(|e| CodecError::DecoderInit(e.to_string()))
    }

    fn release(&mut self) {
        self.state.release();
    }

    fn stats(&self) -> DecoderStats {
        self.stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::Codec;
    use proptest::prelude::*;

    /// Encode 20ms of a 440Hz tone as a single Opus packet
    pub(crate) fn encode_tone(sample_rate: u32, channels: u16) -> Vec<u8> {
        let opus_channels = if channels == 1 { Channels::Mono } else { Channels::Stereo };
        let mut encoder =
            ::opus::Encoder::new(sample_rate, opus_channels, ::opus::Application::Audio).unwrap();
        let frame_size = sample_rate as usize / 50;
        let mut pcm = Vec::with_capacity(frame_size * channels as usize);
        for i in 0..frame_size {
            let t = i as f32 / sample_rate as f32;
            let val = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            for _ in 0..channels {
                pcm.push(val);
            }
        }
        let mut packet = vec![0u8; 4000];
        let len = encoder.encode(&pcm, &mut packet).unwrap();
        packet.truncate(len);
        packet
    }

    fn opus_format(sample_rate: u32, channels: u16, bit_depth: u16) -> AudioFormatSpec {
        AudioFormatSpec::new(Codec::Opus, sample_rate, channels, bit_depth)
    }

    #[test]
    fn test_decode_before_configure_fails() {
        let mut decoder = OpusDecoder::new();
        assert_eq!(decoder.decode(&[0xFC]), Err(CodecError::NotConfigured));
        assert_eq!(decoder.reset(), Err(CodecError::NotConfigured));
    }

    #[test]
    fn test_configure_once() {
        let mut decoder = OpusDecoder::new();
        decoder.configure(&opus_format(48000, 2, 16)).unwrap();
        assert_eq!(
            decoder.configure(&opus_format(48000, 2, 16)),
            Err(CodecError::AlreadyConfigured)
        );
    }

    #[test]
    fn test_decode_16bit() {
        let mut decoder = OpusDecoder::new();
        decoder.configure(&opus_format(48000, 2, 16)).unwrap();

        let pcm = decoder.decode(&encode_tone(48000, 2)).unwrap();
        // 20ms stereo, 2 bytes per sample
        assert_eq!(pcm.len(), 960 * 2 * 2);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_wider_depths_only_change_container() {
        let packet = encode_tone(48000, 1);

        let mut narrow = OpusDecoder::new();
        narrow.configure(&opus_format(48000, 1, 16)).unwrap();
        let pcm16 = narrow.decode(&packet).unwrap();

        let mut wide = OpusDecoder::new();
        wide.configure(&opus_format(48000, 1, 32)).unwrap();
        let pcm32 = wide.decode(&packet).unwrap();

        let mut packed = OpusDecoder::new();
        packed.configure(&opus_format(48000, 1, 24)).unwrap();
        let pcm24 = packed.decode(&packet).unwrap();

        assert_eq!(pcm32.len(), pcm16.len() * 2);
        assert_eq!(pcm24.len(), pcm16.len() / 2 * 3);
        for (i, s16) in pcm16.chunks_exact(2).enumerate() {
            let s32 = &pcm32[i * 4..i * 4 + 4];
            assert_eq!(&s32[..2], &[0, 0]);
            assert_eq!(&s32[2..], s16);
            let s24 = &pcm24[i * 3..i * 3 + 3];
            assert_eq!(s24[0], 0);
            assert_eq!(&s24[1..], s16);
        }
    }

    #[test]
    fn test_unknown_depth_falls_back_to_16() {
        let mut decoder = OpusDecoder::new();
        decoder.configure(&opus_format(48000, 2, 20)).unwrap();
        let pcm = decoder.decode(&encode_tone(48000, 2)).unwrap();
        assert_eq!(pcm.len(), 960 * 2 * 2);
    }

    #[test]
    fn test_corrupt_packet_yields_silence_and_recovers() {
        let mut decoder = OpusDecoder::new();
        decoder.configure(&opus_format(48000, 2, 16)).unwrap();

        // Code 3 packet claiming 63 frames of 20ms: longer than any legal packet
        let corrupt = decoder.decode(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert!(corrupt.is_empty());
        assert_eq!(decoder.stats().frames_dropped, 1);

        let pcm = decoder.decode(&encode_tone(48000, 2)).unwrap();
        assert!(!pcm.is_empty());
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_reset_keeps_decoder_usable() {
        let mut decoder = OpusDecoder::new();
        decoder.configure(&opus_format(24000, 1, 16)).unwrap();
        decoder.decode(&encode_tone(24000, 1)).unwrap();
        decoder.reset().unwrap();
        assert!(!decoder.decode(&encode_tone(24000, 1)).unwrap().is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut decoder = OpusDecoder::new();
        decoder.configure(&opus_format(48000, 2, 16)).unwrap();
        decoder.release();
        decoder.release();
        assert_eq!(decoder.decode(&encode_tone(48000, 2)), Err(CodecError::Released));
        assert_eq!(
            decoder.configure(&opus_format(48000, 2, 16)),
            Err(CodecError::Released)
        );
    }

    proptest! {
        #[test]
        fn prop_rejects_illegal_channels(channels in 3u16..=64) {
            let mut decoder = OpusDecoder::new();
            prop_assert_eq!(
                decoder.configure(&opus_format(48000, channels, 16)),
                Err(CodecError::UnsupportedChannels(channels))
            );
        }

        #[test]
        fn prop_rejects_illegal_sample_rates(rate in 1u32..400_000) {
            prop_assume!(!OPUS_SAMPLE_RATES.contains(&rate));
            let mut decoder = OpusDecoder::new();
            prop_assert_eq!(
                decoder.configure(&opus_format(rate, 2, 16)),
                Err(CodecError::UnsupportedSampleRate(rate))
            );
        }

        #[test]
        fn prop_accepts_legal_formats(
            rate in prop::sample::select(OPUS_SAMPLE_RATES.to_vec()),
            channels in 1u16..=2,
        ) {
            let mut decoder = OpusDecoder::new();
            prop_assert!(decoder.configure(&opus_format(rate, channels, 16)).is_ok());
        }
    }

    #[test]
    fn test_zero_channels_rejected() {
        let mut decoder = OpusDecoder::new();
        assert_eq!(
            decoder.configure(&opus_format(48000, 0, 16)),
            Err(CodecError::UnsupportedChannels(0))
        );
    }
}
