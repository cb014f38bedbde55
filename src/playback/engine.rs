//! Playback engine: stream lifecycle, decode and volume
//!
//! ```text
//! Idle ──prepare──▶ Prepared ──write──▶ Streaming ──stop──▶ Stopped
//!  ▲                                                          │
//!  └───────────── prepare (output reused if same format) ◀────┘
//!                 any state ──release──▶ Released
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{decoder_for, AudioDecoder, AudioFormatSpec, DecoderStats};
use crate::constants::DEFAULT_BUFFER_MS;
use crate::error::PlaybackError;
use crate::playback::lane::PlaybackLane;
use crate::playback::{NowPlaying, OutputBackend, OutputGain, StreamListener};

/// How long `prepare_stream` waits for the output to open
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Prepared,
    Streaming,
    Stopped,
    Released,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStats {
    pub state: EngineState,
    /// PCM waiting for the playback lane
    pub queued_bytes: usize,
    /// PCM handed to the output device by the current lane
    pub bytes_written: u64,
    /// Writes refused because the queue was full
    pub overflow_count: usize,
    pub decoder: DecoderStats,
}

/// One prepared stream
struct Session {
    decoder: Box<dyn AudioDecoder>,
    format: AudioFormatSpec,
    /// Trailing bytes of an incomplete frame, completed by the next write
    carry: Vec<u8>,
}

impl Session {
    fn new(decoder: Box<dyn AudioDecoder>, format: AudioFormatSpec) -> Self {
        Self {
            decoder,
            format,
            carry: Vec::new(),
        }
    }

    /// Queue whole frames of `pcm`. A trailing partial frame is held back
    /// and counted as consumed once every whole frame before it was taken.
    fn queue_pcm(&mut self, lane: &PlaybackLane, pcm: &[u8]) -> usize {
        let frame_bytes = self.format.bytes_per_frame();
        let mut consumed = 0;

        if !self.carry.is_empty() {
            let missing = frame_bytes - self.carry.len();
            if pcm.len() < missing {
                self.carry.extend_from_slice(pcm);
                return pcm.len();
            }
            let mut frame = self.carry.clone();
            frame.extend_from_slice(&pcm[..missing]);
            if lane.push(&frame) == 0 {
                return 0;
            }
            self.carry.clear();
            consumed = missing;
        }

        let rest = &pcm[consumed..];
        let whole = rest.len() - rest.len() % frame_bytes;
        let accepted = if whole > 0 { lane.push(&rest[..whole]) } else { 0 };
        consumed += accepted;
        if accepted == whole {
            self.carry.extend_from_slice(&rest[whole..]);
            consumed += rest.len() - whole;
        }
        consumed
    }
}

struct EngineInner {
    state: EngineState,
    session: Option<Session>,
    /// Kept open across stop so re-preparing the same format is cheap
    lane: Option<PlaybackLane>,
    /// Stats of the most recent session, kept for reporting after stop
    last_decoder_stats: DecoderStats,
}

/// Owns the audio output for the process
pub struct PlaybackEngine {
    backend: Arc<dyn OutputBackend>,
    gain: Arc<OutputGain>,
    buffer_ms: u32,
    inner: Mutex<EngineInner>,
}

impl PlaybackEngine {
    /// Create an engine playing through `backend`, buffering `buffer_ms` of
    /// decoded audio ahead of the device.
    pub fn new(backend: Arc<dyn OutputBackend>, buffer_ms: u32) -> Self {
        Self {
            backend,
            gain: Arc::new(OutputGain::default()),
            buffer_ms: if buffer_ms == 0 { DEFAULT_BUFFER_MS } else { buffer_ms },
            inner: Mutex::new(EngineInner {
                state: EngineState::Idle,
                session: None,
                lane: None,
                last_decoder_stats: DecoderStats::default(),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Format of the prepared stream, if any
    pub fn format(&self) -> Option<AudioFormatSpec> {
        self.inner.lock().session.as_ref().map(|s| s.format.clone())
    }

    /// Prepare a stream for `format`.
    ///
    /// The outcome is reported to `listener` exactly once, after the engine
    /// lock is released. On failure the engine is left Idle and the call can
    /// be retried.
    pub fn prepare_stream(
        &self,
        format: AudioFormatSpec,
        listener: Arc<dyn StreamListener>,
    ) -> Result<(), PlaybackError> {
        let result = self.prepare_locked(format, &listener);
        match &result {
            Ok(()) => listener.on_ready(),
            Err(e) => listener.on_error(e),
        }
        result
    }

    fn prepare_locked(
        &self,
        format: AudioFormatSpec,
        listener: &Arc<dyn StreamListener>,
    ) -> Result<(), PlaybackError> {
        let mut inner = self.inner.lock();
        if inner.state == EngineState::Released {
            return Err(PlaybackError::Released);
        }

        if let Some(mut previous) = inner.session.take() {
            tracing::debug!(format = %previous.format, "replacing prepared stream");
            inner.last_decoder_stats = previous.decoder.stats();
            previous.decoder.release();
        }
        inner.state = EngineState::Idle;

        let mut decoder = decoder_for(format.codec);
        if let Err(e) = decoder.configure(&format) {
            tracing::warn!(format = %format, error = %e, "decoder rejected stream format");
            return Err(e.into());
        }

        let reusable = inner
            .lane
            .as_ref()
            .map(|lane| lane.format().same_output(&format))
            .unwrap_or(false);

        if reusable {
            // A new stream never plays what the previous one left queued
            if let Some(lane) = &inner.lane {
                lane.clear();
            }
            tracing::debug!(format = %format, "reusing open output");
        } else {
            // Close the old output before opening a new one
            inner.lane = None;
            let lane = PlaybackLane::spawn(
                self.backend.clone(),
                format.clone(),
                self.gain.clone(),
                self.buffer_ms,
                OPEN_TIMEOUT,
            )
            .map_err(|e| {
                tracing::error!(format = %format, error = %e, "failed to open output");
                e
            })?;
            inner.lane = Some(lane);
        }

        if let Some(lane) = &inner.lane {
            // Drop a failure left over from a previous session
            lane.take_failure();
            lane.start(listener.clone());
        }

        tracing::info!(format = %format, backend = self.backend.name(), "stream prepared");
        inner.session = Some(Session::new(decoder, format));
        inner.state = EngineState::Prepared;
        Ok(())
    }

    /// Queue raw PCM for playback. Never blocks.
    ///
    /// Returns the number of bytes consumed. Fewer bytes than offered means
    /// the buffer is full and the caller should retry the remainder later.
    /// A trailing partial frame is consumed and held until a later write
    /// completes it.
    pub fn write_raw_pcm(&self, pcm: &[u8]) -> Result<usize, PlaybackError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.state {
            EngineState::Released => return Err(PlaybackError::Released),
            EngineState::Idle | EngineState::Stopped => return Err(PlaybackError::NotPrepared),
            EngineState::Prepared | EngineState::Streaming => {}
        }

        let failure = inner.lane.as_ref().and_then(|lane| lane.take_failure());
        if let Some(error) = failure {
            Self::abandon_session(inner);
            return Err(error);
        }

        let (Some(session), Some(lane)) = (inner.session.as_mut(), inner.lane.as_ref()) else {
            return Err(PlaybackError::NotPrepared);
        };
        let accepted = session.queue_pcm(lane, pcm);
        inner.state = EngineState::Streaming;
        Ok(accepted)
    }

    /// Decode one wire frame through the session decoder.
    ///
    /// Undecodable frames come back empty.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<Bytes, PlaybackError> {
        let mut inner = self.inner.lock();
        match inner.state {
            EngineState::Released => return Err(PlaybackError::Released),
            EngineState::Idle | EngineState::Stopped => return Err(PlaybackError::NotPrepared),
            EngineState::Prepared | EngineState::Streaming => {}
        }

        let session = inner.session.as_mut().ok_or(PlaybackError::NotPrepared)?;
        Ok(session.decoder.decode(frame)?)
    }

    /// Decode one wire frame and queue the result. A bad frame plays as
    /// silence and reports 0 bytes written.
    pub fn write_encoded(&self, frame: &[u8]) -> Result<usize, PlaybackError> {
        let pcm = self.decode_frame(frame)?;
        if pcm.is_empty() {
            return Ok(0);
        }
        self.write_raw_pcm(&pcm)
    }

    /// Discard queued audio after a seek or stream clear, keeping the session
    pub fn flush(&self) -> Result<(), PlaybackError> {
        let mut inner = self.inner.lock();
        match inner.state {
            EngineState::Released => return Err(PlaybackError::Released),
            EngineState::Idle | EngineState::Stopped => return Err(PlaybackError::NotPrepared),
            EngineState::Prepared | EngineState::Streaming => {}
        }

        if let Some(session) = inner.session.as_mut() {
            session.carry.clear();
            session.decoder.reset()?;
        }
        if let Some(lane) = inner.lane.as_ref() {
            lane.clear();
        }
        inner.state = EngineState::Prepared;
        Ok(())
    }

    /// Stop the current stream. Queued audio is dropped and the decoder is
    /// released; the output stays open for the next `prepare_stream`.
    pub fn stop_raw_pcm_stream(&self) {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, EngineState::Prepared | EngineState::Streaming) {
            return;
        }

        if let Some(mut session) = inner.session.take() {
            inner.last_decoder_stats = session.decoder.stats();
            session.decoder.release();
        }
        if let Some(lane) = inner.lane.as_ref() {
            lane.stop();
        }
        inner.state = EngineState::Stopped;
        tracing::info!("stream stopped");
    }

    /// Tear down the output and decoder. Further calls are no-ops.
    pub fn release(&self) {
        let lane = {
            let mut inner = self.inner.lock();
            if inner.state == EngineState::Released {
                return;
            }
            if let Some(mut session) = inner.session.take() {
                inner.last_decoder_stats = session.decoder.stats();
                session.decoder.release();
            }
            inner.state = EngineState::Released;
            inner.lane.take()
        };

        // Join the lane without holding the engine lock
        drop(lane);
        tracing::info!("playback engine released");
    }

    pub fn set_volume(&self, volume: u8) {
        self.gain.set_volume(volume);
        tracing::debug!(volume = self.gain.volume(), "volume changed");
    }

    pub fn set_muted(&self, muted: bool) {
        self.gain.set_muted(muted);
        tracing::debug!(muted, "mute changed");
    }

    pub fn volume(&self) -> u8 {
        self.gain.volume()
    }

    pub fn is_muted(&self) -> bool {
        self.gain.is_muted()
    }

    /// Volume actually applied to the output, 0 while muted
    pub fn effective_volume(&self) -> u8 {
        self.gain.effective_volume()
    }

    /// System output level where the platform keeps one, else the engine volume
    pub fn current_system_volume(&self) -> u8 {
        self.backend
            .system_volume()
            .unwrap_or_else(|| self.gain.volume())
    }

    pub fn update_now_playing(&self, now_playing: &NowPlaying) {
        self.backend.update_now_playing(now_playing);
    }

    pub fn stats(&self) -> PlaybackStats {
        let inner = self.inner.lock();
        let decoder = inner
            .session
            .as_ref()
            .map(|s| s.decoder.stats())
            .unwrap_or(inner.last_decoder_stats);
        let (queued_bytes, bytes_written, overflow_count) = inner
            .lane
            .as_ref()
            .map(|lane| (lane.queued_bytes(), lane.bytes_written(), lane.overflow_count()))
            .unwrap_or((0, 0, 0));

        PlaybackStats {
            state: inner.state,
            queued_bytes,
            bytes_written,
            overflow_count,
            decoder,
        }
    }

    /// Drop a session whose output failed; the engine goes back to Idle
    fn abandon_session(inner: &mut EngineInner) {
        if let Some(mut session) = inner.session.take() {
            inner.last_decoder_stats = session.decoder.stats();
            session.decoder.release();
        }
        inner.lane = None;
        inner.state = EngineState::Idle;
        tracing::warn!("output failed, stream abandoned");
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::opus::tests::encode_tone;
    use crate::codec::Codec;
    use crate::error::CodecError;
    use crate::playback::NullBackend;
    use std::thread;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Ready,
        Error(PlaybackError),
    }

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }
    }

    impl StreamListener for RecordingListener {
        fn on_ready(&self) {
            self.events.lock().push(Event::Ready);
        }

        fn on_error(&self, error: &PlaybackError) {
            self.events.lock().push(Event::Error(error.clone()));
        }
    }

    fn engine(backend: &NullBackend) -> PlaybackEngine {
        PlaybackEngine::new(Arc::new(backend.clone()), 200)
    }

    fn pcm_format() -> AudioFormatSpec {
        AudioFormatSpec::new(Codec::Pcm, 48000, 2, 16)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_write_before_prepare_fails() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        assert_eq!(engine.write_raw_pcm(&[0; 4]), Err(PlaybackError::NotPrepared));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_write_after_release_fails() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());
        engine.prepare_stream(pcm_format(), listener).unwrap();

        engine.release();
        engine.release();
        assert_eq!(engine.state(), EngineState::Released);
        assert_eq!(engine.write_raw_pcm(&[0; 4]), Err(PlaybackError::Released));
        assert_eq!(engine.decode_frame(&[0; 4]), Err(PlaybackError::Released));
    }

    #[test]
    fn test_prepare_reports_ready_and_accepts_pcm() {
        let backend = NullBackend::capturing();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());

        engine.prepare_stream(pcm_format(), listener.clone()).unwrap();
        assert_eq!(listener.events(), vec![Event::Ready]);
        assert_eq!(engine.state(), EngineState::Prepared);

        assert_eq!(engine.write_raw_pcm(&[3; 64]).unwrap(), 64);
        assert_eq!(engine.state(), EngineState::Streaming);
        assert!(wait_for(|| backend.bytes_written() == 64));
    }

    #[test]
    fn test_prepare_error_reports_once_and_stays_idle() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());

        let bad = AudioFormatSpec::new(Codec::Opus, 44100, 2, 16);
        let err = engine.prepare_stream(bad, listener.clone()).unwrap_err();
        assert_eq!(err, PlaybackError::Codec(CodecError::UnsupportedSampleRate(44100)));
        assert_eq!(listener.events(), vec![Event::Error(err)]);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(backend.open_count(), 0);

        // Retryable
        engine.prepare_stream(pcm_format(), listener.clone()).unwrap();
        assert_eq!(engine.state(), EngineState::Prepared);
    }

    #[test]
    fn test_open_failure_leaves_engine_idle() {
        let backend = NullBackend::new();
        backend.fail_next_open();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());

        assert!(engine.prepare_stream(pcm_format(), listener.clone()).is_err());
        assert!(matches!(listener.events()[..], [Event::Error(PlaybackError::OpenFailed(_))]));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_partial_accept_signals_backpressure() {
        let backend = NullBackend::new();
        // 10ms at 8kHz mono 16-bit = 160 bytes of queue
        let engine = PlaybackEngine::new(Arc::new(backend.clone()), 10);
        let format = AudioFormatSpec::new(Codec::Pcm, 8000, 1, 16);
        engine
            .prepare_stream(format, Arc::new(RecordingListener::default()))
            .unwrap();

        let accepted = engine.write_raw_pcm(&[0; 1001]).unwrap();
        assert!(accepted <= 160);
        assert_eq!(accepted % 2, 0);
    }

    #[test]
    fn test_trailing_partial_frame_is_carried() {
        let backend = NullBackend::capturing();
        let engine = engine(&backend);
        engine
            .prepare_stream(pcm_format(), Arc::new(RecordingListener::default()))
            .unwrap();

        // Poll the way a feeder does; must finish with 1.5 frames offered
        let chunk = [1, 2, 3, 4, 5, 6];
        let mut offset = 0;
        for _ in 0..10 {
            if offset == chunk.len() {
                break;
            }
            offset += engine.write_raw_pcm(&chunk[offset..]).unwrap();
        }
        assert_eq!(offset, chunk.len());
        assert_eq!(engine.stats().overflow_count, 0);

        // The held half frame goes out ahead of the next write
        assert_eq!(engine.write_raw_pcm(&[7, 8, 9, 10, 11, 12]).unwrap(), 6);
        assert!(wait_for(|| backend.bytes_written() == 12));
        assert_eq!(backend.captured(), (1..=12).collect::<Vec<u8>>());
    }

    #[test]
    fn test_flush_drops_partial_frame() {
        let backend = NullBackend::capturing();
        let engine = engine(&backend);
        engine
            .prepare_stream(pcm_format(), Arc::new(RecordingListener::default()))
            .unwrap();

        assert_eq!(engine.write_raw_pcm(&[9, 9]).unwrap(), 2);
        engine.flush().unwrap();
        assert_eq!(engine.write_raw_pcm(&[1, 2, 3, 4]).unwrap(), 4);
        assert!(wait_for(|| backend.bytes_written() == 4));
        assert_eq!(backend.captured(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_reprepare_drops_previous_stream_audio() {
        let backend = NullBackend::new();
        backend.stall_writes();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());
        engine.prepare_stream(pcm_format(), listener.clone()).unwrap();

        while engine.write_raw_pcm(&[0; 4000]).unwrap() > 0 {}
        assert!(engine.stats().queued_bytes > 0);

        engine.prepare_stream(pcm_format(), listener).unwrap();
        assert_eq!(backend.open_count(), 1);
        assert_eq!(engine.stats().queued_bytes, 0);
        assert_eq!(engine.state(), EngineState::Prepared);
    }

    #[test]
    fn test_stop_then_prepare_reuses_output() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());

        engine.prepare_stream(pcm_format(), listener.clone()).unwrap();
        engine.write_raw_pcm(&[0; 16]).unwrap();
        engine.stop_raw_pcm_stream();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.write_raw_pcm(&[0; 4]), Err(PlaybackError::NotPrepared));

        // Same output format under a different codec
        let opus = AudioFormatSpec::new(Codec::Opus, 48000, 2, 16);
        engine.prepare_stream(opus, listener.clone()).unwrap();
        assert_eq!(backend.open_count(), 1);

        // A new rate needs a new output
        engine.stop_raw_pcm_stream();
        engine
            .prepare_stream(AudioFormatSpec::new(Codec::Pcm, 44100, 2, 16), listener)
            .unwrap();
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_encoded_frames_reach_the_output() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        engine
            .prepare_stream(
                AudioFormatSpec::new(Codec::Opus, 48000, 2, 16),
                Arc::new(RecordingListener::default()),
            )
            .unwrap();

        assert_eq!(engine.write_encoded(&encode_tone(48000, 2)).unwrap(), 960 * 4);
        // Corrupt frame plays as silence
        assert_eq!(engine.write_encoded(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), 0);

        let stats = engine.stats();
        assert_eq!(stats.decoder.frames_decoded, 1);
        assert_eq!(stats.decoder.frames_dropped, 1);
    }

    #[test]
    fn test_device_failure_returns_to_idle() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        let listener = Arc::new(RecordingListener::default());
        engine.prepare_stream(pcm_format(), listener.clone()).unwrap();

        backend.fail_writes();
        engine.write_raw_pcm(&[0; 64]).unwrap();
        assert!(wait_for(|| listener.events().len() == 2));
        assert!(matches!(listener.events()[1], Event::Error(PlaybackError::StreamError(_))));

        assert!(matches!(
            engine.write_raw_pcm(&[0; 4]),
            Err(PlaybackError::StreamError(_))
        ));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.write_raw_pcm(&[0; 4]), Err(PlaybackError::NotPrepared));
    }

    #[test]
    fn test_volume_and_mute_reach_the_output() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        engine
            .prepare_stream(pcm_format(), Arc::new(RecordingListener::default()))
            .unwrap();

        engine.set_volume(0);
        engine.set_muted(true);
        engine.set_muted(false);
        assert_eq!(engine.effective_volume(), 0);

        engine.set_volume(70);
        engine.set_muted(true);
        let gain = backend.gain().unwrap();
        assert_eq!(gain.effective_volume(), 0);
        engine.set_muted(false);
        assert_eq!(gain.effective_volume(), 70);
    }

    #[test]
    fn test_system_volume_falls_back_to_engine_volume() {
        let plain = NullBackend::new();
        let engine = engine(&plain);
        engine.set_volume(35);
        assert_eq!(engine.current_system_volume(), 35);

        let with_system = NullBackend::new().with_system_volume(80);
        let engine = PlaybackEngine::new(Arc::new(with_system), 200);
        assert_eq!(engine.current_system_volume(), 80);
    }

    #[test]
    fn test_now_playing_is_forwarded() {
        let backend = NullBackend::new();
        let engine = engine(&backend);
        let now_playing = NowPlaying {
            title: Some("Song".to_string()),
            artist: Some("Artist".to_string()),
            rate: 1.0,
            ..Default::default()
        };
        engine.update_now_playing(&now_playing);
        assert_eq!(backend.now_playing(), Some(now_playing));
    }
}
