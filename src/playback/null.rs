//! Headless output backend
//!
//! Accepts PCM as fast as it arrives and records what it was given. Used for
//! running without audio hardware and as the backend in tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::AudioFormatSpec;
use crate::error::PlaybackError;
use crate::playback::{NowPlaying, OutputBackend, OutputDevice, OutputGain};

#[derive(Default)]
struct NullShared {
    opened: Mutex<Vec<AudioFormatSpec>>,
    bytes_written: AtomicU64,
    capture: Mutex<Option<Vec<u8>>>,
    gain: Mutex<Option<Arc<OutputGain>>>,
    now_playing: Mutex<Option<NowPlaying>>,
    system_volume: Mutex<Option<u8>>,
    fail_next_open: AtomicBool,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
}

/// Output backend without hardware. Clones share state.
#[derive(Clone, Default)]
pub struct NullBackend {
    shared: Arc<NullShared>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a copy of every byte written
    pub fn capturing() -> Self {
        let backend = Self::new();
        *backend.shared.capture.lock() = Some(Vec::new());
        backend
    }

    /// Report a system volume separate from the application volume
    pub fn with_system_volume(self, volume: u8) -> Self {
        *self.shared.system_volume.lock() = Some(volume.min(100));
        self
    }

    /// Make the next `open` fail
    pub fn fail_next_open(&self) {
        self.shared.fail_next_open.store(true, Ordering::Release);
    }

    /// Make every following device write fail, as if the device vanished
    pub fn fail_writes(&self) {
        self.shared.fail_writes.store(true, Ordering::Release);
    }

    /// Make every following device write accept nothing, as if playback hung
    pub fn stall_writes(&self) {
        self.shared.stall_writes.store(true, Ordering::Release);
    }

    /// Formats the backend has opened outputs for, oldest first
    pub fn opened_formats(&self) -> Vec<AudioFormatSpec> {
        self.shared.opened.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.shared.opened.lock().len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Acquire)
    }

    /// Captured PCM; empty unless created with [`NullBackend::capturing`]
    pub fn captured(&self) -> Vec<u8> {
        self.shared.capture.lock().clone().unwrap_or_default()
    }

    /// Gain handed to the most recent output
    pub fn gain(&self) -> Option<Arc<OutputGain>> {
        self.shared.gain.lock().clone()
    }

    pub fn now_playing(&self) -> Option<NowPlaying> {
        self.shared.now_playing.lock().clone()
    }
}

impl OutputBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn open(
        &self,
        format: &AudioFormatSpec,
        gain: Arc<OutputGain>,
    ) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        if self.shared.fail_next_open.swap(false, Ordering::AcqRel) {
            return Err(PlaybackError::OpenFailed("null output refused to open".to_string()));
        }

        self.shared.opened.lock().push(format.clone());
        *self.shared.gain.lock() = Some(gain);
        tracing::debug!(format = %format, "null output opened");

        Ok(Box::new(NullDevice {
            shared: self.shared.clone(),
        }))
    }

    fn system_volume(&self) -> Option<u8> {
        *self.shared.system_volume.lock()
    }

    fn update_now_playing(&self, now_playing: &NowPlaying) {
        *self.shared.now_playing.lock() = Some(now_playing.clone());
    }
}

struct NullDevice {
    shared: Arc<NullShared>,
}

impl OutputDevice for NullDevice {
    fn write(&mut self, pcm: &[u8]) -> Result<usize, PlaybackError> {
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Err(PlaybackError::StreamError("null output lost".to_string()));
        }
        if self.shared.stall_writes.load(Ordering::Acquire) {
            return Ok(0);
        }

        if let Some(capture) = self.shared.capture.lock().as_mut() {
            capture.extend_from_slice(pcm);
        }
        self.shared
            .bytes_written
            .fetch_add(pcm.len() as u64, Ordering::AcqRel);
        Ok(pcm.len())
    }

    fn flush(&mut self) {}

    fn pause(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }
}
