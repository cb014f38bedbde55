//! Playback engine
//!
//! The engine owns the audio output for the whole process. Decoded PCM is
//! queued by the caller and written to the device by a dedicated real-time
//! thread (the playback lane); volume and mute reach the device through a
//! lock-free [`OutputGain`].
//!
//! Platform output is a runtime-injected [`OutputBackend`]: [`CpalBackend`]
//! drives real hardware, [`NullBackend`] runs headless.

pub mod buffer;
pub mod cpal_output;
pub mod engine;
pub mod lane;
pub mod null;

pub use buffer::PcmQueue;
pub use cpal_output::{list_output_devices, CpalBackend, OutputDeviceInfo};
pub use engine::{EngineState, PlaybackEngine, PlaybackStats};
pub use null::NullBackend;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::AudioFormatSpec;
use crate::error::PlaybackError;

/// Receives the outcome of `prepare_stream` and later output failures
pub trait StreamListener: Send + Sync {
    /// The output is open and accepts PCM
    fn on_ready(&self);

    /// The stream could not be prepared, or the output failed while streaming
    fn on_error(&self, error: &PlaybackError);
}

/// Platform audio output
///
/// `open` runs on the playback lane thread, so devices that must stay on the
/// thread that created them (such as a cpal stream) never cross threads.
pub trait OutputBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Open an output sized for `format`. The device reads `gain` on every
    /// buffer it renders.
    fn open(
        &self,
        format: &AudioFormatSpec,
        gain: Arc<OutputGain>,
    ) -> Result<Box<dyn OutputDevice>, PlaybackError>;

    /// Current system-level output volume (0-100), when the platform keeps
    /// one separate from the application volume
    fn system_volume(&self) -> Option<u8> {
        None
    }

    /// Push now-playing metadata to the platform media session
    fn update_now_playing(&self, _now_playing: &NowPlaying) {}
}

/// An open output, driven only from the playback lane
pub trait OutputDevice {
    /// Hand as much of `pcm` to the device as it can take right now without
    /// blocking. Returns the number of bytes accepted, always whole frames.
    fn write(&mut self, pcm: &[u8]) -> Result<usize, PlaybackError>;

    /// Drop audio buffered inside the device
    fn flush(&mut self);

    fn pause(&mut self) -> Result<(), PlaybackError>;

    fn resume(&mut self) -> Result<(), PlaybackError>;
}

/// Application volume and mute, shared with the output callback
///
/// Volume and mute are stored separately so muting never overwrites the
/// remembered volume.
#[derive(Debug)]
pub struct OutputGain {
    volume: AtomicU8,
    muted: AtomicBool,
}

impl OutputGain {
    pub fn new(volume: u8, muted: bool) -> Self {
        Self {
            volume: AtomicU8::new(volume.min(100)),
            muted: AtomicBool::new(muted),
        }
    }

    pub fn set_volume(&self, volume: u8) {
        self.volume.store(volume.min(100), Ordering::Relaxed);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Effective output volume, 0-100
    pub fn effective_volume(&self) -> u8 {
        if self.is_muted() {
            0
        } else {
            self.volume()
        }
    }

    /// Linear multiplier applied to samples
    pub fn factor(&self) -> f32 {
        self.effective_volume() as f32 / 100.0
    }
}

impl Default for OutputGain {
    fn default() -> Self {
        Self::new(100, false)
    }
}

/// Now-playing metadata for media session integration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
    pub duration: Option<Duration>,
    pub elapsed: Option<Duration>,
    /// Playback rate, 0.0 while paused
    pub rate: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_mute_composes_with_volume() {
        let gain = OutputGain::default();
        gain.set_volume(0);
        gain.set_muted(true);
        gain.set_muted(false);
        assert_eq!(gain.effective_volume(), 0);

        gain.set_volume(40);
        gain.set_muted(true);
        assert_eq!(gain.effective_volume(), 0);
        assert_eq!(gain.volume(), 40);
        gain.set_muted(false);
        assert_eq!(gain.effective_volume(), 40);
    }

    #[test]
    fn test_volume_is_clamped() {
        let gain = OutputGain::new(250, false);
        assert_eq!(gain.volume(), 100);
        gain.set_volume(101);
        assert_eq!(gain.factor(), 1.0);
    }

    proptest! {
        #[test]
        fn prop_unmute_restores_volume(volume in 0u8..=100, toggles in 0usize..8) {
            let gain = OutputGain::new(volume, false);
            for i in 0..toggles {
                gain.set_muted(i % 2 == 0);
            }
            gain.set_muted(false);
            prop_assert_eq!(gain.effective_volume(), volume);
        }
    }
}
