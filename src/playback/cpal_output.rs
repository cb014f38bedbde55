//! cpal output backend and device enumeration

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{Receiver, TryRecvError};
use std::sync::Arc;

use crate::codec::{pcm::pcm_to_f32, AudioFormatSpec};
use crate::error::PlaybackError;
use crate::playback::{OutputBackend, OutputDevice, OutputGain};

/// Audio held inside the device ring, in milliseconds
const DEVICE_RING_MS: usize = 100;

/// Output device description for selection UIs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available output devices
pub fn list_output_devices() -> Vec<OutputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let Ok(devices) = host.output_devices() else {
        return Vec::new();
    };

    devices
        .filter_map(|device| {
            let name = device.name().ok()?;
            let (sample_rates, channels) = output_capabilities(&device);
            Some(OutputDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                sample_rates,
                channels,
            })
        })
        .collect()
}

/// Common sample rates and channel counts a device supports
fn output_capabilities(device: &cpal::Device) -> (Vec<u32>, Vec<u16>) {
    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();

    if let Ok(configs) = device.supported_output_configs() {
        for config in configs {
            for rate_val in [44100u32, 48000, 88200, 96000, 176400, 192000] {
                let rate = cpal::SampleRate(rate_val);
                if rate >= config.min_sample_rate()
                    && rate <= config.max_sample_rate()
                    && !sample_rates.contains(&rate_val)
                {
                    sample_rates.push(rate_val);
                }
            }
            if !channels.contains(&config.channels()) {
                channels.push(config.channels());
            }
        }
    }

    sample_rates.sort();
    channels.sort();
    (sample_rates, channels)
}

/// Find an output device by name, or the host default when `name` is `None`
fn find_output_device(name: Option<&str>) -> Result<cpal::Device, PlaybackError> {
    let host = cpal::default_host();

    let Some(name) = name else {
        return host
            .default_output_device()
            .ok_or_else(|| PlaybackError::DeviceNotFound("No default output device".to_string()));
    };

    let devices = host
        .output_devices()
        .map_err(|e| PlaybackError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }

    Err(PlaybackError::DeviceNotFound(name.to_string()))
}

/// Real-time output through the platform audio host
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    device_name: Option<String>,
}

impl CpalBackend {
    /// Play through the named device, or the default device when `None`
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl OutputBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(
        &self,
        format: &AudioFormatSpec,
        gain: Arc<OutputGain>,
    ) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        let device = find_output_device(self.device_name.as_deref())?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let sample_format = device
            .default_output_config()
            .map_err(|e| PlaybackError::OpenFailed(e.to_string()))?
            .sample_format();

        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let ring_samples =
            format.sample_rate as usize * format.channels as usize * DEVICE_RING_MS / 1000;
        let ring = Arc::new(ArrayQueue::new(ring_samples.max(1)));
        let (error_tx, error_rx) = crossbeam_channel::bounded(8);

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, &ring, gain, error_tx),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, &ring, gain, error_tx),
            cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, &ring, gain, error_tx),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, &ring, gain, error_tx),
            other => {
                return Err(PlaybackError::UnsupportedFormat(format!(
                    "device sample format {other:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| PlaybackError::OpenFailed(e.to_string()))?;

        tracing::info!(
            device = %device_name,
            sample_rate = format.sample_rate,
            channels = format.channels,
            ?sample_format,
            "output stream started"
        );

        Ok(Box::new(CpalDevice {
            stream,
            ring,
            errors: error_rx,
            bit_depth: format.output_bit_depth(),
            bytes_per_frame: format.bytes_per_frame(),
            channels: format.channels as usize,
            scratch: Vec::new(),
        }))
    }
}

/// Build the output stream for sample type `T`. The callback drains the
/// ring, applies the shared gain and fills underruns with silence.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: &Arc<ArrayQueue<f32>>,
    gain: Arc<OutputGain>,
    errors: crossbeam_channel::Sender<String>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let ring_cb = ring.clone();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let factor = gain.factor();
                for sample in data.iter_mut() {
                    let value = ring_cb.pop().unwrap_or(0.0) * factor;
                    *sample = <T as cpal::Sample>::from_sample::<f32>(value);
                }
            },
            move |err| {
                tracing::warn!("stream error: {err}");
                let _ = errors.try_send(err.to_string());
            },
            None,
        )
        .map_err(|e| PlaybackError::OpenFailed(e.to_string()))
}

struct CpalDevice {
    stream: cpal::Stream,
    ring: Arc<ArrayQueue<f32>>,
    errors: Receiver<String>,
    bit_depth: u16,
    bytes_per_frame: usize,
    channels: usize,
    /// Conversion buffer (reused to avoid allocations)
    scratch: Vec<f32>,
}

impl OutputDevice for CpalDevice {
    fn write(&mut self, pcm: &[u8]) -> Result<usize, PlaybackError> {
        match self.errors.try_recv() {
            Ok(err) => return Err(PlaybackError::StreamError(err)),
            Err(TryRecvError::Disconnected) => {
                return Err(PlaybackError::StreamError("output stream ended".to_string()))
            }
            Err(TryRecvError::Empty) => {}
        }

        let free_frames = (self.ring.capacity() - self.ring.len()) / self.channels.max(1);
        let frames = (pcm.len() / self.bytes_per_frame).min(free_frames);
        let bytes = frames * self.bytes_per_frame;
        if bytes == 0 {
            return Ok(0);
        }

        self.scratch.clear();
        pcm_to_f32(&pcm[..bytes], self.bit_depth, &mut self.scratch);
        for &sample in &self.scratch {
            // Single producer: the free space checked above cannot shrink
            let _ = self.ring.push(sample);
        }
        Ok(bytes)
    }

    fn flush(&mut self) {
        while self.ring.pop().is_some() {}
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.stream
            .pause()
            .map_err(|e| PlaybackError::StreamError(e.to_string()))
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        self.stream
            .play()
            .map_err(|e| PlaybackError::StreamError(e.to_string()))
    }
}
