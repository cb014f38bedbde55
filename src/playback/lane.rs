//! Real-time playback lane
//!
//! One dedicated thread per open output. It raises its own scheduling
//! priority before doing anything else, opens the device, then moves PCM
//! from the [`PcmQueue`] into the device until shut down.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::codec::AudioFormatSpec;
use crate::constants::PCM_QUEUE_SLOTS;
use crate::error::PlaybackError;
use crate::playback::{OutputBackend, OutputDevice, OutputGain, PcmQueue, StreamListener};

/// Sleep while there is nothing to play
const IDLE_PARK: Duration = Duration::from_millis(5);

/// Sleep while the device buffer is full
const DEVICE_FULL_PARK: Duration = Duration::from_millis(2);

struct LaneShared {
    queue: PcmQueue,
    running: AtomicBool,
    paused: AtomicBool,
    flush_requested: AtomicBool,
    failure: Mutex<Option<PlaybackError>>,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    bytes_written: AtomicU64,
}

/// Handle to the playback thread
pub(crate) struct PlaybackLane {
    shared: Arc<LaneShared>,
    thread: Option<JoinHandle<()>>,
    format: AudioFormatSpec,
}

impl PlaybackLane {
    /// Start the lane and wait until its device is open
    pub(crate) fn spawn(
        backend: Arc<dyn OutputBackend>,
        format: AudioFormatSpec,
        gain: Arc<OutputGain>,
        buffer_ms: u32,
        open_timeout: Duration,
    ) -> Result<Self, PlaybackError> {
        let capacity = format.bytes_for_duration(buffer_ms).max(format.bytes_per_frame());
        let shared = Arc::new(LaneShared {
            queue: PcmQueue::new(capacity, format.bytes_per_frame(), PCM_QUEUE_SLOTS),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            failure: Mutex::new(None),
            listener: Mutex::new(None),
            bytes_written: AtomicU64::new(0),
        });

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<(), PlaybackError>>(1);
        let lane_shared = shared.clone();
        let lane_format = format.clone();

        let handle = thread::Builder::new()
            .name("sendspin-playback".to_string())
            .spawn(move || {
                elevate_priority();

                let device = match backend.open(&lane_format, gain) {
                    Ok(device) => {
                        let _ = ready_tx.send(Ok(()));
                        device
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                tracing::debug!(
                    backend = backend.name(),
                    format = %lane_format,
                    "playback lane running"
                );
                run_lane(device, &lane_shared);
                tracing::debug!("playback lane stopped");
            })
            .map_err(|e| PlaybackError::OpenFailed(e.to_string()))?;

        let mut lane = Self {
            shared,
            thread: Some(handle),
            format,
        };

        match ready_rx.recv_timeout(open_timeout) {
            Ok(Ok(())) => Ok(lane),
            Ok(Err(e)) => {
                lane.shutdown();
                Err(e)
            }
            Err(_) => {
                lane.shutdown();
                Err(PlaybackError::OpenFailed("output did not open in time".to_string()))
            }
        }
    }

    pub(crate) fn format(&self) -> &AudioFormatSpec {
        &self.format
    }

    /// Queue PCM for playback. Returns bytes accepted.
    pub(crate) fn push(&self, pcm: &[u8]) -> usize {
        let accepted = self.shared.queue.push(pcm);
        if accepted > 0 {
            self.wake();
        }
        accepted
    }

    /// Resume output for a new stream
    pub(crate) fn start(&self, listener: Arc<dyn StreamListener>) {
        *self.shared.listener.lock() = Some(listener);
        self.shared.paused.store(false, Ordering::Release);
        self.wake();
    }

    /// Drop queued audio and pause the device, keeping it open
    pub(crate) fn stop(&self) {
        *self.shared.listener.lock() = None;
        self.shared.paused.store(true, Ordering::Release);
        self.shared.flush_requested.store(true, Ordering::Release);
        self.shared.queue.clear();
        self.wake();
    }

    /// Drop queued audio without pausing
    pub(crate) fn clear(&self) {
        self.shared.flush_requested.store(true, Ordering::Release);
        self.shared.queue.clear();
        self.wake();
    }

    /// Device failure reported by the lane since the last call
    pub(crate) fn take_failure(&self) -> Option<PlaybackError> {
        self.shared.failure.lock().take()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.shared.queue.len_bytes()
    }

    pub(crate) fn overflow_count(&self) -> usize {
        self.shared.queue.overflow_count()
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Relaxed)
    }

    /// Stop the thread and close the device
    pub(crate) fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::error!("playback lane panicked");
            }
        }
    }

    fn wake(&self) {
        if let Some(handle) = &self.thread {
            handle.thread().unpark();
        }
    }
}

impl Drop for PlaybackLane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_lane(mut device: Box<dyn OutputDevice>, shared: &LaneShared) {
    let mut pending: Option<(Bytes, usize)> = None;
    let mut device_paused = false;

    while shared.running.load(Ordering::Acquire) {
        if shared.flush_requested.swap(false, Ordering::AcqRel) {
            pending = None;
            device.flush();
        }

        if shared.paused.load(Ordering::Acquire) {
            if !device_paused {
                if let Err(e) = device.pause() {
                    tracing::warn!(error = %e, "failed to pause output");
                }
                device_paused = true;
            }
            thread::park_timeout(IDLE_PARK);
            continue;
        }

        if device_paused {
            if let Err(e) = device.resume() {
                report_failure(shared, e);
                continue;
            }
            device_paused = false;
        }

        let (chunk, offset) = match pending.take().or_else(|| shared.queue.pop().map(|c| (c, 0))) {
            Some(next) => next,
            None => {
                thread::park_timeout(IDLE_PARK);
                continue;
            }
        };

        match device.write(&chunk[offset..]) {
            Ok(written) => {
                shared.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
                let next = offset + written;
                if next < chunk.len() {
                    pending = Some((chunk, next));
                    if written == 0 {
                        thread::park_timeout(DEVICE_FULL_PARK);
                    }
                }
            }
            Err(e) => {
                pending = None;
                report_failure(shared, e);
            }
        }
    }
}

/// Park the lane after a device failure and tell the stream listener once
fn report_failure(shared: &LaneShared, error: PlaybackError) {
    tracing::error!(error = %error, "output device failed");
    shared.paused.store(true, Ordering::Release);
    shared.queue.clear();
    if let Some(listener) = shared.listener.lock().take() {
        listener.on_error(&error);
    }
    *shared.failure.lock() = Some(error);
}

/// Try to set real-time priority for the current thread (Linux only).
#[cfg(target_os = "linux")]
fn elevate_priority() {
    const RT_PRIORITY: libc::c_int = 50;

    // SAFETY: sched_param is plain data and pid 0 targets the calling thread.
    let result = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = RT_PRIORITY;
        libc::sched_setscheduler(0, libc::SCHED_FIFO, &param)
    };

    if result == 0 {
        tracing::info!(priority = RT_PRIORITY, "playback lane running with SCHED_FIFO");
    } else {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "failed to set real-time priority (needs CAP_SYS_NICE or rtprio limit)"
        );
    }
}

#[cfg(windows)]
fn elevate_priority() {
    use windows::Win32::System::Threading::{
        GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_TIME_CRITICAL,
    };

    // SAFETY: GetCurrentThread returns a pseudo handle valid for this thread.
    match unsafe { SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_TIME_CRITICAL) } {
        Ok(()) => tracing::info!("playback lane running at time-critical priority"),
        Err(e) => tracing::warn!(error = %e, "failed to raise playback lane priority"),
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
fn elevate_priority() {
    tracing::debug!("RT priority not supported on this platform");
}
