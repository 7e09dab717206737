//! Mock device core with streaming and single-shot support.
//!
//! Simulates the hardware layer behind the live controller:
//! - Configurable channel count, resolution and exposure
//! - An internal circular buffer served newest-first, like a real
//!   sequence buffer
//! - Optional channel tags on buffered frames (multi-camera adapters tag,
//!   single-camera adapters usually do not)
//! - Error injection for start and snap failures
//! - Call counters so tests can assert exactly which device operations ran
//!
//! With `stream_frames` enabled (the demo binary's mode), starting
//! continuous acquisition spawns a generator task that pushes one frame per
//! channel every exposure interval. Tests leave it disabled and push frames
//! explicitly for deterministic buffers.
//!
//! # Example
//!
//! ```rust,ignore
//! let device = MockDeviceCore::builder().channels(3).build();
//! device.start_continuous_acquisition().await?;
//! ```

use crate::core::{DeviceCore, Frame, TaggedFrame, CHANNEL_INDEX_TAG};
use crate::device::pattern::synthetic_frame;
use crate::error::DeviceError;
use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default circular buffer depth, matching small hardware sequence buffers.
const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// Builder for [`MockDeviceCore`].
pub struct MockDeviceCoreBuilder {
    channels: usize,
    width: u32,
    height: u32,
    exposure_ms: f64,
    camera_name: String,
    config_name: String,
    tag_frames: bool,
    stream_frames: bool,
    buffer_capacity: usize,
}

impl MockDeviceCoreBuilder {
    fn new() -> Self {
        Self {
            channels: 1,
            width: 512,
            height: 512,
            exposure_ms: 10.0,
            camera_name: "MockCam".to_string(),
            config_name: String::new(),
            tag_frames: true,
            stream_frames: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Number of simultaneous camera channels.
    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels.max(1);
        self
    }

    /// Sensor resolution.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Exposure time in milliseconds.
    pub fn exposure_ms(mut self, exposure_ms: f64) -> Self {
        self.exposure_ms = exposure_ms;
        self
    }

    /// Camera device name used in frame tags.
    pub fn camera_name(mut self, name: impl Into<String>) -> Self {
        self.camera_name = name.into();
        self
    }

    /// Currently selected channel configuration preset.
    pub fn config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    /// Whether buffered frames carry a channel-index tag.
    pub fn tag_frames(mut self, tag: bool) -> Self {
        self.tag_frames = tag;
        self
    }

    /// Whether starting acquisition spawns a frame generator task.
    pub fn stream_frames(mut self, stream: bool) -> Self {
        self.stream_frames = stream;
        self
    }

    /// Circular buffer depth.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    /// Build the device.
    pub fn build(self) -> MockDeviceCore {
        MockDeviceCore {
            channels: AtomicUsize::new(self.channels),
            width: AtomicU32::new(self.width),
            height: AtomicU32::new(self.height),
            exposure_ms: Mutex::new(self.exposure_ms),
            camera_name: self.camera_name,
            config_name: Mutex::new(self.config_name),
            tag_frames: AtomicBool::new(self.tag_frames),
            stream_frames: self.stream_frames,
            buffer_capacity: self.buffer_capacity,
            acquiring: Arc::new(AtomicBool::new(false)),
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            frame_counter: Arc::new(AtomicU64::new(0)),
            stream_task: Mutex::new(None),
            fail_start: AtomicBool::new(false),
            fail_snap: AtomicBool::new(false),
            start_calls: AtomicU64::new(0),
            stop_calls: AtomicU64::new(0),
            snap_calls: AtomicU64::new(0),
            buffered_frame_calls: AtomicU64::new(0),
        }
    }
}

/// Simulated camera-side device core.
pub struct MockDeviceCore {
    channels: AtomicUsize,
    width: AtomicU32,
    height: AtomicU32,
    exposure_ms: Mutex<f64>,
    camera_name: String,
    config_name: Mutex<String>,
    tag_frames: AtomicBool,
    stream_frames: bool,
    buffer_capacity: usize,
    acquiring: Arc<AtomicBool>,
    buffer: Arc<Mutex<VecDeque<TaggedFrame>>>,
    frame_counter: Arc<AtomicU64>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
    fail_start: AtomicBool,
    fail_snap: AtomicBool,
    start_calls: AtomicU64,
    stop_calls: AtomicU64,
    snap_calls: AtomicU64,
    buffered_frame_calls: AtomicU64,
}

impl MockDeviceCore {
    /// Builder with sensible defaults (one tagged 512x512 channel, 10 ms).
    pub fn builder() -> MockDeviceCoreBuilder {
        MockDeviceCoreBuilder::new()
    }

    fn make_frame(
        width: u32,
        height: u32,
        camera_name: &str,
        tag_frames: bool,
        channel: Option<usize>,
        number: u64,
    ) -> TaggedFrame {
        let pixels = synthetic_frame(width, height, channel.unwrap_or(0), number);
        let tags = match channel {
            Some(ch) if tag_frames => json!({
                format!("{camera_name}-{CHANNEL_INDEX_TAG}"): ch,
            }),
            _ => json!({}),
        };
        TaggedFrame {
            frame: Frame::from_u16(width, height, &pixels),
            tags,
            image_number: Some(number),
        }
    }

    fn push_into(buffer: &Mutex<VecDeque<TaggedFrame>>, capacity: usize, frame: TaggedFrame) {
        let mut buffer = buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push_front(frame);
        while buffer.len() > capacity {
            buffer.pop_back();
        }
    }

    /// Push one generated frame, newest-first, optionally channel-tagged.
    /// Returns the frame's hardware number.
    pub fn push_frame(&self, channel: Option<usize>) -> u64 {
        let number = self.frame_counter.fetch_add(1, Ordering::SeqCst);
        let frame = Self::make_frame(
            self.width.load(Ordering::SeqCst),
            self.height.load(Ordering::SeqCst),
            &self.camera_name,
            self.tag_frames.load(Ordering::SeqCst),
            channel,
            number,
        );
        Self::push_into(&self.buffer, self.buffer_capacity, frame);
        number
    }

    /// Push an arbitrary prebuilt frame (for malformed-tag scenarios).
    pub fn push_raw(&self, frame: TaggedFrame) {
        Self::push_into(&self.buffer, self.buffer_capacity, frame);
    }

    /// Current number of buffered frames.
    pub fn buffer_len(&self) -> usize {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.len()
    }

    /// Drop all buffered frames.
    pub fn clear_buffer(&self) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.clear();
    }

    /// Change the advertised channel count.
    pub fn set_channel_count(&self, channels: usize) {
        self.channels.store(channels.max(1), Ordering::SeqCst);
    }

    /// Change the sensor resolution used for subsequent frames.
    pub fn set_resolution(&self, width: u32, height: u32) {
        self.width.store(width, Ordering::SeqCst);
        self.height.store(height, Ordering::SeqCst);
    }

    /// Change the exposure time.
    pub fn set_exposure_ms(&self, exposure_ms: f64) {
        let mut exposure = self.exposure_ms.lock().unwrap_or_else(|e| e.into_inner());
        *exposure = exposure_ms;
    }

    /// Change the selected channel configuration preset.
    pub fn set_config_name(&self, name: impl Into<String>) {
        let mut config = self.config_name.lock().unwrap_or_else(|e| e.into_inner());
        *config = name.into();
    }

    /// Make the next `start_continuous_acquisition` calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make the next `snap` calls fail.
    pub fn set_fail_snap(&self, fail: bool) {
        self.fail_snap.store(fail, Ordering::SeqCst);
    }

    /// How many times streaming was started.
    pub fn start_calls(&self) -> u64 {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// How many times streaming was stopped.
    pub fn stop_calls(&self) -> u64 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// How many single-shot acquisitions ran.
    pub fn snap_calls(&self) -> u64 {
        self.snap_calls.load(Ordering::SeqCst)
    }

    /// How many buffer reads were issued.
    pub fn buffered_frame_calls(&self) -> u64 {
        self.buffered_frame_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceCore for MockDeviceCore {
    async fn start_continuous_acquisition(&self) -> Result<(), DeviceError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DeviceError::StartFailed("injected start failure".into()));
        }
        if self.acquiring.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(camera = %self.camera_name, "continuous acquisition started");

        if self.stream_frames {
            let acquiring = self.acquiring.clone();
            let buffer = self.buffer.clone();
            let frame_counter = self.frame_counter.clone();
            let channels = self.channels.load(Ordering::SeqCst);
            let width = self.width.load(Ordering::SeqCst);
            let height = self.height.load(Ordering::SeqCst);
            let tag_frames = self.tag_frames.load(Ordering::SeqCst);
            let camera_name = self.camera_name.clone();
            let capacity = self.buffer_capacity;
            let interval = {
                let exposure = self.exposure_ms.lock().unwrap_or_else(|e| e.into_inner());
                Duration::from_secs_f64((*exposure / 1000.0).max(0.001))
            };
            let task = tokio::spawn(async move {
                while acquiring.load(Ordering::SeqCst) {
                    tokio::time::sleep(interval).await;
                    for ch in 0..channels {
                        let number = frame_counter.fetch_add(1, Ordering::SeqCst);
                        let frame = Self::make_frame(
                            width,
                            height,
                            &camera_name,
                            tag_frames,
                            Some(ch),
                            number,
                        );
                        Self::push_into(&buffer, capacity, frame);
                    }
                }
            });
            let mut slot = self.stream_task.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(task);
        }
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<(), DeviceError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.acquiring.store(false, Ordering::SeqCst);
        let task = {
            let mut slot = self.stream_task.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        debug!(camera = %self.camera_name, "acquisition stopped");
        Ok(())
    }

    async fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    async fn exposure_ms(&self) -> f64 {
        *self.exposure_ms.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn camera_channel_count(&self) -> usize {
        self.channels.load(Ordering::SeqCst)
    }

    async fn camera_device_name(&self) -> String {
        self.camera_name.clone()
    }

    async fn camera_channel_name(&self, channel: usize) -> String {
        format!("{}-{}", self.camera_name, channel)
    }

    async fn current_channel_config_name(&self) -> String {
        self.config_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn buffered_frame(&self, offset_from_newest: usize) -> Result<TaggedFrame, DeviceError> {
        self.buffered_frame_calls.fetch_add(1, Ordering::SeqCst);
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer
            .get(offset_from_newest)
            .cloned()
            .ok_or(DeviceError::NoFrameAvailable(offset_from_newest))
    }

    async fn snap(&self) -> Result<Vec<TaggedFrame>, DeviceError> {
        self.snap_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_snap.load(Ordering::SeqCst) {
            return Err(DeviceError::SnapFailed("injected snap failure".into()));
        }
        let channels = self.channels.load(Ordering::SeqCst);
        let width = self.width.load(Ordering::SeqCst);
        let height = self.height.load(Ordering::SeqCst);
        let tag_frames = self.tag_frames.load(Ordering::SeqCst);
        let mut frames = Vec::with_capacity(channels);
        for ch in 0..channels {
            let number = self.frame_counter.fetch_add(1, Ordering::SeqCst);
            frames.push(Self::make_frame(
                width,
                height,
                &self.camera_name,
                tag_frames,
                Some(ch),
                number,
            ));
        }
        Ok(frames)
    }
}
