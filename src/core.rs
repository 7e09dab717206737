//! Core traits and data types for the console.
//!
//! The central abstraction is the [`DeviceCore`] trait: the blocking
//! snapshot/streaming surface of the hardware layer, injected into the live
//! controller at construction so tests can substitute a fake. Alongside it
//! live the image data types that flow from the device through the pipeline
//! into the frame store.

use crate::error::DeviceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Tag key suffix carrying the camera channel index on buffered frames.
///
/// Multi-camera adapters stamp each frame with `"<deviceName>-CameraChannelIndex"`
/// so consumers can attribute frames from the shared circular buffer.
pub const CHANNEL_INDEX_TAG: &str = "CameraChannelIndex";

/// A single raw image frame.
///
/// Pixel data is stored as a raw byte vector:
/// - 8-bit images: 1 byte per pixel.
/// - 12/16-bit images: 2 bytes per pixel, little endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bits per pixel (e.g. 8, 12, 16).
    pub bit_depth: u32,
    /// Raw pixel data.
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data, copying into a byte vector.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }
        Self {
            width,
            height,
            bit_depth: 16,
            data,
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bit_depth: 8,
            data,
        }
    }

    /// Bytes occupied by one pixel at this bit depth.
    pub fn bytes_per_pixel(&self) -> u32 {
        self.bit_depth.div_ceil(8)
    }

    /// Mean pixel value, for quick diagnostics.
    pub fn mean(&self) -> f64 {
        match self.bit_depth {
            8 => {
                if self.data.is_empty() {
                    return 0.0;
                }
                let sum: u64 = self.data.iter().map(|&v| u64::from(v)).sum();
                sum as f64 / self.data.len() as f64
            }
            12 | 16 => {
                let pixels = self.data.chunks_exact(2);
                let count = pixels.len();
                if count == 0 {
                    return 0.0;
                }
                let sum: u64 = pixels
                    .map(|b| u64::from(u16::from_le_bytes([b[0], b[1]])))
                    .sum();
                sum as f64 / count as f64
            }
            _ => 0.0,
        }
    }
}

/// A frame as served from the device's circular buffer, carrying the raw
/// hardware tag bag and the hardware's monotonically increasing frame number.
#[derive(Debug, Clone)]
pub struct TaggedFrame {
    /// The raw pixel frame.
    pub frame: Frame,
    /// Structured tags attached by the device adapter. May carry
    /// `"<deviceName>-CameraChannelIndex"` in multi-camera setups.
    pub tags: serde_json::Value,
    /// Hardware frame sequence number, when the adapter provides one.
    pub image_number: Option<u64>,
}

/// Position of an image within a frame store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coords {
    /// Time point index. Always 0 for live/preview images.
    pub time: usize,
    /// Camera channel index.
    pub channel: usize,
}

impl Coords {
    /// Coordinates for a live image on the given channel.
    pub fn live(channel: usize) -> Self {
        Self { time: 0, channel }
    }
}

/// Per-image metadata.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    /// Fresh identity stamp, minted per delivered image so downstream
    /// change-detection always treats it as new.
    pub uuid: Uuid,
    /// Hardware frame sequence number, carried over from the tagged frame.
    pub image_number: Option<u64>,
    /// Wall-clock time the image was taken off the device.
    pub received_at: DateTime<Utc>,
    /// Name of the camera device that produced the image.
    pub camera: String,
}

/// An image ready for the pipeline: frame, store coordinates, and metadata.
#[derive(Debug, Clone)]
pub struct Image {
    /// Pixel data.
    pub frame: Frame,
    /// Store coordinates (time, channel).
    pub coords: Coords,
    /// Identity and provenance.
    pub metadata: ImageMetadata,
}

impl Image {
    /// Build an image from a buffered frame, pinning the coordinates to the
    /// given channel and minting a fresh identity stamp.
    pub fn from_tagged(tagged: TaggedFrame, channel: usize, camera: &str) -> Self {
        Self {
            frame: tagged.frame,
            coords: Coords::live(channel),
            metadata: ImageMetadata {
                uuid: Uuid::new_v4(),
                image_number: tagged.image_number,
                received_at: Utc::now(),
                camera: camera.to_string(),
            },
        }
    }

    /// Image geometry as (width, height, bit depth).
    pub fn geometry(&self) -> (u32, u32, u32) {
        (self.frame.width, self.frame.height, self.frame.bit_depth)
    }
}

/// The hardware abstraction consumed by the live controller.
///
/// This is the polling/snapshot surface of the device layer: there are no
/// push callbacks. During continuous acquisition the hardware fills an
/// internal circular buffer which consumers drain with
/// [`buffered_frame`](Self::buffered_frame).
///
/// # Contract
/// - `start_continuous_acquisition` / `stop_acquisition` are idempotent with
///   respect to `is_acquiring`.
/// - `buffered_frame(0)` is the newest buffered frame; larger offsets walk
///   backwards in time. An empty slot fails with
///   [`DeviceError::NoFrameAvailable`].
/// - `snap` performs one blocking single-shot acquisition and returns one
///   frame per camera channel, in channel order. It must not be called while
///   continuous acquisition is running.
///
/// # Thread Safety
/// All methods take `&self`; implementations use interior mutability.
#[async_trait]
pub trait DeviceCore: Send + Sync {
    /// Start continuous streaming into the circular buffer.
    async fn start_continuous_acquisition(&self) -> Result<(), DeviceError>;

    /// Stop continuous streaming.
    async fn stop_acquisition(&self) -> Result<(), DeviceError>;

    /// Whether continuous streaming is currently running.
    async fn is_acquiring(&self) -> bool;

    /// Current exposure time in milliseconds.
    async fn exposure_ms(&self) -> f64;

    /// Number of simultaneous camera channels.
    async fn camera_channel_count(&self) -> usize;

    /// Name of the current camera device.
    async fn camera_device_name(&self) -> String;

    /// Hardware name of the given camera channel.
    async fn camera_channel_name(&self, channel: usize) -> String;

    /// Name of the currently selected channel configuration preset
    /// (empty when none is selected).
    async fn current_channel_config_name(&self) -> String;

    /// The `offset_from_newest`-th most recent buffered frame.
    async fn buffered_frame(&self, offset_from_newest: usize) -> Result<TaggedFrame, DeviceError>;

    /// One blocking single-shot acquisition; one frame per channel.
    async fn snap(&self) -> Result<Vec<TaggedFrame>, DeviceError>;
}
