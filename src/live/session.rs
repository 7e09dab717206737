//! Per-run state of one live/snap preview session.

use crate::core::Image;
use crate::data::{FrameStore, Pipeline};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything that lives and dies with one preview session: the store and
/// pipeline feeding it, the channel layout it was built for, and the
/// per-channel caches used for instant snaps and change detection.
pub(crate) struct LiveSession {
    pub(crate) store: Arc<FrameStore>,
    pub(crate) pipeline: Pipeline,
    pub(crate) channel_count: usize,
    pub(crate) exposure_ms: f64,
    last_images: Vec<Option<Image>>,
    geometry: Option<(u32, u32, u32)>,
    last_image_numbers: HashMap<usize, u64>,
}

impl LiveSession {
    pub(crate) fn new(
        store: Arc<FrameStore>,
        pipeline: Pipeline,
        channel_count: usize,
        exposure_ms: f64,
    ) -> Self {
        Self {
            store,
            pipeline,
            channel_count,
            exposure_ms,
            last_images: vec![None; channel_count],
            geometry: None,
            last_image_numbers: HashMap::new(),
        }
    }

    /// Geometry (width, height, bit depth) of the last image received,
    /// if any image has been received yet.
    pub(crate) fn geometry(&self) -> Option<(u32, u32, u32)> {
        self.geometry
    }

    /// Whether the image carries the same hardware frame number as the last
    /// image delivered on its channel. The circular buffer can serve an old
    /// frame again when the camera has produced nothing new.
    pub(crate) fn is_duplicate(&self, image: &Image) -> bool {
        match (
            image.metadata.image_number,
            self.last_image_numbers.get(&image.coords.channel),
        ) {
            (Some(new), Some(&prev)) => new == prev,
            _ => false,
        }
    }

    /// Record the image in the per-channel cache and geometry tracker.
    pub(crate) fn note_image(&mut self, image: &Image) {
        self.geometry = Some(image.geometry());
        let channel = image.coords.channel;
        if channel >= self.last_images.len() {
            self.last_images.resize(channel + 1, None);
        }
        self.last_images[channel] = Some(image.clone());
        if let Some(number) = image.metadata.image_number {
            self.last_image_numbers.insert(channel, number);
        }
    }

    /// The cached most-recent image per channel, in channel order. Channels
    /// that have not yet received an image are omitted.
    pub(crate) fn cached_images(&self) -> Vec<Image> {
        self.last_images.iter().flatten().cloned().collect()
    }

    /// Forget hardware frame numbers, e.g. when the camera restarts its
    /// sequence counter on a new streaming run.
    pub(crate) fn reset_image_numbers(&mut self) {
        self.last_image_numbers.clear();
    }
}

/// Display name for a camera channel, combining the active channel
/// configuration preset with the hardware channel name.
pub(crate) fn channel_display_name(
    config: &str,
    camera_channel: &str,
    channel_count: usize,
) -> String {
    if channel_count > 1 {
        if config.is_empty() {
            camera_channel.to_string()
        } else {
            format!("{config}-{camera_channel}")
        }
    } else if config.is_empty() {
        "Default".to_string()
    } else {
        config.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Frame, TaggedFrame};
    use crate::data::Pipeline;

    fn image(channel: usize, number: Option<u64>) -> Image {
        let tagged = TaggedFrame {
            frame: Frame::from_u8(8, 8, vec![0; 64]),
            tags: serde_json::Value::Null,
            image_number: number,
        };
        Image::from_tagged(tagged, channel, "TestCam")
    }

    fn session(channels: usize) -> LiveSession {
        let store = Arc::new(FrameStore::new("Snap/Live"));
        let pipeline = Pipeline::new(Vec::new(), store.clone());
        LiveSession::new(store, pipeline, channels, 10.0)
    }

    #[test]
    fn duplicate_detection_is_per_channel() {
        let mut session = session(2);
        session.note_image(&image(0, Some(5)));

        assert!(session.is_duplicate(&image(0, Some(5))));
        assert!(!session.is_duplicate(&image(0, Some(6))));
        // Same number on a different channel is not a duplicate.
        assert!(!session.is_duplicate(&image(1, Some(5))));
        // Unnumbered frames are never rejected.
        assert!(!session.is_duplicate(&image(0, None)));
    }

    #[test]
    fn cache_returns_images_in_channel_order() {
        let mut session = session(3);
        session.note_image(&image(2, Some(1)));
        session.note_image(&image(0, Some(2)));

        let cached = session.cached_images();
        assert_eq!(cached.len(), 2);
        assert_eq!(cached[0].coords.channel, 0);
        assert_eq!(cached[1].coords.channel, 2);
    }

    #[test]
    fn geometry_tracks_last_image() {
        let mut session = session(1);
        assert!(session.geometry().is_none());
        session.note_image(&image(0, None));
        assert_eq!(session.geometry(), Some((8, 8, 8)));
    }

    #[test]
    fn channel_names_match_acquisition_convention() {
        assert_eq!(channel_display_name("DAPI", "Cam-0", 2), "DAPI-Cam-0");
        assert_eq!(channel_display_name("", "Cam-1", 2), "Cam-1");
        assert_eq!(channel_display_name("DAPI", "Cam-0", 1), "DAPI");
        assert_eq!(channel_display_name("", "Cam-0", 1), "Default");
    }
}
