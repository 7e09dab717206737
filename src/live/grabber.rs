//! The frame grabber loop.
//!
//! Runs as a dedicated task while streaming is physically active. Each cycle
//! sleeps an adaptively computed interval, then drains new frames from the
//! device's circular buffer and submits them to the controller.
//!
//! # Adaptive cadence
//!
//! The camera only exposes a polling API, so the loop has to pick its own
//! rate. Two pressures bound it: polling faster than the exposure time (or
//! faster than the display can paint) wastes reads on frames nobody will
//! see, and polling slower than 2 Hz makes the preview feel dead. The loop
//! tracks recent paint timestamps and follows the display's real throughput
//! at a fraction of its shortest observed paint gap, so a temporarily slow
//! pipeline does not stay under-sampled once it recovers.
//!
//! # Stop protocol
//!
//! The controller signals stop through a watch channel. The grabber observes
//! it at the top of each cycle, before every buffer read, and concurrently
//! with every in-flight submission, so a stop issued while the controller is
//! processing one of this loop's own submissions cannot deadlock.

use crate::core::{DeviceCore, Image, CHANNEL_INDEX_TAG};
use crate::error::DeviceError;
use crate::live::LiveCommand;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Floor for the grab interval; never poll faster than ~30 Hz.
pub(crate) const MIN_GRAB_DELAY: Duration = Duration::from_millis(33);

/// Ceiling for the grab interval; never poll slower than 2 Hz.
pub(crate) const MAX_GRAB_DELAY: Duration = Duration::from_millis(500);

/// Fraction of the shortest observed paint gap to target. Below 1.0 so the
/// poll rate can climb back up after a transient display slowdown.
const DISPLAY_GAP_FRACTION: f64 = 0.75;

/// Number of paint timestamps retained for gap estimation.
const HISTORY_CAPACITY: usize = 20;

/// Buffer offsets scanned per cycle, as a multiple of the channel count. In
/// multi-camera setups one camera can outpace the others, pushing the slower
/// camera's frames deeper into the shared buffer.
const BUFFER_SCAN_FACTOR: usize = 2;

/// Bounded history of display paint timestamps, oldest evicted first.
pub(crate) struct DisplayUpdateHistory {
    times: VecDeque<Instant>,
}

impl DisplayUpdateHistory {
    pub(crate) fn new() -> Self {
        Self {
            times: VecDeque::with_capacity(HISTORY_CAPACITY),
        }
    }

    pub(crate) fn record(&mut self, time: Instant) {
        if self.times.len() == HISTORY_CAPACITY {
            self.times.pop_front();
        }
        self.times.push_back(time);
    }

    /// Shortest gap between consecutive paints, or `None` with fewer than
    /// two samples.
    pub(crate) fn shortest_gap(&self) -> Option<Duration> {
        self.times
            .iter()
            .zip(self.times.iter().skip(1))
            .map(|(a, b)| b.duration_since(*a))
            .min()
    }
}

/// Compute the sleep before the next grab cycle.
///
/// The interval is at least the exposure time (there cannot be a new frame
/// sooner) and at least [`MIN_GRAB_DELAY`]; on top of that it follows the
/// display's observed throughput, clamped to [`MAX_GRAB_DELAY`].
pub(crate) fn compute_grab_delay(exposure_ms: f64, shortest_gap: Option<Duration>) -> Duration {
    let rate_limit = MIN_GRAB_DELAY.max(Duration::from_secs_f64(exposure_ms.max(0.0) / 1000.0));
    let target = match shortest_gap {
        Some(gap) => rate_limit.max(gap.mul_f64(DISPLAY_GAP_FRACTION)),
        None => rate_limit,
    };
    target.min(MAX_GRAB_DELAY)
}

/// Everything a grabber run needs, captured at streaming start.
pub(crate) struct GrabberContext {
    pub(crate) device: Arc<dyn DeviceCore>,
    pub(crate) commands: mpsc::Sender<LiveCommand>,
    pub(crate) stop: watch::Receiver<bool>,
    pub(crate) paint_events: mpsc::UnboundedReceiver<Instant>,
    pub(crate) generation: u64,
    pub(crate) channel_count: usize,
    pub(crate) exposure_ms: f64,
    pub(crate) camera_name: String,
}

/// Run the grabber loop until stopped.
pub(crate) async fn run(mut ctx: GrabberContext) {
    debug!(
        generation = ctx.generation,
        channels = ctx.channel_count,
        exposure_ms = ctx.exposure_ms,
        "grabber loop started"
    );
    let mut history = DisplayUpdateHistory::new();
    loop {
        while let Ok(time) = ctx.paint_events.try_recv() {
            history.record(time);
        }
        let delay = compute_grab_delay(ctx.exposure_ms, history.shortest_gap());
        tokio::time::sleep(delay).await;
        if *ctx.stop.borrow() {
            break;
        }
        if !drain_cycle(&mut ctx).await {
            break;
        }
    }
    debug!(generation = ctx.generation, "grabber loop exited");
}

/// Drain one cycle's worth of frames. Returns `false` when the loop should
/// exit (stop requested, controller gone, or a submission failed).
async fn drain_cycle(ctx: &mut GrabberContext) -> bool {
    let mut filled: HashSet<usize> = HashSet::new();
    let mut collected: Vec<Image> = Vec::new();

    for offset in 0..(BUFFER_SCAN_FACTOR * ctx.channel_count) {
        if *ctx.stop.borrow() {
            return false;
        }
        let tagged = match ctx.device.buffered_frame(offset).await {
            Ok(tagged) => tagged,
            Err(DeviceError::NoFrameAvailable(_)) => continue,
            Err(err) => {
                warn!(error = %err, offset, "buffer read failed");
                continue;
            }
        };
        let channel = match channel_from_tags(&tagged.tags, &ctx.camera_name) {
            Ok(Some(channel)) => channel,
            Ok(None) => offset,
            Err(err) => {
                warn!(error = %err, offset, "skipping frame with malformed tags");
                continue;
            }
        };
        if channel >= ctx.channel_count {
            trace!(channel, "frame tagged outside the channel range");
            continue;
        }
        if !filled.insert(channel) {
            // A newer frame for this channel was already collected this cycle.
            continue;
        }
        collected.push(Image::from_tagged(tagged, channel, &ctx.camera_name));
        if filled.len() == ctx.channel_count {
            break;
        }
    }

    collected.sort_by_key(|image| image.coords.channel);

    for image in collected {
        if *ctx.stop.borrow() {
            return false;
        }
        let (response, rx) = oneshot::channel();
        let command = LiveCommand::DisplayImage {
            image,
            generation: ctx.generation,
            from_grabber: true,
            response,
        };
        tokio::select! {
            sent = ctx.commands.send(command) => {
                if sent.is_err() {
                    return false;
                }
            }
            _ = ctx.stop.changed() => return false,
        }
        tokio::select! {
            result = rx => match result {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => return false,
            },
            _ = ctx.stop.changed() => return false,
        }
    }
    true
}

/// Read the camera-channel index from a frame's tag bag.
///
/// Returns `Ok(None)` when the tag is absent (single-camera adapters do not
/// tag), and an error when the tag is present but not an integer.
fn channel_from_tags(tags: &serde_json::Value, camera_name: &str) -> anyhow::Result<Option<usize>> {
    let key = format!("{camera_name}-{CHANNEL_INDEX_TAG}");
    match tags.get(&key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|channel| Some(channel as usize))
            .ok_or_else(|| anyhow::anyhow!("tag '{key}' is not an integer: {value}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delay_floors_at_min_for_short_exposures() {
        assert_eq!(compute_grab_delay(10.0, None), MIN_GRAB_DELAY);
        assert_eq!(compute_grab_delay(0.0, None), MIN_GRAB_DELAY);
    }

    #[test]
    fn delay_tracks_exposure_when_longer() {
        assert_eq!(compute_grab_delay(100.0, None), Duration::from_millis(100));
    }

    #[test]
    fn delay_caps_at_max_for_long_exposures() {
        assert_eq!(compute_grab_delay(2000.0, None), MAX_GRAB_DELAY);
    }

    #[test]
    fn delay_follows_display_throughput_above_rate_limit() {
        // 100 ms paints: 0.75 * 100 = 75 ms, above the 33 ms floor.
        let gap = Some(Duration::from_millis(100));
        assert_eq!(compute_grab_delay(10.0, gap), Duration::from_millis(75));
    }

    #[test]
    fn steady_display_at_40ms_settles_loop_at_rate_limit() {
        // Exposure 10 ms, display painting every 40 ms: the display target
        // 0.75 * 40 = 30 ms is clamped up to the 33 ms rate limit.
        let mut history = DisplayUpdateHistory::new();
        let base = Instant::now();
        for i in 0..10u32 {
            history.record(base + Duration::from_millis(u64::from(i) * 40));
        }
        assert_eq!(history.shortest_gap(), Some(Duration::from_millis(40)));
        assert_eq!(compute_grab_delay(10.0, history.shortest_gap()), MIN_GRAB_DELAY);
    }

    #[test]
    fn history_keeps_shortest_gap_and_bounded_length() {
        let mut history = DisplayUpdateHistory::new();
        let base = Instant::now();
        let mut t = base;
        // Irregular paints; the 5 ms gap should win.
        for gap in [40u64, 5, 60, 40] {
            history.record(t);
            t += Duration::from_millis(gap);
        }
        history.record(t);
        assert_eq!(history.shortest_gap(), Some(Duration::from_millis(5)));

        // Eviction keeps the window bounded.
        for i in 0..(HISTORY_CAPACITY as u64 * 2) {
            history.record(base + Duration::from_secs(i + 10));
        }
        assert!(history.times.len() <= HISTORY_CAPACITY);
    }

    #[test]
    fn empty_history_has_no_gap() {
        let mut history = DisplayUpdateHistory::new();
        assert_eq!(history.shortest_gap(), None);
        history.record(Instant::now());
        assert_eq!(history.shortest_gap(), None);
    }

    #[test]
    fn channel_tag_parsing() {
        let tags = json!({ "Cam-CameraChannelIndex": 2 });
        assert_eq!(channel_from_tags(&tags, "Cam").unwrap(), Some(2));

        let untagged = json!({});
        assert_eq!(channel_from_tags(&untagged, "Cam").unwrap(), None);

        let other_camera = json!({ "Other-CameraChannelIndex": 1 });
        assert_eq!(channel_from_tags(&other_camera, "Cam").unwrap(), None);

        let malformed = json!({ "Cam-CameraChannelIndex": "two" });
        assert!(channel_from_tags(&malformed, "Cam").is_err());
    }
}
