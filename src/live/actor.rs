//! The controller task behind [`crate::live::LiveHandle`].
//!
//! Sole owner of the mode state, the current session (store + pipeline), and
//! the display surface. Processes [`LiveCommand`]s sequentially, so every
//! state transition is serialized without locks.
//!
//! # Mode state
//!
//! `nominally_on` tracks the caller's intent and survives suspension;
//! `suspend_depth` counts nested suspend requests. Hardware streaming is
//! physically active iff `nominally_on && suspend_depth == 0`. When the
//! depth returns to zero the physical state is matched back up with the
//! nominal state.
//!
//! # Stop-from-within-the-grabber
//!
//! Stopping streaming normally joins the grabber task before issuing the
//! hardware stop, so a last-instant poll cannot race camera teardown. When
//! the stop originates from a command the grabber itself submitted (a
//! processing failure, or a reset triggered by one of its frames), joining
//! would wait on a task that is waiting on our reply; the `from_grabber`
//! flag makes that case explicit and skips the join. The grabber's stop
//! signal is already set at that point, and it exits without touching the
//! device again.

use crate::core::{DeviceCore, Image};
use crate::data::{FrameStore, Pipeline, PipelineFactory};
use crate::display::{DisplayFactory, DisplaySurface};
use crate::error::{LiveError, PipelineError};
use crate::live::grabber::{self, GrabberContext};
use crate::live::session::{channel_display_name, LiveSession};
use crate::live::{LiveCommand, LiveModeEvent};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Name given to every live-session frame store.
const LIVE_STORE_NAME: &str = "Snap/Live";

struct GrabberHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

pub(crate) struct LiveController {
    device: Arc<dyn DeviceCore>,
    display_factory: Arc<dyn DisplayFactory>,
    pipeline_factory: Arc<dyn PipelineFactory>,
    commands: mpsc::Sender<LiveCommand>,
    events: broadcast::Sender<LiveModeEvent>,
    live_on: Arc<AtomicBool>,

    nominally_on: bool,
    suspend_depth: u32,

    session: Option<LiveSession>,
    display: Option<Arc<dyn DisplaySurface>>,
    last_location: Option<crate::display::ScreenLocation>,
    paint_tx: Option<mpsc::UnboundedSender<Instant>>,
    force_reset: bool,
    channel_count: Option<usize>,

    grabber: Option<GrabberHandle>,
    generation: u64,
}

impl LiveController {
    pub(crate) fn new(
        device: Arc<dyn DeviceCore>,
        display_factory: Arc<dyn DisplayFactory>,
        pipeline_factory: Arc<dyn PipelineFactory>,
        commands: mpsc::Sender<LiveCommand>,
        events: broadcast::Sender<LiveModeEvent>,
        live_on: Arc<AtomicBool>,
    ) -> Self {
        Self {
            device,
            display_factory,
            pipeline_factory,
            commands,
            events,
            live_on,
            nominally_on: false,
            suspend_depth: 0,
            session: None,
            display: None,
            last_location: None,
            paint_tx: None,
            // The very first image always builds a session from scratch.
            force_reset: true,
            channel_count: None,
            grabber: None,
            generation: 0,
        }
    }

    /// Event loop. Runs until a `Shutdown` command or until every handle is
    /// dropped; either way live mode is stopped on the way out.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<LiveCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                LiveCommand::SetLiveMode { on, response } => {
                    let result = self.set_live_mode(on, false).await;
                    let _ = response.send(result);
                }
                LiveCommand::SetSuspended { suspend, response } => {
                    let result = self.set_suspended(suspend, false).await;
                    let _ = response.send(result);
                }
                LiveCommand::Snap {
                    should_display,
                    response,
                } => {
                    let result = self.snap(should_display).await;
                    let _ = response.send(result);
                }
                LiveCommand::DisplayImage {
                    image,
                    generation,
                    from_grabber,
                    response,
                } => {
                    if from_grabber && generation != self.generation {
                        trace!(
                            generation,
                            current = self.generation,
                            "discarding frame from a superseded streaming run"
                        );
                        let _ = response.send(Ok(()));
                    } else {
                        let result = self.display_image(image, from_grabber).await;
                        let _ = response.send(result);
                    }
                }
                LiveCommand::ReplacePipeline { factory, response } => {
                    self.pipeline_factory = factory;
                    self.force_reset = true;
                    debug!("pipeline replaced; session reset scheduled");
                    let _ = response.send(());
                }
                LiveCommand::RequestDisplayClose { response } => {
                    self.handle_display_close().await;
                    let _ = response.send(());
                }
                LiveCommand::CurrentDisplay { response } => {
                    let display = self
                        .display
                        .as_ref()
                        .filter(|display| !display.is_closed())
                        .cloned();
                    let _ = response.send(display);
                }
                LiveCommand::Shutdown { response } => {
                    let _ = self.set_live_mode(false, false).await;
                    let _ = response.send(());
                    return;
                }
            }
        }
        // All handles dropped without an explicit shutdown.
        let _ = self.set_live_mode(false, false).await;
    }

    async fn set_live_mode(&mut self, on: bool, from_grabber: bool) -> Result<(), LiveError> {
        if self.nominally_on == on {
            return Ok(());
        }
        info!(on, "live mode changing");
        self.nominally_on = on;
        self.live_on.store(on, Ordering::SeqCst);
        if on {
            if self.suspend_depth == 0 {
                self.start_streaming_or_force_off(from_grabber).await?;
            }
            if let Some(display) = &self.display {
                display.to_front();
            }
        } else {
            self.stop_streaming(from_grabber).await;
        }
        let _ = self.events.send(LiveModeEvent { is_on: on });
        Ok(())
    }

    /// Nested suspension. The depth survives live-mode changes; only the
    /// transitions through zero touch the hardware.
    async fn set_suspended(&mut self, suspend: bool, from_grabber: bool) -> Result<(), LiveError> {
        if suspend {
            if self.suspend_depth == 0 && self.nominally_on {
                self.stop_streaming(from_grabber).await;
            }
            self.suspend_depth += 1;
        } else {
            debug_assert!(self.suspend_depth > 0, "resume without matching suspend");
            if self.suspend_depth == 0 {
                error!("resume without matching suspend; ignoring");
                return Ok(());
            }
            self.suspend_depth -= 1;
            if self.suspend_depth == 0 && self.nominally_on {
                self.start_streaming_or_force_off(from_grabber).await?;
            }
        }
        Ok(())
    }

    async fn start_streaming_or_force_off(
        &mut self,
        from_grabber: bool,
    ) -> Result<(), LiveError> {
        match self.start_streaming(from_grabber).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "could not start streaming; forcing live mode off");
                self.nominally_on = false;
                self.live_on.store(false, Ordering::SeqCst);
                let _ = self.events.send(LiveModeEvent { is_on: false });
                Err(err)
            }
        }
    }

    async fn start_streaming(&mut self, from_grabber: bool) -> Result<(), LiveError> {
        // Make sure any previous run is fully down first.
        self.stop_streaming(from_grabber).await;

        self.device
            .start_continuous_acquisition()
            .await
            .map_err(LiveError::Device)?;

        let channels = self.device.camera_channel_count().await;
        if self.channel_count != Some(channels) {
            // Channel semantics changed since the last run.
            self.force_reset = true;
        }
        self.channel_count = Some(channels);

        let exposure_ms = self.device.exposure_ms().await;
        if let Some(session) = &mut self.session {
            session.exposure_ms = exposure_ms;
            // The camera restarts its sequence numbering with the stream.
            session.reset_image_numbers();
        }
        let camera_name = self.device.camera_device_name().await;

        // Fresh paint channel per run; the history must start empty.
        let (paint_tx, paint_rx) = mpsc::unbounded_channel();
        if let Some(display) = &self.display {
            display.register_paint_listener(paint_tx.clone());
        }
        self.paint_tx = Some(paint_tx);

        self.generation += 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let context = GrabberContext {
            device: self.device.clone(),
            commands: self.commands.clone(),
            stop: stop_rx,
            paint_events: paint_rx,
            generation: self.generation,
            channel_count: channels,
            exposure_ms,
            camera_name,
        };
        let join = tokio::spawn(grabber::run(context));
        self.grabber = Some(GrabberHandle {
            stop: stop_tx,
            join,
        });
        Ok(())
    }

    async fn stop_streaming(&mut self, from_grabber: bool) {
        if let Some(handle) = self.grabber.take() {
            let _ = handle.stop.send(true);
            if from_grabber {
                // The stop came from a command the grabber submitted; it is
                // waiting on our reply, so joining it here would deadlock.
                trace!("stop originates in grabber context; skipping self-join");
            } else if let Err(err) = handle.join.await {
                if !err.is_cancelled() {
                    warn!(error = %err, "grabber task terminated abnormally");
                }
            }
        }
        if self.device.is_acquiring().await {
            if let Err(err) = self.device.stop_acquisition().await {
                error!(error = %err, "failed to stop acquisition; check shutter state");
            }
        }
    }

    /// Whether routing this image requires tearing the session down first.
    async fn needs_reset(&self, image: &Image) -> bool {
        if self.force_reset {
            return true;
        }
        let Some(session) = &self.session else {
            return true;
        };
        match &self.display {
            Some(display) if !display.is_closed() => {}
            _ => return true,
        }
        if let Some(geometry) = session.geometry() {
            if image.geometry() != geometry {
                debug!(
                    previous = ?geometry,
                    new = ?image.geometry(),
                    "image geometry changed"
                );
                return true;
            }
        }
        // Channel display names must match what the store's summary lists.
        let names = session.store.summary_metadata().channel_names;
        let config = self.device.current_channel_config_name().await;
        let camera_channels = join_all(
            (0..session.channel_count).map(|channel| self.device.camera_channel_name(channel)),
        )
        .await;
        for (channel, camera_channel) in camera_channels.iter().enumerate() {
            let expected = channel_display_name(&config, camera_channel, session.channel_count);
            if names.get(channel) != Some(&expected) {
                debug!(channel, expected, "channel naming changed");
                return true;
            }
        }
        false
    }

    /// Route an image into the session, resetting first when required.
    ///
    /// Pipeline failure handling:
    /// - rewrite rejection cannot happen with an erasable store and is only
    ///   logged;
    /// - a processing error stops live mode entirely and clears the pending
    ///   error queue;
    /// - a concurrently frozen store triggers a transparent reset and a
    ///   single retry of the same image.
    async fn display_image(&mut self, image: Image, from_grabber: bool) -> Result<(), LiveError> {
        let mut retried = false;
        loop {
            if self.needs_reset(&image).await {
                self.reset_session(from_grabber).await?;
            }

            let insert_result = {
                let Some(session) = self.session.as_mut() else {
                    error!("no session after reset; dropping image");
                    return Ok(());
                };
                if session.is_duplicate(&image) {
                    trace!(
                        channel = image.coords.channel,
                        "frame already delivered for this channel"
                    );
                    return Ok(());
                }
                session.note_image(&image);
                session.pipeline.insert_image(image.clone())
            };

            match insert_result {
                Ok(()) => return Ok(()),
                Err(PipelineError::RewriteRejected) => {
                    error!("store rejected a rewrite; live stores are erasable, this should never happen");
                    return Ok(());
                }
                Err(PipelineError::Processing(message)) => {
                    error!(error = %message, "image processing failed; stopping live mode");
                    let _ = self.set_live_mode(false, from_grabber).await;
                    if let Some(session) = &self.session {
                        session.pipeline.clear_errors();
                    }
                    return Err(LiveError::Pipeline(PipelineError::Processing(message)));
                }
                Err(PipelineError::StoreFrozen) => {
                    if retried {
                        warn!("store frozen again immediately after reset; dropping frame");
                        return Err(LiveError::Pipeline(PipelineError::StoreFrozen));
                    }
                    debug!("store frozen mid-stream; resetting and retrying once");
                    retried = true;
                    self.force_reset = true;
                }
            }
        }
    }

    /// Tear down and recreate the session. The display is recreated only if
    /// missing or closed; otherwise it is reused in place, keeping its
    /// screen position.
    async fn reset_session(&mut self, from_grabber: bool) -> Result<(), LiveError> {
        let channels = match self.channel_count {
            Some(channels) => channels,
            None => {
                let channels = self.device.camera_channel_count().await;
                self.channel_count = Some(channels);
                channels
            }
        };

        // Streaming must be down while the store and display swap out.
        self.set_suspended(true, from_grabber).await?;

        if let Some(old) = self.session.take() {
            old.store.erase();
        }

        let store = Arc::new(FrameStore::new(LIVE_STORE_NAME));
        let config = self.device.current_channel_config_name().await;
        let camera_channels =
            join_all((0..channels).map(|channel| self.device.camera_channel_name(channel))).await;
        let names = camera_channels
            .iter()
            .map(|camera_channel| channel_display_name(&config, camera_channel, channels))
            .collect();
        store.set_channel_names(config, names);

        let pipeline = Pipeline::new(self.pipeline_factory.build(), store.clone());
        let exposure_ms = self.device.exposure_ms().await;

        let mut reusable = None;
        if let Some(display) = self.display.take() {
            if display.is_closed() {
                // Position was recorded when the close was handled.
            } else {
                self.last_location = Some(display.screen_location());
                reusable = Some(display);
            }
        }
        let display = match reusable {
            Some(display) => {
                display.attach(store.clone());
                display
            }
            None => {
                let display = self.display_factory.create(store.clone());
                if let Some(location) = self.last_location {
                    display.set_screen_location(location);
                }
                if let Some(paint_tx) = &self.paint_tx {
                    display.register_paint_listener(paint_tx.clone());
                }
                display.show();
                display
            }
        };
        self.display = Some(display);

        self.session = Some(LiveSession::new(store, pipeline, channels, exposure_ms));
        self.force_reset = false;
        debug!(channels, "live session reset");

        self.set_suspended(false, from_grabber).await
    }

    /// Snap one image per channel; see [`crate::live::LiveHandle::snap`].
    async fn snap(&mut self, should_display: bool) -> Result<Vec<Image>, LiveError> {
        if self.nominally_on && self.suspend_depth == 0 {
            // Live mode is already supplying fresh frames.
            let cached = self
                .session
                .as_ref()
                .map(LiveSession::cached_images)
                .unwrap_or_default();
            return Ok(cached);
        }

        let camera_name = self.device.camera_device_name().await;
        let frames = self.device.snap().await.map_err(LiveError::Device)?;
        let images: Vec<Image> = frames
            .into_iter()
            .enumerate()
            .map(|(channel, frame)| Image::from_tagged(frame, channel, &camera_name))
            .collect();

        if should_display {
            let channels = self.device.camera_channel_count().await;
            if self.channel_count != Some(channels) {
                self.force_reset = true;
            }
            self.channel_count = Some(channels);
            for image in &images {
                self.display_image(image.clone(), false).await?;
            }
            if let Some(display) = &self.display {
                display.to_front();
            }
        }
        Ok(images)
    }

    async fn handle_display_close(&mut self) {
        let _ = self.set_live_mode(false, false).await;
        if let Some(display) = self.display.take() {
            self.last_location = Some(display.screen_location());
            display.close();
        }
        self.force_reset = true;
        debug!("preview display released at user request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PassthroughPipelineFactory;
    use crate::device::MockDeviceCore;
    use crate::display::HeadlessDisplayFactory;
    use std::time::Duration;

    fn controller(device: Arc<MockDeviceCore>) -> LiveController {
        let (commands, _rx) = mpsc::channel(8);
        let (events, _) = broadcast::channel(8);
        LiveController::new(
            device,
            Arc::new(HeadlessDisplayFactory::new(Duration::from_millis(1))),
            Arc::new(PassthroughPipelineFactory),
            commands,
            events,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn balanced_suspends_restore_streaming() {
        let device = Arc::new(MockDeviceCore::builder().build());
        let mut ctl = controller(device.clone());

        ctl.set_live_mode(true, false).await.unwrap();
        assert!(device.is_acquiring().await);

        ctl.set_suspended(true, false).await.unwrap();
        ctl.set_suspended(true, false).await.unwrap();
        assert!(!device.is_acquiring().await);
        assert!(ctl.nominally_on);

        ctl.set_suspended(false, false).await.unwrap();
        // Still nested; must stay stopped.
        assert!(!device.is_acquiring().await);
        ctl.set_suspended(false, false).await.unwrap();
        assert!(device.is_acquiring().await);

        ctl.set_live_mode(false, false).await.unwrap();
    }

    #[tokio::test]
    async fn suspend_while_off_does_not_touch_hardware() {
        let device = Arc::new(MockDeviceCore::builder().build());
        let mut ctl = controller(device.clone());

        ctl.set_suspended(true, false).await.unwrap();
        ctl.set_suspended(false, false).await.unwrap();
        assert_eq!(device.start_calls(), 0);
        assert_eq!(device.stop_calls(), 0);
    }

    #[tokio::test]
    async fn live_mode_started_while_suspended_begins_on_resume() {
        let device = Arc::new(MockDeviceCore::builder().build());
        let mut ctl = controller(device.clone());

        ctl.set_suspended(true, false).await.unwrap();
        ctl.set_live_mode(true, false).await.unwrap();
        assert!(!device.is_acquiring().await);
        assert!(ctl.nominally_on);

        ctl.set_suspended(false, false).await.unwrap();
        assert!(device.is_acquiring().await);
        ctl.set_live_mode(false, false).await.unwrap();
    }

    #[tokio::test]
    async fn unbalanced_resume_saturates_at_zero() {
        let device = Arc::new(MockDeviceCore::builder().build());
        let mut ctl = controller(device.clone());

        // Depth is already zero; a stray resume must not underflow or start
        // streaming. Exercised without debug assertions in release tests;
        // here we only verify the release-mode behavior when assertions are
        // compiled out.
        if cfg!(debug_assertions) {
            return;
        }
        ctl.set_suspended(false, false).await.unwrap();
        assert_eq!(ctl.suspend_depth, 0);
        assert_eq!(device.start_calls(), 0);
    }

    #[tokio::test]
    async fn set_live_mode_is_idempotent() {
        let device = Arc::new(MockDeviceCore::builder().build());
        let mut ctl = controller(device.clone());

        ctl.set_live_mode(true, false).await.unwrap();
        ctl.set_live_mode(true, false).await.unwrap();
        assert_eq!(device.start_calls(), 1);

        ctl.set_live_mode(false, false).await.unwrap();
        ctl.set_live_mode(false, false).await.unwrap();
        // One stop from the transition; the initial start issues none
        // because the device was idle.
        assert!(device.stop_calls() >= 1);
    }

    #[tokio::test]
    async fn start_failure_forces_live_mode_off() {
        let device = Arc::new(MockDeviceCore::builder().build());
        device.set_fail_start(true);
        let mut ctl = controller(device.clone());

        let result = ctl.set_live_mode(true, false).await;
        assert!(result.is_err());
        assert!(!ctl.nominally_on);
        assert!(!device.is_acquiring().await);
    }
}
