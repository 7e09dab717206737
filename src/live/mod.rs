//! Live-mode acquisition controller.
//!
//! This module owns all logic surrounding live mode and the snap-image
//! preview: starting and stopping continuous hardware streaming, nested
//! suspension for unrelated hardware changes, hot session resets when image
//! geometry or channel semantics change, and recovery from downstream
//! processing failures.
//!
//! # Architecture
//!
//! A single controller task is the sole owner of the mode state, the display
//! surface, and the pipeline. External callers hold a cloneable
//! [`LiveHandle`] and interact purely by message passing: each call sends a
//! [`LiveCommand`] over an mpsc channel and awaits the response on a oneshot
//! channel. Serializing every mutation through one task removes the
//! lock-ordering discipline a multi-lock design would need, while keeping
//! the same observable behavior.
//!
//! ```text
//! GUI / scripts ──LiveCommand──> controller task ──spawns──> grabber loop
//!       ^                            │   ^                        │
//!       └────────responses───────────┘   └──DisplayImage──────────┘
//! ```
//!
//! The grabber loop submits drained frames back through the same command
//! channel, tagged with its generation and `from_grabber`, which lets the
//! controller discard submissions from a superseded run and avoid joining a
//! task that is waiting on the controller's own reply.

mod actor;
mod grabber;
mod session;

use crate::core::{DeviceCore, Image};
use crate::data::PipelineFactory;
use crate::display::{DisplayFactory, DisplaySurface};
use crate::error::{AppResult, LiveError};
use actor::LiveController;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Depth of the controller's command queue.
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Capacity of the mode-changed event channel.
const EVENT_QUEUE_DEPTH: usize = 32;

/// Broadcast to listeners whenever the nominal live-mode state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveModeEvent {
    /// The nominal state after the transition.
    pub is_on: bool,
}

/// Commands processed by the controller task. Each variant carries a oneshot
/// responder, implementing request-response over async channels.
pub(crate) enum LiveCommand {
    SetLiveMode {
        on: bool,
        response: oneshot::Sender<Result<(), LiveError>>,
    },
    SetSuspended {
        suspend: bool,
        response: oneshot::Sender<Result<(), LiveError>>,
    },
    Snap {
        should_display: bool,
        response: oneshot::Sender<Result<Vec<Image>, LiveError>>,
    },
    DisplayImage {
        image: Image,
        /// Streaming-run generation of the submitter; stale generations are
        /// discarded. Zero for submissions from outside the grabber.
        generation: u64,
        from_grabber: bool,
        response: oneshot::Sender<Result<(), LiveError>>,
    },
    ReplacePipeline {
        factory: Arc<dyn PipelineFactory>,
        response: oneshot::Sender<()>,
    },
    RequestDisplayClose {
        response: oneshot::Sender<()>,
    },
    CurrentDisplay {
        response: oneshot::Sender<Option<Arc<dyn DisplaySurface>>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the live-mode controller.
///
/// All methods are non-blocking apart from awaiting the controller's reply;
/// `snap` additionally blocks for the device when live mode is off.
#[derive(Clone)]
pub struct LiveHandle {
    commands: mpsc::Sender<LiveCommand>,
    live_on: Arc<AtomicBool>,
    events: broadcast::Sender<LiveModeEvent>,
}

impl LiveHandle {
    /// Spawn the controller task and return a handle to it.
    ///
    /// The device core, display factory, and pipeline factory are injected
    /// so tests can substitute fakes for all three.
    pub fn spawn(
        device: Arc<dyn DeviceCore>,
        displays: Arc<dyn DisplayFactory>,
        pipelines: Arc<dyn PipelineFactory>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        let live_on = Arc::new(AtomicBool::new(false));
        let controller = LiveController::new(
            device,
            displays,
            pipelines,
            commands.clone(),
            events.clone(),
            live_on.clone(),
        );
        tokio::spawn(controller.run(command_rx));
        Self {
            commands,
            live_on,
            events,
        }
    }

    async fn request<T>(
        &self,
        command: LiveCommand,
        rx: oneshot::Receiver<T>,
    ) -> AppResult<T> {
        self.commands
            .send(command)
            .await
            .map_err(|_| LiveError::ControllerGone)?;
        rx.await.map_err(|_| LiveError::ControllerGone)
    }

    /// Turn live mode nominally on or off. Idempotent. A hardware start
    /// failure forces the mode back off and is returned as the error.
    pub async fn set_live_mode(&self, on: bool) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(LiveCommand::SetLiveMode { on, response }, rx)
            .await?
    }

    /// Suspend or resume physical streaming without changing the nominal
    /// state. Calls nest; every `set_suspended(true)` must be paired with
    /// exactly one `set_suspended(false)`. Unbalanced resumes are a caller
    /// bug and are not detected beyond a debug assertion.
    pub async fn set_suspended(&self, suspend: bool) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(LiveCommand::SetSuspended { suspend, response }, rx)
            .await?
    }

    /// Snap one image per channel. While physically streaming this returns
    /// the cached most-recent images without touching the device; otherwise
    /// it performs a single-shot acquisition, optionally displaying the
    /// result.
    pub async fn snap(&self, should_display: bool) -> AppResult<Vec<Image>> {
        let (response, rx) = oneshot::channel();
        self.request(
            LiveCommand::Snap {
                should_display,
                response,
            },
            rx,
        )
        .await?
    }

    /// Route an image into the preview, resetting the session first if its
    /// geometry or channel naming no longer matches.
    pub async fn display_image(&self, image: Image) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(
            LiveCommand::DisplayImage {
                image,
                generation: 0,
                from_grabber: false,
                response,
            },
            rx,
        )
        .await?
    }

    /// Whether live mode is nominally on (it may be suspended).
    pub fn is_live_mode_on(&self) -> bool {
        self.live_on.load(Ordering::SeqCst)
    }

    /// The current preview display, or `None` when closed or never created.
    pub async fn current_display(&self) -> AppResult<Option<Arc<dyn DisplaySurface>>> {
        let (response, rx) = oneshot::channel();
        self.request(LiveCommand::CurrentDisplay { response }, rx)
            .await
    }

    /// Register for mode-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<LiveModeEvent> {
        self.events.subscribe()
    }

    /// Install a new pipeline factory; takes effect at the next session
    /// reset, which is requested immediately.
    pub async fn replace_pipeline(&self, factory: Arc<dyn PipelineFactory>) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(LiveCommand::ReplacePipeline { factory, response }, rx)
            .await
    }

    /// The user asked to close the preview window: live mode goes off and
    /// the display is released (its position is remembered).
    pub async fn request_display_close(&self) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(LiveCommand::RequestDisplayClose { response }, rx)
            .await
    }

    /// Stop live mode and terminate the controller task.
    pub async fn shutdown(&self) -> AppResult<()> {
        let (response, rx) = oneshot::channel();
        self.request(LiveCommand::Shutdown { response }, rx).await
    }
}
