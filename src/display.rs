//! Display surface abstraction for the live/snap preview window.
//!
//! The controller never talks to a concrete window toolkit. It holds a
//! [`DisplaySurface`] trait object created through an injected
//! [`DisplayFactory`], and learns about actual paint throughput through
//! paint-timestamp listeners. The [`HeadlessDisplay`] implementation renders
//! nothing but models a window's consumption rate; the demo binary and the
//! integration tests both run on it.

use crate::core::Coords;
use crate::data::FrameStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Channel used to deliver paint timestamps to interested parties.
pub type PaintListener = mpsc::UnboundedSender<Instant>;

/// On-screen position of a display window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScreenLocation {
    /// Horizontal position in screen coordinates.
    pub x: i32,
    /// Vertical position in screen coordinates.
    pub y: i32,
}

/// A preview window that renders images pulled from a frame store and
/// reports a paint timestamp after each render.
pub trait DisplaySurface: Send + Sync {
    /// Make the window visible.
    fn show(&self);

    /// Raise the window above its siblings.
    fn to_front(&self);

    /// Close the window. Idempotent.
    fn close(&self);

    /// Whether the window has been closed.
    fn is_closed(&self) -> bool;

    /// Point the window at a (possibly new) frame store.
    fn attach(&self, store: Arc<FrameStore>);

    /// Register a listener that receives a timestamp after every paint.
    fn register_paint_listener(&self, listener: PaintListener);

    /// Current window position.
    fn screen_location(&self) -> ScreenLocation;

    /// Move the window.
    fn set_screen_location(&self, location: ScreenLocation);
}

/// Creates display surfaces for new live sessions.
pub trait DisplayFactory: Send + Sync {
    /// Create a surface attached to the given store. The surface is returned
    /// hidden; the controller calls [`DisplaySurface::show`].
    fn create(&self, store: Arc<FrameStore>) -> Arc<dyn DisplaySurface>;
}

/// A windowless display used by the demo binary and the test suite.
///
/// It consumes store-insert notifications, spends a configurable render time
/// per image, and then notifies paint listeners, which is all the live
/// controller can observe of a real window.
pub struct HeadlessDisplay {
    render_time: Duration,
    closed: AtomicBool,
    visible: AtomicBool,
    location: Mutex<ScreenLocation>,
    listeners: Arc<Mutex<Vec<PaintListener>>>,
    render_task: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessDisplay {
    /// Create a display that takes `render_time` to paint each image.
    pub fn new(render_time: Duration) -> Self {
        Self {
            render_time,
            closed: AtomicBool::new(false),
            visible: AtomicBool::new(false),
            location: Mutex::new(ScreenLocation::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            render_task: Mutex::new(None),
        }
    }

    fn stop_render_task(&self) {
        let mut task = self.render_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = task.take() {
            task.abort();
        }
    }

    async fn render_loop(
        mut inserts: broadcast::Receiver<Coords>,
        render_time: Duration,
        listeners: Arc<Mutex<Vec<PaintListener>>>,
    ) {
        loop {
            match inserts.recv().await {
                Ok(coords) => {
                    // Painting takes real time; inserts that arrive meanwhile
                    // lag the channel and get skipped, like dropped repaints.
                    tokio::time::sleep(render_time).await;
                    trace!(?coords, "painted image");
                    let now = Instant::now();
                    let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
                    listeners.retain(|listener| listener.send(now).is_ok());
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "display lagged behind inserts");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl DisplaySurface for HeadlessDisplay {
    fn show(&self) {
        self.visible.store(true, Ordering::SeqCst);
        debug!("display shown");
    }

    fn to_front(&self) {
        trace!("display raised");
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop_render_task();
            debug!("display closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn attach(&self, store: Arc<FrameStore>) {
        self.stop_render_task();
        let inserts = store.subscribe();
        let listeners = self.listeners.clone();
        let render_time = self.render_time;
        let handle = tokio::spawn(Self::render_loop(inserts, render_time, listeners));
        let mut task = self.render_task.lock().unwrap_or_else(|e| e.into_inner());
        *task = Some(handle);
    }

    fn register_paint_listener(&self, listener: PaintListener) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.push(listener);
    }

    fn screen_location(&self) -> ScreenLocation {
        *self.location.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_screen_location(&self, location: ScreenLocation) {
        let mut current = self.location.lock().unwrap_or_else(|e| e.into_inner());
        *current = location;
    }
}

impl Drop for HeadlessDisplay {
    fn drop(&mut self) {
        self.stop_render_task();
    }
}

/// Factory for [`HeadlessDisplay`] surfaces.
#[derive(Debug, Clone)]
pub struct HeadlessDisplayFactory {
    render_time: Duration,
}

impl HeadlessDisplayFactory {
    /// Displays from this factory take `render_time` to paint each image.
    pub fn new(render_time: Duration) -> Self {
        Self { render_time }
    }
}

impl DisplayFactory for HeadlessDisplayFactory {
    fn create(&self, store: Arc<FrameStore>) -> Arc<dyn DisplaySurface> {
        let display = Arc::new(HeadlessDisplay::new(self.render_time));
        display.attach(store);
        display
    }
}
