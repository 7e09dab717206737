//! In-memory frame store backing one live session.
//!
//! The store is a rewritable, erasable collection of images keyed by
//! [`Coords`]. Live mode overwrites the same coordinates on every cycle, so
//! unlike acquisition datastores there is no rewrite protection. The store
//! can be frozen (e.g. when the user saves a snapshot), after which inserts
//! fail and the live controller replaces it.
//!
//! Displays observe the store through a broadcast channel of inserted
//! coordinates rather than polling.

use crate::core::{Coords, Image};
use crate::error::StoreError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of the insert-notification channel. Lagging observers drop
/// notifications, never block the inserter.
const INSERT_CHANNEL_CAPACITY: usize = 64;

/// Summary metadata shared by all images in a store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryMetadata {
    /// Name of the channel configuration group the names were derived from.
    pub channel_group: String,
    /// Display name per camera channel, in channel order.
    pub channel_names: Vec<String>,
}

/// Erasable in-memory image store keyed by coordinates.
pub struct FrameStore {
    name: String,
    images: Mutex<HashMap<Coords, Image>>,
    summary: Mutex<SummaryMetadata>,
    frozen: AtomicBool,
    insert_tx: broadcast::Sender<Coords>,
}

impl FrameStore {
    /// Create an empty store with a human-readable name.
    pub fn new(name: impl Into<String>) -> Self {
        let (insert_tx, _) = broadcast::channel(INSERT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            images: Mutex::new(HashMap::new()),
            summary: Mutex::new(SummaryMetadata::default()),
            frozen: AtomicBool::new(false),
            insert_tx,
        }
    }

    /// The store's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert an image, overwriting any image already at its coordinates.
    ///
    /// Fails with [`StoreError::Frozen`] once the store has been frozen.
    pub fn insert(&self, image: Image) -> Result<(), StoreError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(StoreError::Frozen);
        }
        let coords = image.coords;
        {
            let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
            images.insert(coords, image);
        }
        // Nobody listening is fine; displays come and go.
        let _ = self.insert_tx.send(coords);
        Ok(())
    }

    /// Retrieve a copy of the image at the given coordinates.
    pub fn get(&self, coords: Coords) -> Option<Image> {
        let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images.get(&coords).cloned()
    }

    /// Number of images currently held.
    pub fn image_count(&self) -> usize {
        let images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images.len()
    }

    /// Remove all images. The store remains usable afterwards.
    pub fn erase(&self) {
        let mut images = self.images.lock().unwrap_or_else(|e| e.into_inner());
        images.clear();
    }

    /// Freeze the store; subsequent inserts fail.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    /// Whether the store has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Replace the summary channel names.
    pub fn set_channel_names(&self, channel_group: impl Into<String>, names: Vec<String>) {
        let mut summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
        summary.channel_group = channel_group.into();
        summary.channel_names = names;
    }

    /// A copy of the current summary metadata.
    pub fn summary_metadata(&self) -> SummaryMetadata {
        let summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
        summary.clone()
    }

    /// Subscribe to insert notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Coords> {
        self.insert_tx.subscribe()
    }
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("name", &self.name)
            .field("images", &self.image_count())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
