//! Image processing pipeline between acquisition and the frame store.
//!
//! A [`Pipeline`] is an ordered chain of [`ImageProcessor`]s ending in a
//! [`FrameStore`]. Live mode builds one pipeline per session through a
//! [`PipelineFactory`], so replacing the application's processor chain takes
//! effect on the next session reset.

use crate::core::Image;
use crate::data::store::FrameStore;
use crate::error::{PipelineError, StoreError};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A single transform stage in the processing chain.
///
/// Processors run synchronously on the controller task; heavy stages should
/// do their own internal batching rather than block for long stretches.
pub trait ImageProcessor: Send + Sync {
    /// Descriptive name for logs.
    fn name(&self) -> &str {
        "processor"
    }

    /// Transform one image. An error aborts the submission; live mode is
    /// stopped and the error is surfaced to the user.
    fn process(&mut self, image: Image) -> anyhow::Result<Image>;
}

/// Builds the processor chain for a new live session.
pub trait PipelineFactory: Send + Sync {
    /// Create the processors, in application order.
    fn build(&self) -> Vec<Box<dyn ImageProcessor>>;
}

/// Factory producing an empty chain; images pass straight to the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPipelineFactory;

impl PipelineFactory for PassthroughPipelineFactory {
    fn build(&self) -> Vec<Box<dyn ImageProcessor>> {
        Vec::new()
    }
}

/// An ordered processor chain feeding a frame store.
pub struct Pipeline {
    processors: Vec<Box<dyn ImageProcessor>>,
    store: Arc<FrameStore>,
    pending_errors: Mutex<Vec<String>>,
}

impl Pipeline {
    /// Assemble a pipeline over the given store.
    pub fn new(processors: Vec<Box<dyn ImageProcessor>>, store: Arc<FrameStore>) -> Self {
        Self {
            processors,
            store,
            pending_errors: Mutex::new(Vec::new()),
        }
    }

    /// The store this pipeline feeds.
    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// Run an image through the chain and insert the result into the store.
    pub fn insert_image(&mut self, image: Image) -> Result<(), PipelineError> {
        let mut current = image;
        for processor in &mut self.processors {
            match processor.process(current) {
                Ok(next) => current = next,
                Err(err) => {
                    let message = format!("{}: {err:#}", processor.name());
                    let mut pending = self
                        .pending_errors
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    pending.push(message.clone());
                    return Err(PipelineError::Processing(message));
                }
            }
        }
        match self.store.insert(current) {
            Ok(()) => Ok(()),
            Err(StoreError::Frozen) => Err(PipelineError::StoreFrozen),
        }
    }

    /// Errors recorded since the last [`clear_errors`](Self::clear_errors).
    pub fn pending_errors(&self) -> Vec<String> {
        let pending = self
            .pending_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        pending.clone()
    }

    /// Discard pending processor errors so the next run starts clean.
    pub fn clear_errors(&self) {
        let mut pending = self
            .pending_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !pending.is_empty() {
            debug!(count = pending.len(), "clearing pending pipeline errors");
            pending.clear();
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.processors.len())
            .field("store", &self.store.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Coords, Frame, TaggedFrame};

    struct Invert;

    impl ImageProcessor for Invert {
        fn name(&self) -> &str {
            "invert"
        }

        fn process(&mut self, mut image: Image) -> anyhow::Result<Image> {
            for byte in &mut image.frame.data {
                *byte = !*byte;
            }
            Ok(image)
        }
    }

    struct AlwaysFails;

    impl ImageProcessor for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        fn process(&mut self, _image: Image) -> anyhow::Result<Image> {
            anyhow::bail!("synthetic failure")
        }
    }

    fn test_image() -> Image {
        let tagged = TaggedFrame {
            frame: Frame::from_u8(2, 2, vec![0x0f; 4]),
            tags: serde_json::Value::Null,
            image_number: None,
        };
        Image::from_tagged(tagged, 0, "TestCam")
    }

    #[test]
    fn chain_transforms_before_store() {
        let store = Arc::new(FrameStore::new("Snap/Live"));
        let mut pipeline = Pipeline::new(vec![Box::new(Invert)], store.clone());
        pipeline.insert_image(test_image()).unwrap();
        let stored = store.get(Coords::live(0)).unwrap();
        assert!(stored.frame.data.iter().all(|&b| b == 0xf0));
    }

    #[test]
    fn processor_failure_records_pending_error() {
        let store = Arc::new(FrameStore::new("Snap/Live"));
        let mut pipeline = Pipeline::new(vec![Box::new(AlwaysFails)], store.clone());
        let err = pipeline.insert_image(test_image()).unwrap_err();
        assert!(matches!(err, PipelineError::Processing(_)));
        assert_eq!(pipeline.pending_errors().len(), 1);
        assert_eq!(store.image_count(), 0);

        pipeline.clear_errors();
        assert!(pipeline.pending_errors().is_empty());
    }

    #[test]
    fn frozen_store_maps_to_store_frozen() {
        let store = Arc::new(FrameStore::new("Snap/Live"));
        store.freeze();
        let mut pipeline = Pipeline::new(Vec::new(), store);
        let err = pipeline.insert_image(test_image()).unwrap_err();
        assert!(matches!(err, PipelineError::StoreFrozen));
    }
}
