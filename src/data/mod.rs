//! Data handling: the live frame store and the image processing pipeline.

pub mod pipeline;
pub mod store;

pub use pipeline::{ImageProcessor, PassthroughPipelineFactory, Pipeline, PipelineFactory};
pub use store::{FrameStore, SummaryMetadata};
