//! Custom error types for the console.
//!
//! This module defines the typed errors used at each component boundary.
//! Using the `thiserror` crate, it provides a centralized and consistent way
//! to handle the different kinds of failures the acquisition path can hit:
//!
//! - **`DeviceError`**: failures at the device-core boundary (hardware
//!   start/stop, single-shot acquisition, buffer reads). `NoFrameAvailable`
//!   is routine during live polling and is handled silently by the grabber.
//! - **`StoreError`**: failures inserting into the frame store. The store is
//!   erasable, so the only insertion failure is a frozen store.
//! - **`PipelineError`**: failures submitting an image through the processing
//!   chain. The three variants have distinct recovery policies, documented on
//!   each variant.
//! - **`LiveError`**: the controller-level error returned by the public API,
//!   wrapping the above.
//!
//! By using `#[from]`, `LiveError` can be seamlessly created from the
//! underlying error types, simplifying error handling with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type AppResult<T> = std::result::Result<T, LiveError>;

/// Errors originating at the device-core boundary.
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    /// The circular buffer has no frame at the requested offset. Routine
    /// during live polling; the grabber skips to the next offset.
    #[error("no frame available at buffer offset {0}")]
    NoFrameAvailable(usize),

    /// Continuous streaming could not be started.
    #[error("failed to start continuous acquisition: {0}")]
    StartFailed(String),

    /// Streaming could not be stopped cleanly.
    #[error("failed to stop acquisition: {0}")]
    StopFailed(String),

    /// A single-shot acquisition failed.
    #[error("single-shot acquisition failed: {0}")]
    SnapFailed(String),

    /// Any other device fault.
    #[error("device fault: {0}")]
    Fault(String),
}

/// Errors from the frame store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store was frozen (e.g. a snapshot was saved) and no longer
    /// accepts insertions.
    #[error("frame store is frozen")]
    Frozen,
}

/// Errors from submitting an image through the processing pipeline.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// The store refused to overwrite an existing image. Impossible with an
    /// erasable store; surfaced as an internal-error log, never to the user.
    #[error("image rewrite rejected by the frame store")]
    RewriteRejected,

    /// A processor in the chain failed. User-visible; live mode is stopped
    /// and the pending error queue cleared so the next start begins clean.
    #[error("image processing failed: {0}")]
    Processing(String),

    /// The store was concurrently frozen. Expected race; recovered by a
    /// transparent session reset and a single retry of the same image.
    #[error("frame store frozen during insert")]
    StoreFrozen,
}

/// Controller-level error returned by the public live-mode API.
#[derive(Error, Debug)]
pub enum LiveError {
    /// A device-core operation failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A pipeline submission failed and could not be recovered locally.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The controller task has shut down and can no longer accept commands.
    #[error("live controller is shut down")]
    ControllerGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_wraps_into_live_error() {
        let err: LiveError = DeviceError::StartFailed("simulated".into()).into();
        assert!(matches!(err, LiveError::Device(DeviceError::StartFailed(_))));
        assert!(err.to_string().contains("simulated"));
    }

    #[test]
    fn pipeline_error_messages_are_distinct() {
        let rewrite = PipelineError::RewriteRejected.to_string();
        let frozen = PipelineError::StoreFrozen.to_string();
        let processing = PipelineError::Processing("bad kernel".into()).to_string();
        assert_ne!(rewrite, frozen);
        assert!(processing.contains("bad kernel"));
    }
}
