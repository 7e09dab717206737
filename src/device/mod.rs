//! Device-core implementations.
//!
//! The live controller consumes the [`crate::core::DeviceCore`] trait; this
//! module holds the implementations shipped with the console. Real hardware
//! adapters live behind the same trait in their own crates.

pub mod mock;
pub mod pattern;

pub use mock::{MockDeviceCore, MockDeviceCoreBuilder};
