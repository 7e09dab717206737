//! # Microscope Console Core Library
//!
//! This crate is the core of `scope_console`, a laboratory microscope
//! control console. It contains the live-mode acquisition controller and
//! the abstractions it coordinates: the hardware device core, the frame
//! store and processing pipeline, and the preview display surface.
//!
//! ## Crate Structure
//!
//! - **`config`**: structures for loading and validating application
//!   configuration from TOML files and environment variables.
//! - **`core`**: the fundamental traits and data types, most importantly
//!   the [`core::DeviceCore`] hardware abstraction and the image types
//!   that flow through the system.
//! - **`data`**: the erasable [`data::FrameStore`] backing a live session
//!   and the [`data::Pipeline`] of image processors that feeds it.
//! - **`device`**: device-core implementations; currently the simulated
//!   camera used by the demo binary and the test suite.
//! - **`display`**: the preview window abstraction and a headless
//!   implementation of it.
//! - **`error`**: the typed error taxonomy shared across the crate.
//! - **`live`**: the live-mode acquisition controller, the subsystem this
//!   crate exists for. See [`live::LiveHandle`].
//! - **`tracing_setup`**: logging initialization for the binary.

pub mod config;
pub mod core;
pub mod data;
pub mod device;
pub mod display;
pub mod error;
pub mod live;
pub mod tracing_setup;
