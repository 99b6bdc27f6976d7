//! Audio driver backends.
//!
//! A driver owns the platform I/O and calls the engine back once per block
//! with the current time, the frame count, and per-channel sample
//! buffers. [`CpalDriver`] talks to real hardware through cpal;
//! [`OfflineDriver`] pumps blocks by hand for tests and offline
//! rendering.

mod cpal_backend;
mod offline;
mod traits;

pub use cpal_backend::CpalDriver;
pub use offline::OfflineDriver;
pub use traits::{Driver, DriverError, ProcessCallback};
