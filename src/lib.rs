//! Host-side runtime for heterogeneous parallel compute devices.
//!
//! See [`loom`] for the command queue engine, the event tracker, device memory management and
//! the device backends.

pub mod loom;
