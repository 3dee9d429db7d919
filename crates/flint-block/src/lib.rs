//! Block-device vocabulary shared between storage drivers and the
//! client-facing block-device manager.
//!
//! Drivers implement [`BlockDevice`] for each disk they discover and hand the
//! device to a [`DiskManager`]. The manager owns partition discovery,
//! per-client request queues and request arbitration; none of that lives
//! here. This crate only fixes the contract between the two sides:
//!
//! - capability reporting (capacity, sector size, transfer limits, discard
//!   support),
//! - chained I/O descriptors ([`InoutBlock`]) carrying DMA bus addresses,
//! - asynchronous completion via one-shot callbacks.
//!
//! All I/O is asynchronous: `inout_data`, `flush` and `discard` enqueue work
//! and return immediately; the completion callback fires from the driver's
//! interrupt path.

mod device;
mod error;

pub use device::{
    BlockDevice, Direction, DiscardInfo, DiskManager, DmaTarget, InoutBlock, InoutFlags,
    IoCallback, ReadyCallback,
};
pub use error::{BlockError, Result};
