//! Shared primitives for the media reception core.
//!
//! This crate holds the building blocks that the stats engine and the
//! receiver plumbing are written on top of: the wrap-around extender that
//! lifts 16/32-bit wire counters into monotone 64-bit values, the
//! single-consumer ops queue, the windowed latency aggregate, NTP time
//! conversions, and a one-shot fuse for worker shutdown.

#![warn(rust_2018_idioms)]

pub mod fuse;
pub mod latency;
pub mod ntp;
pub mod ops_queue;
pub mod wrap_around;

pub use fuse::Fuse;
pub use latency::{LatencyAggregate, Welford};
pub use ntp::NtpTime;
pub use ops_queue::{OpsQueue, OpsQueueParams};
pub use wrap_around::{WrapAround, WrapAroundUpdateResult};
