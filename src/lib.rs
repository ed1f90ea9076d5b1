//! Per-track media reception core of a selective forwarding unit.
//!
//! For every remote track a client publishes, this crate maintains the
//! reception bookkeeping an SFU needs to forward it well: monotone
//! extended sequence numbers and timestamps, loss/duplicate/out-of-order
//! and jitter statistics (in [`buffer`]), simulcast/SVC layer
//! availability with bitrates per layer, inter-layer timestamp mapping
//! from sender reports, a bounded memory of forwarded packets to answer
//! NACKs, and transit latency aggregation.
//!
//! The transport, signaling, and codec layers live elsewhere; packets
//! arrive here already parsed, and subscribers are reached through the
//! [`TrackSender`] capability.

#![warn(rust_2018_idioms)]

pub mod config;
mod error;
mod forward_stats;
mod receiver;
mod sequencer;
mod spreader;
pub mod stream_tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use forward_stats::{ForwardStats, ForwardStatsReport, OnForwardStatsReport};
pub use receiver::{
    Receiver, ReceiverParams, SubscriberId, TrackId, TrackReceiver, TrackSender,
};
pub use sequencer::{PacketMeta, Sequencer};
pub use spreader::DownTrackSpreader;
pub use stream_tracker::{
    StreamStatus, StreamTrackerManager, StreamTrackerManagerListener, TrackKind, TrackParams,
    TrackSource,
};

/// True when the mime type is an SVC codec carrying all spatial layers in
/// one RTP stream.
pub fn is_svc_codec(mime: &str) -> bool {
    matches!(
        mime.to_ascii_lowercase().as_str(),
        "video/av1" | "video/vp9"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_svc_codec() {
        assert!(is_svc_codec("video/AV1"));
        assert!(is_svc_codec("video/vp9"));
        assert!(!is_svc_codec("video/h264"));
        assert!(!is_svc_codec("audio/opus"));
    }
}
