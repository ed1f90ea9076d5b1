//! Per-stream RTP reception ledger for the SFU media reception core.
//!
//! The heart of this crate is [`RtpStats`], which keeps the lifetime
//! bookkeeping of one incoming RTP stream: extended sequence numbers and
//! timestamps, loss/duplicate/out-of-order classification, RFC 3550
//! jitter, drift, and rolling snapshots. [`Buffer`] wraps one stream end
//! to end: it feeds the stats engine, remembers raw packets for
//! retransmission, chases losses upstream, throttles keyframe requests,
//! and queues extended packets towards the forwarder.

#![warn(rust_2018_idioms)]

mod audio_level;
mod buffer;
mod error;
mod layer;
mod nack;
mod packet_cache;
mod rtp_stats;
mod sender_report;

pub use audio_level::{AudioLevel, AudioLevelParams};
pub use buffer::{
    Buffer, ExtPacket, OnRtcpFeedback, OnRtcpSenderReport, RtcpPackets, WritePacket,
};
pub use error::{Error, Result};
pub use layer::{
    Bitrates, VideoLayer, DEFAULT_MAX_LAYER_SPATIAL, DEFAULT_MAX_LAYER_TEMPORAL, INVALID_LAYER,
    INVALID_LAYER_SPATIAL, INVALID_LAYER_TEMPORAL,
};
pub use nack::NackQueue;
pub use packet_cache::PacketCache;
pub use rtp_stats::{
    aggregate_rtp_delta_info, aggregate_rtp_stats, RtpDeltaInfo, RtpDrift, RtpFlowState, RtpStats,
    RtpStatsParams, RtpStatsSummary, FIRST_SNAPSHOT_ID, GAP_HISTOGRAM_NUM_BINS,
    NUM_SEQUENCE_NUMBERS, SN_INFO_SIZE,
};
pub use sender_report::RtcpSenderReportData;
