//! RTCP sender report data with extended fields.

use std::time::Instant;

use rtcp::sender_report::SenderReport;
use utils::NtpTime;

/// A sender report as ingested from the publisher, with the 32-bit RTP
/// timestamp and packet count lifted into extended counters against the
/// previously seen report.
#[derive(Debug, Clone, Copy)]
pub struct RtcpSenderReportData {
    pub rtp_timestamp: u32,
    pub rtp_timestamp_ext: u64,
    pub ntp_timestamp: NtpTime,
    pub packet_count: u32,
    pub packet_count_ext: u64,
    /// Padding-only packets the ingress dropped before counting, used to
    /// reconcile the publisher's packet count on resync.
    pub padding_only_drops: u64,
    /// When the report arrived, on the monotonic clock.
    pub at: Instant,
}

impl RtcpSenderReportData {
    /// Wraps a parsed RTCP sender report. Extended fields start at the
    /// wire values; ingestion re-anchors them against the newest report.
    pub fn from_sender_report(sr: &SenderReport, padding_only_drops: u64, at: Instant) -> Self {
        Self {
            rtp_timestamp: sr.rtp_time,
            rtp_timestamp_ext: sr.rtp_time as u64,
            ntp_timestamp: NtpTime(sr.ntp_time),
            packet_count: sr.packet_count,
            packet_count_ext: sr.packet_count as u64,
            padding_only_drops,
            at,
        }
    }
}
