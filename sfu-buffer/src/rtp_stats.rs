//! Per-stream RTP reception ledger.
//!
//! One `RtpStats` tracks a single incoming RTP stream for its whole
//! lifetime: extended sequence numbers and timestamps, loss / duplicate /
//! out-of-order classification, RFC 3550 jitter, drift against the
//! publisher's sender reports, and rolling snapshots that consumers read
//! as deltas. All per-packet work is O(1).

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtp::header::Header;

use utils::ntp::{rtt_from_reception_report, NtpTime};
use utils::WrapAround;

use crate::error::{Error, Result};
use crate::sender_report::RtcpSenderReportData;

pub const GAP_HISTOGRAM_NUM_BINS: usize = 101;
pub const NUM_SEQUENCE_NUMBERS: u64 = 65536;
pub const FIRST_SNAPSHOT_ID: u32 = 1;
pub const SN_INFO_SIZE: usize = 8192;
pub const SN_INFO_MASK: usize = SN_INFO_SIZE - 1;

const FIRST_PACKET_TIME_ADJUST_WINDOW: Duration = Duration::from_secs(120);
const FIRST_PACKET_TIME_ADJUST_THRESHOLD: Duration = Duration::from_secs(5);

/// What the stats engine concluded about one incoming packet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtpFlowState {
    pub is_not_handled: bool,

    pub has_loss: bool,
    pub loss_start_inclusive: u64,
    pub loss_end_exclusive: u64,

    pub is_duplicate: bool,
    pub is_out_of_order: bool,

    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct IntervalStats {
    pub(crate) packets: u64,
    pub(crate) bytes: u64,
    pub(crate) header_bytes: u64,
    pub(crate) packets_padding: u64,
    pub(crate) bytes_padding: u64,
    pub(crate) header_bytes_padding: u64,
    pub(crate) packets_lost: u64,
    pub(crate) packets_out_of_order: u64,
    pub(crate) frames: u32,
}

/// Counters accumulated between two reads of the same snapshot id.
#[derive(Debug, Clone, Copy)]
pub struct RtpDeltaInfo {
    pub start_time: Instant,
    pub duration: Duration,
    pub packets: u32,
    pub bytes: u64,
    pub header_bytes: u64,
    pub packets_duplicate: u32,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,
    pub packets_padding: u32,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,
    pub packets_lost: u32,
    pub packets_missing: u32,
    pub packets_out_of_order: u32,
    pub frames: u32,
    pub rtt_max: u32,
    pub jitter_max: f64,
    pub nacks: u32,
    pub plis: u32,
    pub firs: u32,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    start_time: Instant,
    ext_start_sn: u64,
    ext_start_sn_overridden: u64,
    packets_duplicate: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    packets_lost_overridden: u64,
    nacks: u32,
    plis: u32,
    firs: u32,
    max_rtt: u32,
    max_jitter: f64,
    max_jitter_overridden: f64,
}

impl Snapshot {
    fn at_start(start_time: Instant, ext_start_sn: u64) -> Self {
        Self {
            start_time,
            ext_start_sn,
            ext_start_sn_overridden: ext_start_sn,
            packets_duplicate: 0,
            bytes_duplicate: 0,
            header_bytes_duplicate: 0,
            packets_lost_overridden: 0,
            nacks: 0,
            plis: 0,
            firs: 0,
            max_rtt: 0,
            max_jitter: 0.0,
            max_jitter_overridden: 0.0,
        }
    }
}

/// One slot of the recent-sequence-number ring. A zero `pkt_size` marks
/// the slot as lost until an out-of-order arrival fills it.
#[derive(Debug, Default, Clone, Copy)]
struct SnInfo {
    hdr_size: u16,
    pkt_size: u16,
    is_padding_only: bool,
    marker: bool,
    is_out_of_order: bool,
}

/// Timestamp drift measured over an interval.
#[derive(Debug, Clone, Copy)]
pub struct RtpDrift {
    pub duration: f64,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    pub rtp_clock_ticks: u64,
    pub drift_samples: i64,
    pub drift_ms: f64,
    pub clock_rate: f64,
}

impl fmt::Display for RtpDrift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "t: {:.2}s, ts: {}|{}|{}, d: {}|{:.2}ms, cr: {:.2}",
            self.duration,
            self.start_timestamp,
            self.end_timestamp,
            self.rtp_clock_ticks,
            self.drift_samples,
            self.drift_ms,
            self.clock_rate
        )
    }
}

#[derive(Debug, Clone)]
pub struct RtpStatsParams {
    pub clock_rate: u32,
    /// When set, loss/jitter/rtt for public reporting come from the
    /// subscriber's receiver reports instead of local observation.
    pub is_receiver_report_driven: bool,
}

struct StatsInner {
    initialized: bool,
    resync_on_next_packet: bool,
    should_discount_padding_only_drops: bool,

    start_time: Option<Instant>,
    start_time_system: Option<SystemTime>,
    end_time: Option<Instant>,
    end_time_system: Option<SystemTime>,

    sequence_number: WrapAround<u16>,

    ext_highest_sn_overridden: u64,
    last_rr_time: Option<Instant>,
    last_rr: ReceptionReport,

    timestamp: WrapAround<u32>,

    first_time: Option<Instant>,
    highest_time: Option<Instant>,

    last_transit: u32,
    last_jitter_rtp: u32,

    bytes: u64,
    header_bytes: u64,
    bytes_duplicate: u64,
    header_bytes_duplicate: u64,
    bytes_padding: u64,
    header_bytes_padding: u64,
    packets_duplicate: u64,
    packets_padding: u64,

    packets_out_of_order: u64,

    packets_lost: u64,
    packets_lost_overridden: u64,

    frames: u32,

    jitter: f64,
    max_jitter: f64,
    jitter_overridden: f64,
    max_jitter_overridden: f64,

    sn_infos: Box<[SnInfo]>,
    sn_info_write_ptr: usize,

    gap_histogram: [u32; GAP_HISTOGRAM_NUM_BINS],

    nacks: u32,
    nack_acks: u32,
    nack_misses: u32,
    nack_repeated: u32,

    plis: u32,
    last_pli: Option<Instant>,

    layer_lock_plis: u32,
    last_layer_lock_pli: Option<Instant>,

    firs: u32,
    last_fir: Option<Instant>,

    key_frames: u32,
    last_key_frame: Option<Instant>,

    rtt: u32,
    max_rtt: u32,

    sr_first: Option<RtcpSenderReportData>,
    sr_newest: Option<RtcpSenderReportData>,

    next_snapshot_id: u32,
    snapshots: HashMap<u32, Snapshot>,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            initialized: false,
            resync_on_next_packet: false,
            should_discount_padding_only_drops: false,
            start_time: None,
            start_time_system: None,
            end_time: None,
            end_time_system: None,
            sequence_number: WrapAround::new(),
            ext_highest_sn_overridden: 0,
            last_rr_time: None,
            last_rr: ReceptionReport::default(),
            timestamp: WrapAround::new(),
            first_time: None,
            highest_time: None,
            last_transit: 0,
            last_jitter_rtp: 0,
            bytes: 0,
            header_bytes: 0,
            bytes_duplicate: 0,
            header_bytes_duplicate: 0,
            bytes_padding: 0,
            header_bytes_padding: 0,
            packets_duplicate: 0,
            packets_padding: 0,
            packets_out_of_order: 0,
            packets_lost: 0,
            packets_lost_overridden: 0,
            frames: 0,
            jitter: 0.0,
            max_jitter: 0.0,
            jitter_overridden: 0.0,
            max_jitter_overridden: 0.0,
            sn_infos: vec![SnInfo::default(); SN_INFO_SIZE].into_boxed_slice(),
            sn_info_write_ptr: 0,
            gap_histogram: [0; GAP_HISTOGRAM_NUM_BINS],
            nacks: 0,
            nack_acks: 0,
            nack_misses: 0,
            nack_repeated: 0,
            plis: 0,
            last_pli: None,
            layer_lock_plis: 0,
            last_layer_lock_pli: None,
            firs: 0,
            last_fir: None,
            key_frames: 0,
            last_key_frame: None,
            rtt: 0,
            max_rtt: 0,
            sr_first: None,
            sr_newest: None,
            next_snapshot_id: FIRST_SNAPSHOT_ID,
            snapshots: HashMap::new(),
        }
    }

    fn packets_expected(&self) -> u64 {
        self.sequence_number
            .extended_highest()
            .wrapping_sub(self.sequence_number.extended_start())
            .wrapping_add(1)
    }

    fn total_packets_primary(&self) -> u64 {
        let packets_expected = self.packets_expected();
        if self.packets_lost > packets_expected {
            // should not happen
            return 0;
        }

        let packets_seen = packets_expected - self.packets_lost;
        if self.packets_padding > packets_seen {
            return 0;
        }

        packets_seen - self.packets_padding
    }

    fn packets_lost_reported(&self, params: &RtpStatsParams) -> u64 {
        if params.is_receiver_report_driven && self.last_rr_time.is_some() {
            self.packets_lost_overridden
        } else {
            self.packets_lost
        }
    }

    fn ext_highest_sn_adjusted(&self, params: &RtpStatsParams) -> u64 {
        if params.is_receiver_report_driven && self.last_rr_time.is_some() {
            self.ext_highest_sn_overridden
        } else {
            self.sequence_number.extended_highest()
        }
    }

    fn sn_info_out_of_order_ptr(&self, esn: u64, ehsn: u64) -> Option<usize> {
        if esn.wrapping_sub(ehsn) as i64 > 0 {
            // in-order, not expected, maybe too new
            return None;
        }

        let offset = ehsn.wrapping_sub(esn) as usize;
        if offset >= SN_INFO_SIZE {
            // too old, ignore
            return None;
        }

        Some(self.sn_info_write_ptr.wrapping_sub(offset + 1) & SN_INFO_MASK)
    }

    fn set_sn_info(
        &mut self,
        esn: u64,
        ehsn: u64,
        pkt_size: u16,
        hdr_size: u16,
        payload_size: usize,
        marker: bool,
        is_out_of_order: bool,
    ) {
        let write_ptr = if (esn.wrapping_sub(ehsn) as i64) < 0 {
            match self.sn_info_out_of_order_ptr(esn, ehsn) {
                Some(ptr) => ptr,
                None => return,
            }
        } else {
            let ptr = self.sn_info_write_ptr;
            self.sn_info_write_ptr = (ptr + 1) & SN_INFO_MASK;
            ptr
        };

        let sn_info = &mut self.sn_infos[write_ptr];
        sn_info.pkt_size = pkt_size;
        sn_info.hdr_size = hdr_size;
        sn_info.is_padding_only = payload_size == 0;
        sn_info.marker = marker;
        sn_info.is_out_of_order = is_out_of_order;
    }

    fn clear_sn_infos(&mut self, ext_start_inclusive: u64, ext_end_exclusive: u64) {
        let mut esn = ext_start_inclusive;
        while esn != ext_end_exclusive {
            self.sn_infos[self.sn_info_write_ptr] = SnInfo::default();
            self.sn_info_write_ptr = (self.sn_info_write_ptr + 1) & SN_INFO_MASK;
            esn = esn.wrapping_add(1);
        }
    }

    fn is_sn_info_lost(&self, esn: u64, ehsn: u64) -> bool {
        match self.sn_info_out_of_order_ptr(esn, ehsn) {
            Some(ptr) => self.sn_infos[ptr].pkt_size == 0,
            None => false,
        }
    }

    fn interval_stats(&self, ext_start_inclusive: u64, ext_end_exclusive: u64) -> IntervalStats {
        let mut interval_stats = IntervalStats::default();
        let mut packets_not_found = 0u32;

        let ehsn = self.sequence_number.extended_highest();
        let mut esn = ext_start_inclusive;
        while esn != ext_end_exclusive {
            match self.sn_info_out_of_order_ptr(esn, ehsn) {
                None => packets_not_found += 1,
                Some(ptr) => {
                    let sn_info = &self.sn_infos[ptr];
                    if sn_info.pkt_size == 0 {
                        interval_stats.packets_lost += 1;
                    } else if sn_info.is_padding_only {
                        interval_stats.packets_padding += 1;
                        interval_stats.bytes_padding += sn_info.pkt_size as u64;
                        interval_stats.header_bytes_padding += sn_info.hdr_size as u64;
                    } else {
                        interval_stats.packets += 1;
                        interval_stats.bytes += sn_info.pkt_size as u64;
                        interval_stats.header_bytes += sn_info.hdr_size as u64;
                        if sn_info.is_out_of_order {
                            interval_stats.packets_out_of_order += 1;
                        }
                    }

                    if sn_info.marker {
                        interval_stats.frames += 1;
                    }
                }
            }
            esn = esn.wrapping_add(1);
        }

        if packets_not_found != 0 {
            error!(
                "could not find some packets, start: {}, end: {}, count: {}, highest: {}",
                ext_start_inclusive,
                ext_end_exclusive,
                packets_not_found,
                self.sequence_number.extended_highest(),
            );
        }
        interval_stats
    }

    fn update_gap_histogram(&mut self, gap: usize) {
        if gap < 2 {
            return;
        }

        let missing = gap - 1;
        if missing > GAP_HISTOGRAM_NUM_BINS {
            self.gap_histogram[GAP_HISTOGRAM_NUM_BINS - 1] += 1;
        } else {
            self.gap_histogram[missing - 1] += 1;
        }
    }

    fn update_jitter(&mut self, header: &Header, packet_time: Instant, clock_rate: u32) {
        // Do not update jitter on multiple packets of the same frame.
        // All packets of a frame carry the same timestamp.
        if self.last_jitter_rtp == header.timestamp {
            return;
        }

        let first_time = match self.first_time {
            Some(t) => t,
            None => return,
        };

        let time_since_first = packet_time
            .checked_duration_since(first_time)
            .unwrap_or(Duration::ZERO);
        let packet_time_rtp =
            (time_since_first.as_nanos() * clock_rate as u128 / 1_000_000_000) as u32;
        let transit = packet_time_rtp.wrapping_sub(header.timestamp);

        if self.last_transit != 0 {
            let d = (transit.wrapping_sub(self.last_transit) as i32).unsigned_abs();
            self.jitter += (d as f64 - self.jitter) / 16.0;
            if self.jitter > self.max_jitter {
                self.max_jitter = self.jitter;
            }

            let jitter = self.jitter;
            for s in self.snapshots.values_mut() {
                if jitter > s.max_jitter {
                    s.max_jitter = jitter;
                }
            }
        }

        self.last_transit = transit;
        self.last_jitter_rtp = header.timestamp;
    }

    fn maybe_adjust_first_packet_time(&mut self, clock_rate: u32, ets: u64) {
        let start_time = match self.start_time {
            Some(t) => t,
            None => return,
        };
        if start_time.elapsed() > FIRST_PACKET_TIME_ADJUST_WINDOW {
            return;
        }

        // For some time after the start, adjust the time of the first
        // packet. Adjusting only one way: if the first sample experienced
        // abnormal delay (pacing, queuing in a network element), push the
        // first time back to an earlier instant.
        let samples_diff = ets.wrapping_sub(self.timestamp.extended_start()) as i64;
        if samples_diff < 0 {
            // out-of-order, skip
            return;
        }

        let samples_duration = Duration::from_secs_f64(samples_diff as f64 / clock_rate as f64);
        let now = Instant::now();
        let adjusted = match now.checked_sub(samples_duration) {
            Some(t) => t,
            None => return,
        };

        let current = match self.first_time {
            Some(t) => t,
            None => return,
        };
        if adjusted < current {
            let adjustment = current - adjusted;
            if adjustment > FIRST_PACKET_TIME_ADJUST_THRESHOLD {
                info!(
                    "first packet time adjustment too big, ignoring, adjustment: {:?}, ext ts: {}, ext start ts: {}",
                    adjustment,
                    ets,
                    self.timestamp.extended_start(),
                );
            } else {
                debug!(
                    "adjusting first packet time, adjustment: {:?}, ext ts: {}",
                    adjustment, ets,
                );
                self.first_time = Some(adjusted);
            }
        }
    }

    fn drift(&self, clock_rate: u32) -> (Option<RtpDrift>, Option<RtpDrift>) {
        let mut packet_drift = None;
        if let (Some(first_time), Some(highest_time)) = (self.first_time, self.highest_time) {
            let elapsed = highest_time
                .checked_duration_since(first_time)
                .unwrap_or(Duration::ZERO);
            let rtp_clock_ticks = self
                .timestamp
                .extended_highest()
                .wrapping_sub(self.timestamp.extended_start());
            let drift_samples = rtp_clock_ticks
                .wrapping_sub((elapsed.as_nanos() * clock_rate as u128 / 1_000_000_000) as u64)
                as i64;
            if elapsed.as_secs_f64() > 0.0 {
                packet_drift = Some(RtpDrift {
                    duration: elapsed.as_secs_f64(),
                    start_timestamp: self.timestamp.extended_start(),
                    end_timestamp: self.timestamp.extended_highest(),
                    rtp_clock_ticks,
                    drift_samples,
                    drift_ms: (drift_samples as f64 * 1000.0) / clock_rate as f64,
                    clock_rate: rtp_clock_ticks as f64 / elapsed.as_secs_f64(),
                });
            }
        }

        let mut report_drift = None;
        if let (Some(sr_first), Some(sr_newest)) = (&self.sr_first, &self.sr_newest) {
            if sr_first.rtp_timestamp != sr_newest.rtp_timestamp {
                let elapsed = sr_newest.ntp_timestamp.seconds_since(sr_first.ntp_timestamp);
                let rtp_clock_ticks = sr_newest
                    .rtp_timestamp_ext
                    .wrapping_sub(sr_first.rtp_timestamp_ext);
                let drift_samples =
                    rtp_clock_ticks.wrapping_sub((elapsed * clock_rate as f64) as u64) as i64;
                if elapsed > 0.0 {
                    report_drift = Some(RtpDrift {
                        duration: elapsed,
                        start_timestamp: sr_first.rtp_timestamp_ext,
                        end_timestamp: sr_newest.rtp_timestamp_ext,
                        rtp_clock_ticks,
                        drift_samples,
                        drift_ms: (drift_samples as f64 * 1000.0) / clock_rate as f64,
                        clock_rate: rtp_clock_ticks as f64 / elapsed,
                    });
                }
            }
        }

        (packet_drift, report_drift)
    }

    fn get_and_reset_snapshot(
        &mut self,
        params: &RtpStatsParams,
        snapshot_id: u32,
        overridden: bool,
    ) -> Option<(Snapshot, Snapshot)> {
        if !self.initialized || (overridden && self.last_rr_time.is_none()) {
            return None;
        }

        let then = match self.snapshots.get(&snapshot_id) {
            Some(snapshot) => *snapshot,
            None => {
                let start_time = self.start_time?;
                let snapshot =
                    Snapshot::at_start(start_time, self.sequence_number.extended_start());
                self.snapshots.insert(snapshot_id, snapshot);
                snapshot
            }
        };

        let start_time = if overridden {
            self.last_rr_time?
        } else {
            Instant::now()
        };

        let now = Snapshot {
            start_time,
            ext_start_sn: self.sequence_number.extended_highest() + 1,
            ext_start_sn_overridden: self.ext_highest_sn_adjusted(params) + 1,
            packets_duplicate: self.packets_duplicate,
            bytes_duplicate: self.bytes_duplicate,
            header_bytes_duplicate: self.header_bytes_duplicate,
            packets_lost_overridden: self.packets_lost_overridden,
            nacks: self.nacks,
            plis: self.plis,
            firs: self.firs,
            max_rtt: self.rtt,
            max_jitter: self.jitter,
            max_jitter_overridden: self.jitter_overridden,
        };
        self.snapshots.insert(snapshot_id, now);

        Some((then, now))
    }
}

/// The per-stream stats engine.
pub struct RtpStats {
    params: RtpStatsParams,
    inner: RwLock<StatsInner>,
}

impl RtpStats {
    pub fn new(params: RtpStatsParams) -> Self {
        Self {
            params,
            inner: RwLock::new(StatsInner::new()),
        }
    }

    /// Clones counters from another engine so a renegotiated stream keeps
    /// numbering and history. The end time is intentionally not cloned.
    pub fn seed(&self, from: &RtpStats) {
        let from_inner = from.inner.read();
        if !from_inner.initialized {
            return;
        }

        let mut inner = self.inner.write();
        let end_time = inner.end_time;
        let end_time_system = inner.end_time_system;

        inner.initialized = from_inner.initialized;
        inner.resync_on_next_packet = from_inner.resync_on_next_packet;
        inner.should_discount_padding_only_drops = from_inner.should_discount_padding_only_drops;
        inner.start_time = from_inner.start_time;
        inner.start_time_system = from_inner.start_time_system;
        inner.sequence_number.seed(&from_inner.sequence_number);
        inner.ext_highest_sn_overridden = from_inner.ext_highest_sn_overridden;
        inner.last_rr_time = from_inner.last_rr_time;
        inner.last_rr = from_inner.last_rr.clone();
        inner.timestamp.seed(&from_inner.timestamp);
        inner.first_time = from_inner.first_time;
        inner.highest_time = from_inner.highest_time;
        inner.last_transit = from_inner.last_transit;
        inner.last_jitter_rtp = from_inner.last_jitter_rtp;
        inner.bytes = from_inner.bytes;
        inner.header_bytes = from_inner.header_bytes;
        inner.bytes_duplicate = from_inner.bytes_duplicate;
        inner.header_bytes_duplicate = from_inner.header_bytes_duplicate;
        inner.bytes_padding = from_inner.bytes_padding;
        inner.header_bytes_padding = from_inner.header_bytes_padding;
        inner.packets_duplicate = from_inner.packets_duplicate;
        inner.packets_padding = from_inner.packets_padding;
        inner.packets_out_of_order = from_inner.packets_out_of_order;
        inner.packets_lost = from_inner.packets_lost;
        inner.packets_lost_overridden = from_inner.packets_lost_overridden;
        inner.frames = from_inner.frames;
        inner.jitter = from_inner.jitter;
        inner.max_jitter = from_inner.max_jitter;
        inner.jitter_overridden = from_inner.jitter_overridden;
        inner.max_jitter_overridden = from_inner.max_jitter_overridden;
        inner.sn_infos.copy_from_slice(&from_inner.sn_infos);
        inner.sn_info_write_ptr = from_inner.sn_info_write_ptr;
        inner.gap_histogram = from_inner.gap_histogram;
        inner.nacks = from_inner.nacks;
        inner.nack_acks = from_inner.nack_acks;
        inner.nack_misses = from_inner.nack_misses;
        inner.nack_repeated = from_inner.nack_repeated;
        inner.plis = from_inner.plis;
        inner.last_pli = from_inner.last_pli;
        inner.layer_lock_plis = from_inner.layer_lock_plis;
        inner.last_layer_lock_pli = from_inner.last_layer_lock_pli;
        inner.firs = from_inner.firs;
        inner.last_fir = from_inner.last_fir;
        inner.key_frames = from_inner.key_frames;
        inner.last_key_frame = from_inner.last_key_frame;
        inner.rtt = from_inner.rtt;
        inner.max_rtt = from_inner.max_rtt;
        inner.sr_first = from_inner.sr_first;
        inner.sr_newest = from_inner.sr_newest;
        inner.next_snapshot_id = from_inner.next_snapshot_id;
        inner.snapshots = from_inner.snapshots.clone();

        inner.end_time = end_time;
        inner.end_time_system = end_time_system;
    }

    /// Freezes the engine. Mutators become no-ops afterwards.
    pub fn stop(&self) {
        let mut inner = self.inner.write();
        if inner.end_time.is_none() {
            inner.end_time = Some(Instant::now());
            inner.end_time_system = Some(SystemTime::now());
        }
    }

    pub fn is_active(&self) -> bool {
        let inner = self.inner.read();
        inner.initialized && inner.end_time.is_none()
    }

    /// Allocates a snapshot id; the baseline is recorded now if the
    /// stream has started, or at first packet otherwise.
    pub fn new_snapshot_id(&self) -> u32 {
        let mut inner = self.inner.write();

        let id = inner.next_snapshot_id;
        if inner.initialized {
            let ext_start_sn = inner.sequence_number.extended_start();
            if let Some(start_time) = inner.start_time {
                inner
                    .snapshots
                    .insert(id, Snapshot::at_start(start_time, ext_start_sn));
            }
        }

        inner.next_snapshot_id += 1;
        id
    }

    /// Processes one received packet and classifies it for the forwarder.
    pub fn update(
        &self,
        header: &Header,
        header_size: usize,
        payload_size: usize,
        padding_size: usize,
        packet_time: Instant,
    ) -> RtpFlowState {
        let mut inner = self.inner.write();

        if inner.end_time.is_some() {
            return RtpFlowState {
                is_not_handled: true,
                ..Default::default()
            };
        }

        if inner.resync_on_next_packet {
            inner.resync_on_next_packet = false;
            if inner.initialized {
                self.resync(&mut inner, header, packet_time);
            }
        }

        let res_sn;
        let res_ts;
        if !inner.initialized {
            if payload_size == 0 {
                // do not start on a padding only packet
                return RtpFlowState {
                    is_not_handled: true,
                    ..Default::default()
                };
            }

            inner.initialized = true;

            let start_time = Instant::now();
            inner.start_time = Some(start_time);
            inner.start_time_system = Some(SystemTime::now());

            inner.first_time = Some(packet_time);
            inner.highest_time = Some(packet_time);

            res_sn = inner.sequence_number.update(header.sequence_number);
            res_ts = inner.timestamp.update(header.timestamp);

            // initialize any snapshot ids handed out before the stream started
            let ext_start_sn = inner.sequence_number.extended_start();
            for id in FIRST_SNAPSHOT_ID..inner.next_snapshot_id {
                inner
                    .snapshots
                    .insert(id, Snapshot::at_start(start_time, ext_start_sn));
            }

            debug!(
                "rtp stream start, start sn: {}, start ts: {}",
                ext_start_sn,
                inner.timestamp.extended_start(),
            );
        } else {
            res_sn = inner.sequence_number.update(header.sequence_number);
            res_ts = inner.timestamp.update(header.timestamp);
        }

        let hdr_size = header_size as u64;
        let pkt_size = hdr_size + (payload_size + padding_size) as u64;
        let gap_sn = res_sn.extended_val.wrapping_sub(res_sn.pre_extended_highest) as i64;

        let mut flow_state = RtpFlowState::default();
        if gap_sn <= 0 {
            // duplicate OR out-of-order
            if payload_size == 0 {
                // a padding only packet must not re-anchor the stream
                if res_ts.is_restart {
                    info!(
                        "rolling back timestamp restart, ts before: {}, ts after: {}",
                        inner.timestamp.extended_start(),
                        res_ts.pre_extended_start,
                    );
                    inner.timestamp.rollback_restart(res_ts.pre_extended_start);
                }
                if res_sn.is_restart {
                    info!(
                        "rolling back sequence number restart, sn before: {}, sn after: {}",
                        inner.sequence_number.extended_start(),
                        res_sn.pre_extended_start,
                    );
                    inner
                        .sequence_number
                        .rollback_restart(res_sn.pre_extended_start);
                    return flow_state;
                }
            }

            if gap_sn != 0 {
                inner.packets_out_of_order += 1;
            }

            if res_sn.is_restart {
                inner.packets_lost += res_sn.pre_extended_start.wrapping_sub(res_sn.extended_val);

                let ext_start_sn = inner.sequence_number.extended_start();
                for s in inner.snapshots.values_mut() {
                    if s.ext_start_sn == res_sn.pre_extended_start {
                        s.ext_start_sn = ext_start_sn;
                    }
                }

                info!(
                    "adjusting start sequence number, sn before: {}, sn after: {}",
                    res_sn.pre_extended_start, res_sn.extended_val,
                );
            }

            if res_ts.is_restart {
                info!(
                    "adjusting start timestamp, ts before: {}, ts after: {}",
                    res_ts.pre_extended_start, res_ts.extended_val,
                );
            }

            if !inner.is_sn_info_lost(res_sn.extended_val, res_sn.pre_extended_highest) {
                inner.bytes_duplicate += pkt_size;
                inner.header_bytes_duplicate += hdr_size;
                inner.packets_duplicate += 1;
                flow_state.is_duplicate = true;
            } else {
                inner.packets_lost = inner.packets_lost.saturating_sub(1);
                inner.set_sn_info(
                    res_sn.extended_val,
                    res_sn.pre_extended_highest,
                    pkt_size as u16,
                    hdr_size as u16,
                    payload_size,
                    header.marker,
                    true,
                );
            }

            flow_state.is_out_of_order = true;
            flow_state.ext_sequence_number = res_sn.extended_val;
            flow_state.ext_timestamp = res_ts.extended_val;
        } else {
            // in-order
            inner.update_gap_histogram(gap_sn as usize);

            // mark the intervening sequence numbers missing
            inner.clear_sn_infos(res_sn.pre_extended_highest.wrapping_add(1), res_sn.extended_val);
            inner.packets_lost += (gap_sn - 1) as u64;

            inner.set_sn_info(
                res_sn.extended_val,
                res_sn.pre_extended_highest,
                pkt_size as u16,
                hdr_size as u16,
                payload_size,
                header.marker,
                false,
            );

            if header.timestamp != res_ts.pre_extended_highest as u32 {
                // update only on the first packet of a timestamp, as the
                // same timestamp can span multiple packets
                inner.highest_time = Some(packet_time);
            }

            if gap_sn > 1 {
                flow_state.has_loss = true;
                flow_state.loss_start_inclusive = res_sn.pre_extended_highest.wrapping_add(1);
                flow_state.loss_end_exclusive = res_sn.extended_val;
            }
            flow_state.ext_sequence_number = res_sn.extended_val;
            flow_state.ext_timestamp = res_ts.extended_val;
        }

        if !flow_state.is_duplicate {
            if payload_size == 0 {
                inner.packets_padding += 1;
                inner.bytes_padding += pkt_size;
                inner.header_bytes_padding += hdr_size;
            } else {
                inner.bytes += pkt_size;
                inner.header_bytes += hdr_size;

                if header.marker {
                    inner.frames += 1;
                }

                inner.update_jitter(header, packet_time, self.params.clock_rate);
            }
        }

        flow_state
    }

    fn resync(&self, inner: &mut StatsInner, header: &Header, packet_time: Instant) {
        let before_ext_highest_sn = inner.sequence_number.extended_highest();
        let before_ext_highest_ts = inner.timestamp.extended_highest();

        let mut sn_cycles = 0u64;
        let mut ts_cycles = 0u64;
        if let Some(sr) = &inner.sr_newest {
            let newest_packet_count = sr.packet_count_ext;
            if newest_packet_count != 0 {
                let mut ext_expected_highest_sn =
                    inner.sequence_number.extended_start() + newest_packet_count;
                if inner.should_discount_padding_only_drops {
                    ext_expected_highest_sn =
                        ext_expected_highest_sn.wrapping_sub(sr.padding_only_drops);
                }
                let expected_highest_sn = (ext_expected_highest_sn & 0xFFFF) as u16;
                sn_cycles = ext_expected_highest_sn & 0xFFFF_FFFF_FFFF_0000;

                let sn = header.sequence_number;
                if sn.wrapping_sub(expected_highest_sn) < (1 << 15) && sn < expected_highest_sn {
                    sn_cycles += 1 << 16;
                }
                if sn_cycles != 0
                    && expected_highest_sn.wrapping_sub(sn) < (1 << 15)
                    && expected_highest_sn < sn
                {
                    sn_cycles -= 1 << 16;
                }
            }

            let ext_expected_highest_ts = sr.rtp_timestamp_ext;
            let expected_highest_ts = (ext_expected_highest_ts & 0xFFFF_FFFF) as u32;
            ts_cycles = ext_expected_highest_ts & 0xFFFF_FFFF_0000_0000;

            let ts = header.timestamp;
            if ts.wrapping_sub(expected_highest_ts) < (1 << 31) && ts < expected_highest_ts {
                ts_cycles += 1 << 32;
            }
            if ts_cycles != 0
                && expected_highest_ts.wrapping_sub(ts) < (1 << 31)
                && expected_highest_ts < ts
            {
                ts_cycles -= 1 << 32;
            }
        }

        inner.sequence_number.reset_highest(
            sn_cycles
                .wrapping_add(header.sequence_number as u64)
                .wrapping_sub(1),
        );
        inner
            .timestamp
            .reset_highest(ts_cycles.wrapping_add(header.timestamp as u64));
        inner.highest_time = Some(packet_time);

        debug!(
            "resync, sn: {}, before ext highest sn: {}, after ext highest sn: {}, ts: {}, before ext highest ts: {}, after ext highest ts: {}",
            header.sequence_number,
            before_ext_highest_sn,
            inner.sequence_number.extended_highest(),
            header.timestamp,
            before_ext_highest_ts,
            inner.timestamp.extended_highest(),
        );
    }

    /// Arms a one-shot re-anchoring of the extenders to the expected
    /// position implied by the newest sender report.
    pub fn resync_on_next_packet(&self, should_discount_padding_only_drops: bool) {
        let mut inner = self.inner.write();
        inner.resync_on_next_packet = true;
        inner.should_discount_padding_only_drops = should_discount_padding_only_drops;
    }

    pub fn total_packets_primary(&self) -> u64 {
        self.inner.read().total_packets_primary()
    }

    /// Folds a subscriber's reception report into the overridden counter
    /// set. Returns `(rtt, rtt_changed)`.
    pub fn update_from_receiver_report(&self, rr: &ReceptionReport) -> (u32, bool) {
        let mut inner = self.inner.write();

        if !inner.initialized
            || inner.end_time.is_some()
            || !self.params.is_receiver_report_driven
        {
            return (0, false);
        }

        let mut ext_highest_sn_overridden = (inner.ext_highest_sn_overridden
            & 0xFFFF_FFFF_0000_0000)
            + rr.last_sequence_number as u64;
        if inner.last_rr_time.is_some()
            && rr
                .last_sequence_number
                .wrapping_sub(inner.last_rr.last_sequence_number)
                < (1 << 31)
            && rr.last_sequence_number < inner.last_rr.last_sequence_number
        {
            ext_highest_sn_overridden += 1 << 32;
        }
        if ext_highest_sn_overridden < inner.sequence_number.extended_start() {
            // the last sequence number in the receiver report can be
            // before the start when dummy packets kick off the track
            inner.last_rr_time = Some(Instant::now());
            inner.last_rr = rr.clone();
            return (0, false);
        }

        let mut rtt = 0u32;
        let mut is_rtt_changed = false;
        if let Some(sr) = &inner.sr_newest {
            if let Ok(r) = rtt_from_reception_report(rr, sr.ntp_timestamp, sr.at) {
                rtt = r;
                is_rtt_changed = r != inner.rtt;
            }
        }

        if inner.last_rr_time.is_none()
            || inner.ext_highest_sn_overridden <= ext_highest_sn_overridden
        {
            inner.ext_highest_sn_overridden = ext_highest_sn_overridden;

            let mut packets_lost_overridden = (inner.packets_lost_overridden
                & 0xFFFF_FFFF_0000_0000)
                + rr.total_lost as u64;
            if rr.total_lost.wrapping_sub(inner.last_rr.total_lost) < (1 << 31)
                && rr.total_lost < inner.last_rr.total_lost
            {
                packets_lost_overridden += 1 << 32;
            }
            inner.packets_lost_overridden = packets_lost_overridden;

            if is_rtt_changed {
                inner.rtt = rtt;
                if rtt > inner.max_rtt {
                    inner.max_rtt = rtt;
                }
            }

            inner.jitter_overridden = rr.jitter as f64;
            if inner.jitter_overridden > inner.max_jitter_overridden {
                inner.max_jitter_overridden = inner.jitter_overridden;
            }

            // update snapshots
            let jitter_overridden = inner.jitter_overridden;
            for s in inner.snapshots.values_mut() {
                if is_rtt_changed && rtt > s.max_rtt {
                    s.max_rtt = rtt;
                }

                if jitter_overridden > s.max_jitter_overridden {
                    s.max_jitter_overridden = jitter_overridden;
                }
            }

            inner.last_rr_time = Some(Instant::now());
            inner.last_rr = rr.clone();
        } else {
            debug!(
                "receiver report potentially out of order, highest sn: existing: {}, received: {}",
                inner.ext_highest_sn_overridden, rr.last_sequence_number,
            );
        }

        (rtt, is_rtt_changed)
    }

    pub fn last_receiver_report_time(&self) -> Option<Instant> {
        self.inner.read().last_rr_time
    }

    pub fn update_nack(&self, nack_count: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.nacks += nack_count;
    }

    pub fn update_nack_processed(
        &self,
        nack_ack_count: u32,
        nack_miss_count: u32,
        nack_repeated_count: u32,
    ) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.nack_acks += nack_ack_count;
        inner.nack_misses += nack_miss_count;
        inner.nack_repeated += nack_repeated_count;
    }

    pub fn update_pli_and_time(&self, pli_count: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.plis += pli_count;
        inner.last_pli = Some(Instant::now());
    }

    pub fn update_pli(&self, pli_count: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.plis += pli_count;
    }

    pub fn update_pli_time(&self) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.last_pli = Some(Instant::now());
    }

    pub fn last_pli(&self) -> Option<Instant> {
        self.inner.read().last_pli
    }

    pub fn time_since_last_pli(&self) -> Option<Duration> {
        self.inner.read().last_pli.map(|t| t.elapsed())
    }

    pub fn update_layer_lock_pli_and_time(&self, pli_count: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.layer_lock_plis += pli_count;
        inner.last_layer_lock_pli = Some(Instant::now());
    }

    pub fn update_fir(&self, fir_count: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.firs += fir_count;
    }

    pub fn update_fir_time(&self) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.last_fir = Some(Instant::now());
    }

    pub fn update_key_frame(&self, kf_count: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.key_frames += kf_count;
        inner.last_key_frame = Some(Instant::now());
    }

    pub fn update_rtt(&self, rtt: u32) {
        let mut inner = self.inner.write();
        if inner.end_time.is_some() {
            return;
        }
        inner.rtt = rtt;
        if rtt > inner.max_rtt {
            inner.max_rtt = rtt;
        }

        for s in inner.snapshots.values_mut() {
            if rtt > s.max_rtt {
                s.max_rtt = rtt;
            }
        }
    }

    pub fn rtt(&self) -> u32 {
        self.inner.read().rtt
    }

    pub fn maybe_adjust_first_packet_time(&self, sr_data: Option<&RtcpSenderReportData>) {
        if let Some(sr_data) = sr_data {
            let mut inner = self.inner.write();
            inner.maybe_adjust_first_packet_time(self.params.clock_rate, sr_data.rtp_timestamp_ext);
        }
    }

    /// Ingests a publisher sender report, extending its timestamp and
    /// packet count against the newest one seen.
    pub fn set_rtcp_sender_report_data(&self, sr_data: &RtcpSenderReportData) {
        let mut inner = self.inner.write();
        if !inner.initialized {
            return;
        }

        // guard against anachronous sender reports
        if let Some(newest) = &inner.sr_newest {
            if newest.ntp_timestamp > sr_data.ntp_timestamp {
                info!(
                    "received anachronous sender report, current ntp: {}, current rtp: {}, last ntp: {}, last rtp: {}",
                    sr_data.ntp_timestamp.as_u64(),
                    sr_data.rtp_timestamp,
                    newest.ntp_timestamp.as_u64(),
                    newest.rtp_timestamp,
                );
                return;
            }
        }

        let mut ts_cycles = 0u64;
        let mut pc_cycles = 0u64;
        if let Some(newest) = &inner.sr_newest {
            ts_cycles = newest.rtp_timestamp_ext & 0xFFFF_FFFF_0000_0000;
            if sr_data.rtp_timestamp.wrapping_sub(newest.rtp_timestamp) < (1 << 31)
                && sr_data.rtp_timestamp < newest.rtp_timestamp
            {
                ts_cycles += 1 << 32;
            }

            pc_cycles = newest.packet_count_ext & 0xFFFF_FFFF_0000_0000;
            if sr_data.packet_count.wrapping_sub(newest.packet_count) < (1 << 31)
                && sr_data.packet_count < newest.packet_count
            {
                pc_cycles += 1 << 32;
            }
        }

        let mut sr_data = *sr_data;
        sr_data.rtp_timestamp_ext = sr_data.rtp_timestamp as u64 + ts_cycles;
        sr_data.packet_count_ext = sr_data.packet_count as u64 + pc_cycles;

        inner.maybe_adjust_first_packet_time(self.params.clock_rate, sr_data.rtp_timestamp_ext);

        if let Some(newest) = inner.sr_newest {
            if sr_data.rtp_timestamp_ext < newest.rtp_timestamp_ext {
                // happens when a track is muted by replacing it with a
                // null track and then restored. Reset the sender reports
                // to start from this point so rate calculations do not go
                // haywire from negative time.
                info!(
                    "received sender report, out-of-order, resetting, prev ts ext: {}, curr ts ext: {}",
                    newest.rtp_timestamp_ext, sr_data.rtp_timestamp_ext,
                );
                inner.sr_first = None;
            }
        }

        inner.sr_newest = Some(sr_data);
        if inner.sr_first.is_none() {
            inner.sr_first = Some(sr_data);
        }
    }

    pub fn rtcp_sender_report_data(
        &self,
    ) -> (Option<RtcpSenderReportData>, Option<RtcpSenderReportData>) {
        let inner = self.inner.read();
        (inner.sr_first, inner.sr_newest)
    }

    /// Extended RTP timestamp the stream is expected to have reached at
    /// `at`, derived from the first packet time and the nominal clock.
    pub fn expected_rtp_timestamp(&self, at: Instant) -> Result<u64> {
        let inner = self.inner.read();
        if !inner.initialized {
            return Err(Error::Uninitialized);
        }

        let first_time = inner.first_time.ok_or(Error::Uninitialized)?;
        let time_diff = at
            .checked_duration_since(first_time)
            .unwrap_or(Duration::ZERO);
        let expected_rtp_diff =
            time_diff.as_nanos() * self.params.clock_rate as u128 / 1_000_000_000;
        Ok(inner.timestamp.extended_start() + expected_rtp_diff as u64)
    }

    /// Builds the RFC 3550 sender report for the forwarded stream.
    pub fn rtcp_sender_report(&self, ssrc: u32, calculated_clock_rate: u32) -> Option<SenderReport> {
        let mut inner = self.inner.write();
        if !inner.initialized {
            return None;
        }

        let first_time = inner.first_time?;
        let highest_time = inner.highest_time?;

        let now = Instant::now();
        let now_ntp = NtpTime::now();
        let time_since_first = now.checked_duration_since(first_time).unwrap_or(Duration::ZERO);
        let time_since_highest = now
            .checked_duration_since(highest_time)
            .unwrap_or(Duration::ZERO);

        let mut now_rtp_ext = inner.timestamp.extended_highest()
            + (time_since_highest.as_nanos() * self.params.clock_rate as u128 / 1_000_000_000)
                as u64;

        // The publisher could be pacing at a slower rate, which makes the
        // highest timestamp lag the RTP timestamp in the publisher's own
        // sender reports. Check using the calculated clock rate and use
        // the later timestamp if applicable.
        if calculated_clock_rate != 0 {
            let now_rtp_ext_using_rate = inner.timestamp.extended_start()
                + (calculated_clock_rate as f64 * time_since_first.as_secs_f64()) as u64;
            if now_rtp_ext_using_rate > now_rtp_ext {
                now_rtp_ext = now_rtp_ext_using_rate;
            }
        }

        if let Some(newest) = &inner.sr_newest {
            if now_rtp_ext < newest.rtp_timestamp_ext {
                // The report being generated is behind the previous one,
                // possible after pause/mute/resume combinations. Produce
                // the next report from the previous one and elapsed NTP
                // time at the nominal clock rate.
                warn!(
                    "sending sender report, out-of-order, repairing, prev ts ext: {}, curr ts ext: {}",
                    newest.rtp_timestamp_ext, now_rtp_ext,
                );
                let ntp_diff = now_ntp.seconds_since(newest.ntp_timestamp);
                now_rtp_ext = newest.rtp_timestamp_ext
                    + (ntp_diff * self.params.clock_rate as f64) as u64;
            }
        }

        let now_rtp = now_rtp_ext as u32;

        let generated = RtcpSenderReportData {
            rtp_timestamp: now_rtp,
            rtp_timestamp_ext: now_rtp_ext,
            ntp_timestamp: now_ntp,
            packet_count: 0,
            packet_count_ext: 0,
            padding_only_drops: 0,
            at: now,
        };
        inner.sr_newest = Some(generated);
        if inner.sr_first.is_none() {
            inner.sr_first = Some(generated);
        }

        Some(SenderReport {
            ssrc,
            ntp_time: now_ntp.as_u64(),
            rtp_time: now_rtp,
            packet_count: (inner.total_packets_primary()
                + inner.packets_duplicate
                + inner.packets_padding) as u32,
            octet_count: (inner.bytes + inner.bytes_duplicate + inner.bytes_padding) as u32,
            ..Default::default()
        })
    }

    /// Builds the RFC 3550 reception report for the interval since this
    /// snapshot id was last read. The proxied fraction lost wins when it
    /// is larger.
    pub fn snapshot_rtcp_reception_report(
        &self,
        ssrc: u32,
        proxy_fraction_lost: u8,
        snapshot_id: u32,
    ) -> Option<ReceptionReport> {
        let mut inner = self.inner.write();
        let (then, now) = inner.get_and_reset_snapshot(&self.params, snapshot_id, false)?;

        let packets_expected = now.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if packets_expected > NUM_SEQUENCE_NUMBERS {
            warn!(
                "too many packets expected in receiver report, start: {}, end: {}, expected: {}",
                then.ext_start_sn, now.ext_start_sn, packets_expected,
            );
            return None;
        }
        if packets_expected == 0 {
            return None;
        }

        let interval_stats = inner.interval_stats(then.ext_start_sn, now.ext_start_sn);
        let loss_rate = interval_stats.packets_lost as f32 / packets_expected as f32;
        let mut fraction_lost = (loss_rate * 256.0) as u8;
        if proxy_fraction_lost > fraction_lost {
            fraction_lost = proxy_fraction_lost;
        }

        let mut dlsr = 0u32;
        let mut last_sr = 0u32;
        if let Some(newest) = &inner.sr_newest {
            let delay_ms = newest.at.elapsed().as_millis() as u32;
            dlsr = (delay_ms / 1000) << 16;
            dlsr |= (delay_ms % 1000) * 65536 / 1000;

            last_sr = newest.ntp_timestamp.middle_32();
        }

        Some(ReceptionReport {
            ssrc,
            fraction_lost,
            total_lost: inner.packets_lost as u32,
            last_sequence_number: now.ext_start_sn as u32,
            jitter: inner.jitter as u32,
            last_sender_report: last_sr,
            delay: dlsr,
        })
    }

    /// Reads and rotates the delta for a snapshot id.
    pub fn delta_info(&self, snapshot_id: u32) -> Option<RtpDeltaInfo> {
        let mut inner = self.inner.write();
        let (then, now) = inner.get_and_reset_snapshot(&self.params, snapshot_id, false)?;

        let start_time = then.start_time;
        let end_time = now.start_time;

        let packets_expected = now.ext_start_sn.wrapping_sub(then.ext_start_sn);
        if packets_expected > NUM_SEQUENCE_NUMBERS {
            error!(
                "too many packets expected in delta, start: {}, end: {}, expected: {}",
                then.ext_start_sn, now.ext_start_sn, packets_expected,
            );
            return None;
        }
        if packets_expected == 0 {
            return Some(RtpDeltaInfo {
                start_time,
                duration: end_time
                    .checked_duration_since(start_time)
                    .unwrap_or(Duration::ZERO),
                packets: 0,
                bytes: 0,
                header_bytes: 0,
                packets_duplicate: 0,
                bytes_duplicate: 0,
                header_bytes_duplicate: 0,
                packets_padding: 0,
                bytes_padding: 0,
                header_bytes_padding: 0,
                packets_lost: 0,
                packets_missing: 0,
                packets_out_of_order: 0,
                frames: 0,
                rtt_max: 0,
                jitter_max: 0.0,
                nacks: 0,
                plis: 0,
                firs: 0,
            });
        }

        let interval_stats = inner.interval_stats(then.ext_start_sn, now.ext_start_sn);
        Some(RtpDeltaInfo {
            start_time,
            duration: end_time
                .checked_duration_since(start_time)
                .unwrap_or(Duration::ZERO),
            packets: (packets_expected - interval_stats.packets_padding) as u32,
            bytes: interval_stats.bytes,
            header_bytes: interval_stats.header_bytes,
            packets_duplicate: (now.packets_duplicate - then.packets_duplicate) as u32,
            bytes_duplicate: now.bytes_duplicate - then.bytes_duplicate,
            header_bytes_duplicate: now.header_bytes_duplicate - then.header_bytes_duplicate,
            packets_padding: interval_stats.packets_padding as u32,
            bytes_padding: interval_stats.bytes_padding,
            header_bytes_padding: interval_stats.header_bytes_padding,
            packets_lost: interval_stats.packets_lost as u32,
            packets_missing: 0,
            packets_out_of_order: interval_stats.packets_out_of_order as u32,
            frames: interval_stats.frames,
            rtt_max: then.max_rtt,
            jitter_max: then.max_jitter / self.params.clock_rate as f64 * 1e6,
            nacks: now.nacks - then.nacks,
            plis: now.plis - then.plis,
            firs: now.firs - then.firs,
        })
    }

    /// Delta fed by receiver reports; only meaningful in
    /// receiver-report-driven mode.
    pub fn delta_info_overridden(&self, snapshot_id: u32) -> Option<RtpDeltaInfo> {
        if !self.params.is_receiver_report_driven {
            return None;
        }

        let mut inner = self.inner.write();
        let (then, now) = inner.get_and_reset_snapshot(&self.params, snapshot_id, true)?;

        let start_time = then.start_time;
        let end_time = now.start_time;

        let packets_expected = now
            .ext_start_sn_overridden
            .wrapping_sub(then.ext_start_sn_overridden);
        if packets_expected > NUM_SEQUENCE_NUMBERS {
            warn!(
                "too many packets expected in delta (overridden), start: {}, end: {}, expected: {}",
                then.ext_start_sn_overridden, now.ext_start_sn_overridden, packets_expected,
            );
            return None;
        }
        if packets_expected == 0 {
            // no receiver report seen, or the publisher is idle
            return None;
        }

        let interval_stats =
            inner.interval_stats(then.ext_start_sn_overridden, now.ext_start_sn_overridden);
        let mut packets_lost = now
            .packets_lost_overridden
            .wrapping_sub(then.packets_lost_overridden);
        if (packets_lost as i32) < 0 {
            packets_lost = 0;
        }

        if packets_lost > packets_expected {
            warn!(
                "unexpected number of packets lost, start: {}, end: {}, expected: {}, lost: report: {}, interval: {}",
                then.ext_start_sn_overridden,
                now.ext_start_sn_overridden,
                packets_expected,
                now.packets_lost_overridden.wrapping_sub(then.packets_lost_overridden),
                interval_stats.packets_lost,
            );
            packets_lost = packets_expected;
        }

        // discount jitter from the publisher side and internal processing
        let mut max_jitter = then.max_jitter_overridden - then.max_jitter;
        if max_jitter < 0.0 {
            max_jitter = 0.0;
        }
        let max_jitter_time = max_jitter / self.params.clock_rate as f64 * 1e6;

        Some(RtpDeltaInfo {
            start_time,
            duration: end_time
                .checked_duration_since(start_time)
                .unwrap_or(Duration::ZERO),
            packets: (packets_expected - interval_stats.packets_padding) as u32,
            bytes: interval_stats.bytes,
            header_bytes: interval_stats.header_bytes,
            packets_duplicate: (now.packets_duplicate - then.packets_duplicate) as u32,
            bytes_duplicate: now.bytes_duplicate - then.bytes_duplicate,
            header_bytes_duplicate: now.header_bytes_duplicate - then.header_bytes_duplicate,
            packets_padding: interval_stats.packets_padding as u32,
            bytes_padding: interval_stats.bytes_padding,
            header_bytes_padding: interval_stats.header_bytes_padding,
            packets_lost: packets_lost as u32,
            packets_missing: interval_stats.packets_lost as u32,
            packets_out_of_order: interval_stats.packets_out_of_order as u32,
            frames: interval_stats.frames,
            rtt_max: then.max_rtt,
            jitter_max: max_jitter_time,
            nacks: now.nacks - then.nacks,
            plis: now.plis - then.plis,
            firs: now.firs - then.firs,
        })
    }

    /// Lifetime summary of the stream, `None` before the first packet.
    pub fn summary(&self) -> Option<RtpStatsSummary> {
        let inner = self.inner.read();
        let start_time = inner.start_time?;
        let start_time_system = inner.start_time_system?;

        let end_time = inner.end_time.unwrap_or_else(Instant::now);
        let end_time_system = inner.end_time_system.unwrap_or_else(SystemTime::now);
        let elapsed = end_time
            .checked_duration_since(start_time)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        if elapsed == 0.0 {
            return None;
        }

        let packets = inner.total_packets_primary();
        let packets_expected = inner.packets_expected();
        let packets_lost = inner.packets_lost_reported(&self.params);

        let (jitter, max_jitter) = if self.params.is_receiver_report_driven {
            // includes jitter from the publisher and from processing
            (inner.jitter_overridden, inner.max_jitter_overridden)
        } else {
            (inner.jitter, inner.max_jitter)
        };

        let (packet_drift, report_drift) = inner.drift(self.params.clock_rate);

        Some(RtpStatsSummary {
            start_time: start_time_system,
            end_time: end_time_system,
            duration: elapsed,
            packets: packets as u32,
            packet_rate: packets as f64 / elapsed,
            bytes: inner.bytes,
            header_bytes: inner.header_bytes,
            bitrate: inner.bytes as f64 * 8.0 / elapsed,
            packets_expected,
            packets_lost: packets_lost as u32,
            packet_loss_rate: packets_lost as f64 / elapsed,
            packet_loss_percentage: packets_lost as f32 / packets_expected as f32 * 100.0,
            packets_duplicate: inner.packets_duplicate as u32,
            packet_duplicate_rate: inner.packets_duplicate as f64 / elapsed,
            bytes_duplicate: inner.bytes_duplicate,
            header_bytes_duplicate: inner.header_bytes_duplicate,
            bitrate_duplicate: inner.bytes_duplicate as f64 * 8.0 / elapsed,
            packets_padding: inner.packets_padding as u32,
            packet_padding_rate: inner.packets_padding as f64 / elapsed,
            bytes_padding: inner.bytes_padding,
            header_bytes_padding: inner.header_bytes_padding,
            bitrate_padding: inner.bytes_padding as f64 * 8.0 / elapsed,
            packets_out_of_order: inner.packets_out_of_order as u32,
            frames: inner.frames,
            frame_rate: inner.frames as f64 / elapsed,
            key_frames: inner.key_frames,
            jitter_current: jitter / self.params.clock_rate as f64 * 1e6,
            jitter_max: max_jitter / self.params.clock_rate as f64 * 1e6,
            gap_histogram: inner.gap_histogram,
            nacks: inner.nacks,
            nack_acks: inner.nack_acks,
            nack_misses: inner.nack_misses,
            nack_repeated: inner.nack_repeated,
            plis: inner.plis,
            layer_lock_plis: inner.layer_lock_plis,
            firs: inner.firs,
            rtt_current: inner.rtt,
            rtt_max: inner.max_rtt,
            packet_drift,
            report_drift,
        })
    }
}

/// Lifetime counters and rates of one stream.
#[derive(Debug, Clone, Copy)]
pub struct RtpStatsSummary {
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub duration: f64,
    pub packets: u32,
    pub packet_rate: f64,
    pub bytes: u64,
    pub header_bytes: u64,
    pub bitrate: f64,
    pub packets_expected: u64,
    pub packets_lost: u32,
    pub packet_loss_rate: f64,
    pub packet_loss_percentage: f32,
    pub packets_duplicate: u32,
    pub packet_duplicate_rate: f64,
    pub bytes_duplicate: u64,
    pub header_bytes_duplicate: u64,
    pub bitrate_duplicate: f64,
    pub packets_padding: u32,
    pub packet_padding_rate: f64,
    pub bytes_padding: u64,
    pub header_bytes_padding: u64,
    pub bitrate_padding: f64,
    pub packets_out_of_order: u32,
    pub frames: u32,
    pub frame_rate: f64,
    pub key_frames: u32,
    pub jitter_current: f64,
    pub jitter_max: f64,
    pub gap_histogram: [u32; GAP_HISTOGRAM_NUM_BINS],
    pub nacks: u32,
    pub nack_acks: u32,
    pub nack_misses: u32,
    pub nack_repeated: u32,
    pub plis: u32,
    pub layer_lock_plis: u32,
    pub firs: u32,
    pub rtt_current: u32,
    pub rtt_max: u32,
    pub packet_drift: Option<RtpDrift>,
    pub report_drift: Option<RtpDrift>,
}

impl fmt::Display for RtpStatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t: {:.2}s", self.duration)?;
        write!(
            f,
            ", ep: {}|{:.2}/s",
            self.packets_expected,
            self.packets_expected as f64 / self.duration,
        )?;
        write!(f, ", p: {}|{:.2}/s", self.packets, self.packet_rate)?;
        write!(
            f,
            ", l: {}|{:.1}/s|{:.2}%",
            self.packets_lost, self.packet_loss_rate, self.packet_loss_percentage,
        )?;
        write!(
            f,
            ", b: {}|{:.1}bps|{}",
            self.bytes, self.bitrate, self.header_bytes,
        )?;
        write!(
            f,
            ", f: {}|{:.1}/s / {}",
            self.frames, self.frame_rate, self.key_frames,
        )?;
        write!(
            f,
            ", d: {}|{:.2}/s",
            self.packets_duplicate, self.packet_duplicate_rate,
        )?;
        write!(
            f,
            ", bd: {}|{:.1}bps|{}",
            self.bytes_duplicate, self.bitrate_duplicate, self.header_bytes_duplicate,
        )?;
        write!(
            f,
            ", pp: {}|{:.2}/s",
            self.packets_padding, self.packet_padding_rate,
        )?;
        write!(
            f,
            ", bp: {}|{:.1}bps|{}",
            self.bytes_padding, self.bitrate_padding, self.header_bytes_padding,
        )?;
        write!(f, ", o: {}", self.packets_out_of_order)?;
        write!(
            f,
            ", j: {:.1}us|{:.1}us",
            self.jitter_current, self.jitter_max,
        )?;

        let mut first = true;
        for (i, count) in self.gap_histogram.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            if first {
                write!(f, ", gh:[")?;
            } else {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", i + 1, count)?;
            first = false;
        }
        if !first {
            write!(f, "]")?;
        }

        write!(
            f,
            ", n: {}|{}|{}|{}",
            self.nacks, self.nack_acks, self.nack_misses, self.nack_repeated,
        )?;
        write!(f, ", pli: {} / {}", self.plis, self.layer_lock_plis)?;
        write!(f, ", fir: {}", self.firs)?;
        write!(f, ", rtt(ms): {}|{}", self.rtt_current, self.rtt_max)?;

        match &self.packet_drift {
            Some(drift) => write!(f, ", pd: {drift}")?,
            None => write!(f, ", pd: -")?,
        }
        match &self.report_drift {
            Some(drift) => write!(f, ", rd: {drift}")?,
            None => write!(f, ", rd: -")?,
        }
        Ok(())
    }
}

/// Sums per-layer summaries into one track-level view.
pub fn aggregate_rtp_stats(stats_list: &[RtpStatsSummary]) -> Option<RtpStatsSummary> {
    if stats_list.is_empty() {
        return None;
    }

    let mut start_time: Option<SystemTime> = None;
    let mut end_time: Option<SystemTime> = None;

    let mut merged = stats_list[0];
    merged.gap_histogram = [0; GAP_HISTOGRAM_NUM_BINS];
    let mut jitter_sum = 0.0;
    let mut rtt_sum = 0u64;

    let zeroed = RtpStatsSummary {
        packets: 0,
        bytes: 0,
        header_bytes: 0,
        packets_expected: 0,
        packets_lost: 0,
        packets_duplicate: 0,
        bytes_duplicate: 0,
        header_bytes_duplicate: 0,
        packets_padding: 0,
        bytes_padding: 0,
        header_bytes_padding: 0,
        packets_out_of_order: 0,
        frames: 0,
        key_frames: 0,
        jitter_max: 0.0,
        nacks: 0,
        nack_acks: 0,
        nack_misses: 0,
        nack_repeated: 0,
        plis: 0,
        layer_lock_plis: 0,
        firs: 0,
        rtt_max: 0,
        packet_drift: None,
        report_drift: None,
        ..merged
    };
    merged = zeroed;

    for stats in stats_list {
        if start_time.map_or(true, |t| t > stats.start_time) {
            start_time = Some(stats.start_time);
        }
        if end_time.map_or(true, |t| t < stats.end_time) {
            end_time = Some(stats.end_time);
        }

        merged.packets += stats.packets;
        merged.bytes += stats.bytes;
        merged.header_bytes += stats.header_bytes;
        merged.packets_expected += stats.packets_expected;
        merged.packets_lost += stats.packets_lost;
        merged.packets_duplicate += stats.packets_duplicate;
        merged.bytes_duplicate += stats.bytes_duplicate;
        merged.header_bytes_duplicate += stats.header_bytes_duplicate;
        merged.packets_padding += stats.packets_padding;
        merged.bytes_padding += stats.bytes_padding;
        merged.header_bytes_padding += stats.header_bytes_padding;
        merged.packets_out_of_order += stats.packets_out_of_order;
        merged.frames += stats.frames;
        merged.key_frames += stats.key_frames;

        jitter_sum += stats.jitter_current;
        if stats.jitter_max > merged.jitter_max {
            merged.jitter_max = stats.jitter_max;
        }

        for (merged_bin, bin) in merged
            .gap_histogram
            .iter_mut()
            .zip(stats.gap_histogram.iter())
        {
            *merged_bin += bin;
        }

        merged.nacks += stats.nacks;
        merged.nack_acks += stats.nack_acks;
        merged.nack_misses += stats.nack_misses;
        merged.nack_repeated += stats.nack_repeated;
        merged.plis += stats.plis;
        merged.layer_lock_plis += stats.layer_lock_plis;
        merged.firs += stats.firs;

        rtt_sum += stats.rtt_current as u64;
        if stats.rtt_max > merged.rtt_max {
            merged.rtt_max = stats.rtt_max;
        }
    }

    let start_time = start_time?;
    let end_time = end_time?;
    let elapsed = end_time
        .duration_since(start_time)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64();

    merged.start_time = start_time;
    merged.end_time = end_time;
    merged.duration = elapsed;
    if elapsed > 0.0 {
        merged.packet_rate = merged.packets as f64 / elapsed;
        merged.packet_loss_rate = merged.packets_lost as f64 / elapsed;
        merged.packet_duplicate_rate = merged.packets_duplicate as f64 / elapsed;
        merged.packet_padding_rate = merged.packets_padding as f64 / elapsed;
        merged.bitrate = merged.bytes as f64 * 8.0 / elapsed;
        merged.bitrate_duplicate = merged.bytes_duplicate as f64 * 8.0 / elapsed;
        merged.bitrate_padding = merged.bytes_padding as f64 * 8.0 / elapsed;
        merged.frame_rate = merged.frames as f64 / elapsed;
    }
    merged.packet_loss_percentage =
        merged.packets_lost as f32 / (merged.packets + merged.packets_lost) as f32 * 100.0;
    merged.jitter_current = jitter_sum / stats_list.len() as f64;
    merged.rtt_current = (rtt_sum / stats_list.len() as u64) as u32;
    // no aggregation for drift calculations

    Some(merged)
}

/// Sums deltas from multiple layers into one interval view.
pub fn aggregate_rtp_delta_info(delta_info_list: &[RtpDeltaInfo]) -> Option<RtpDeltaInfo> {
    let first = delta_info_list.first()?;

    let mut start_time = first.start_time;
    let mut end_time = first.start_time + first.duration;

    let mut merged = RtpDeltaInfo {
        start_time,
        duration: Duration::ZERO,
        packets: 0,
        bytes: 0,
        header_bytes: 0,
        packets_duplicate: 0,
        bytes_duplicate: 0,
        header_bytes_duplicate: 0,
        packets_padding: 0,
        bytes_padding: 0,
        header_bytes_padding: 0,
        packets_lost: 0,
        packets_missing: 0,
        packets_out_of_order: 0,
        frames: 0,
        rtt_max: 0,
        jitter_max: 0.0,
        nacks: 0,
        plis: 0,
        firs: 0,
    };

    for delta_info in delta_info_list {
        if delta_info.start_time < start_time {
            start_time = delta_info.start_time;
        }
        let ended_at = delta_info.start_time + delta_info.duration;
        if ended_at > end_time {
            end_time = ended_at;
        }

        merged.packets += delta_info.packets;
        merged.bytes += delta_info.bytes;
        merged.header_bytes += delta_info.header_bytes;
        merged.packets_duplicate += delta_info.packets_duplicate;
        merged.bytes_duplicate += delta_info.bytes_duplicate;
        merged.header_bytes_duplicate += delta_info.header_bytes_duplicate;
        merged.packets_padding += delta_info.packets_padding;
        merged.bytes_padding += delta_info.bytes_padding;
        merged.header_bytes_padding += delta_info.header_bytes_padding;
        merged.packets_lost += delta_info.packets_lost;
        merged.packets_missing += delta_info.packets_missing;
        merged.packets_out_of_order += delta_info.packets_out_of_order;
        merged.frames += delta_info.frames;

        if delta_info.rtt_max > merged.rtt_max {
            merged.rtt_max = delta_info.rtt_max;
        }
        if delta_info.jitter_max > merged.jitter_max {
            merged.jitter_max = delta_info.jitter_max;
        }

        merged.nacks += delta_info.nacks;
        merged.plis += delta_info.plis;
        merged.firs += delta_info.firs;
    }

    merged.start_time = start_time;
    merged.duration = end_time
        .checked_duration_since(start_time)
        .unwrap_or(Duration::ZERO);
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const CLOCK_RATE: u32 = 90000;
    const HDR_SIZE: usize = 12;

    fn new_stats() -> RtpStats {
        RtpStats::new(RtpStatsParams {
            clock_rate: CLOCK_RATE,
            is_receiver_report_driven: false,
        })
    }

    fn header(sn: u16, ts: u32) -> Header {
        Header {
            sequence_number: sn,
            timestamp: ts,
            ..Default::default()
        }
    }

    fn feed(r: &RtpStats, sn: u16, ts: u32, payload_size: usize) -> RtpFlowState {
        r.update(&header(sn, ts), HDR_SIZE, payload_size, 0, Instant::now())
    }

    #[test]
    fn test_update_flow() {
        let _ = env_logger::builder().is_test(true).try_init();
        let r = new_stats();

        // keep clear of the wrap so the out-of-order steps below stay on
        // the non-wrapping paths
        let start_sn: u16 = 2000 + rand::random::<u16>() % 60000;
        let start_ts: u32 = 100_000 + rand::random::<u32>() % 1_000_000_000;
        let mut sn = start_sn;
        let mut ts = start_ts;

        let flow = feed(&r, sn, ts, 1000);
        assert!(!flow.has_loss);
        {
            let inner = r.inner.read();
            assert!(inner.initialized);
            assert_eq!(inner.sequence_number.highest(), sn);
            assert_eq!(inner.timestamp.highest(), ts);
        }

        // in-order, no loss
        sn = sn.wrapping_add(1);
        ts = ts.wrapping_add(3000);
        let flow = feed(&r, sn, ts, 1000);
        assert!(!flow.has_loss);

        // out-of-order before the start re-anchors the stream
        let flow = feed(&r, sn.wrapping_sub(10), ts.wrapping_sub(30000), 1000);
        assert!(!flow.has_loss);
        assert!(flow.is_out_of_order);
        {
            let inner = r.inner.read();
            assert_eq!(inner.sequence_number.highest(), sn);
            assert_eq!(inner.packets_out_of_order, 1);
            assert_eq!(inner.packets_duplicate, 0);
            assert_eq!(inner.packets_lost, 8);
        }

        // the same packet again is a duplicate
        let flow = feed(&r, sn.wrapping_sub(10), ts.wrapping_sub(30000), 1000);
        assert!(!flow.has_loss);
        assert!(flow.is_duplicate);
        {
            let inner = r.inner.read();
            assert_eq!(inner.packets_out_of_order, 2);
            assert_eq!(inner.packets_duplicate, 1);
        }

        // loss
        sn = sn.wrapping_add(10);
        ts = ts.wrapping_add(30000);
        let flow = feed(&r, sn, ts, 1000);
        assert!(flow.has_loss);
        assert_eq!(
            flow.loss_start_inclusive,
            flow.ext_sequence_number.wrapping_sub(9),
        );
        assert_eq!(flow.loss_end_exclusive, flow.ext_sequence_number);
        assert_eq!(r.inner.read().packets_lost, 17);

        // out-of-order recovery decrements the loss count
        let flow = feed(&r, sn.wrapping_sub(15), ts.wrapping_sub(45000), 1000);
        assert!(!flow.has_loss);
        {
            let inner = r.inner.read();
            assert_eq!(inner.sequence_number.highest(), sn);
            assert_eq!(inner.packets_out_of_order, 3);
            assert_eq!(inner.packets_duplicate, 1);
            assert_eq!(inner.packets_lost, 16);

            let interval_stats = inner.interval_stats(
                inner.sequence_number.extended_start(),
                inner.sequence_number.extended_highest() + 1,
            );
            assert_eq!(interval_stats.packets_lost, 16);
        }

        r.stop();
        assert!(!r.is_active());
    }

    #[test]
    fn test_loss_then_out_of_order_recovery() {
        let r = new_stats();

        for sn in [100u16, 101, 102] {
            let flow = feed(&r, sn, 1000 + sn as u32 * 3000, 1000);
            assert!(!flow.has_loss);
        }

        let flow = feed(&r, 113, 1000 + 113 * 3000, 1000);
        assert!(flow.has_loss);
        assert_eq!(flow.loss_start_inclusive, 103);
        assert_eq!(flow.loss_end_exclusive, 113);
        assert_eq!(r.inner.read().packets_lost, 10);

        let flow = feed(&r, 108, 1000 + 108 * 3000, 1000);
        assert!(!flow.has_loss);
        assert!(flow.is_out_of_order);
        {
            let inner = r.inner.read();
            assert_eq!(inner.packets_lost, 9);
            assert_eq!(inner.packets_out_of_order, 1);
        }
    }

    #[test]
    fn test_duplicate_detection() {
        let r = new_stats();

        feed(&r, 200, 1000, 1000);
        feed(&r, 201, 4000, 1000);
        let flow = feed(&r, 201, 4000, 1000);
        assert!(flow.is_duplicate);
        {
            let inner = r.inner.read();
            assert_eq!(inner.packets_duplicate, 1);
            assert_eq!(inner.sequence_number.highest(), 201);
        }

        // duplicates are counted once more each time
        let flow = feed(&r, 201, 4000, 1000);
        assert!(flow.is_duplicate);
        assert_eq!(r.inner.read().packets_duplicate, 2);
    }

    #[test]
    fn test_bookkeeping_identity() {
        let r = new_stats();

        feed(&r, 1000, 10, 1000);
        for sn in [1001u16, 1003, 1004, 1010, 1008, 1011] {
            feed(&r, sn, 10 + sn as u32, 1000);
        }
        // one padding only packet
        r.update(&header(1012, 2000), HDR_SIZE, 0, 255, Instant::now());

        let inner = r.inner.read();
        let expected = inner.packets_expected();
        assert_eq!(expected, 13);
        assert!(inner.packets_lost <= expected);
        assert_eq!(
            inner.total_packets_primary() + inner.packets_lost + inner.packets_padding,
            expected,
        );
    }

    #[test]
    fn test_interval_stats_round_trip() {
        let r = new_stats();

        // 100..=104 received, 105..=109 lost, 110..=114 received,
        // 115 padding only
        for sn in 100u16..=104 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }
        for sn in 110u16..=114 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }
        r.update(&header(115, 11500), HDR_SIZE, 0, 255, Instant::now());

        let inner = r.inner.read();
        let interval_stats = inner.interval_stats(
            inner.sequence_number.extended_start(),
            inner.sequence_number.extended_highest() + 1,
        );
        assert_eq!(interval_stats.packets, 10);
        assert_eq!(interval_stats.packets_lost, 5);
        assert_eq!(interval_stats.packets_padding, 1);
        assert_eq!(interval_stats.packets_out_of_order, 0);
        assert_eq!(interval_stats.bytes, 10 * (HDR_SIZE as u64 + 1000));
    }

    #[test]
    fn test_jitter_converges_to_zero_on_even_pacing() {
        let r = new_stats();
        let base = Instant::now();

        let frame_interval = Duration::from_millis(20);
        let ticks_per_frame = 1800u32; // 20ms at 90kHz
        let ts_base = 100u32;

        r.update(&header(1, ts_base), HDR_SIZE, 1000, 0, base);
        // one packet arrives late to kick jitter up
        r.update(
            &header(2, ts_base + ticks_per_frame),
            HDR_SIZE,
            1000,
            0,
            base + frame_interval + Duration::from_millis(30),
        );
        let jitter_after_bump = r.inner.read().jitter;
        assert!(jitter_after_bump > 0.0);

        // equal inter-arrival and RTP gaps decay it towards zero
        for i in 3u32..300 {
            r.update(
                &header(i as u16, ts_base + (i - 1) * ticks_per_frame),
                HDR_SIZE,
                1000,
                0,
                base + frame_interval * (i - 1),
            );
        }

        let inner = r.inner.read();
        assert!(inner.jitter < 1.0);
        assert!(inner.max_jitter >= jitter_after_bump);
    }

    #[test]
    fn test_padding_only_does_not_initialize() {
        let r = new_stats();

        let flow = r.update(&header(10, 1000), HDR_SIZE, 0, 255, Instant::now());
        assert!(flow.is_not_handled);
        assert!(!r.inner.read().initialized);
    }

    #[test]
    fn test_padding_only_restart_rolled_back() {
        let r = new_stats();

        feed(&r, 10, 1000, 1000);
        // padding only packet "before" the start must not re-anchor
        let flow = r.update(&header(9, 900), HDR_SIZE, 0, 255, Instant::now());
        assert!(!flow.is_out_of_order);
        assert!(!flow.is_duplicate);
        {
            let inner = r.inner.read();
            assert_eq!(inner.sequence_number.extended_start(), 10);
            assert_eq!(inner.timestamp.extended_start(), 1000);
            assert_eq!(inner.packets_padding, 0);
        }

        // a media packet at the same place does re-anchor
        let flow = feed(&r, 9, 900, 1000);
        assert!(flow.is_out_of_order);
        assert_eq!(r.inner.read().sequence_number.extended_start(), 9);
    }

    #[test]
    fn test_update_after_stop_is_not_handled() {
        let r = new_stats();
        feed(&r, 1, 0, 1000);
        r.stop();

        let flow = feed(&r, 2, 3000, 1000);
        assert!(flow.is_not_handled);
    }

    #[test]
    fn test_sender_report_ingestion_and_extension() {
        let r = new_stats();
        feed(&r, 1, 0, 1000);

        let now = Instant::now();
        let ntp1 = NtpTime(100u64 << 32);
        r.set_rtcp_sender_report_data(&RtcpSenderReportData {
            rtp_timestamp: 4_000_000_000,
            rtp_timestamp_ext: 4_000_000_000,
            ntp_timestamp: ntp1,
            packet_count: 10,
            packet_count_ext: 10,
            padding_only_drops: 0,
            at: now,
        });

        // anachronous report is dropped
        r.set_rtcp_sender_report_data(&RtcpSenderReportData {
            rtp_timestamp: 4_000_500_000,
            rtp_timestamp_ext: 4_000_500_000,
            ntp_timestamp: NtpTime(99u64 << 32),
            packet_count: 11,
            packet_count_ext: 11,
            padding_only_drops: 0,
            at: now,
        });
        let (_, newest) = r.rtcp_sender_report_data();
        assert_eq!(newest.map(|sr| sr.ntp_timestamp), Some(ntp1));

        // a report past the 32-bit wrap picks up a cycle
        r.set_rtcp_sender_report_data(&RtcpSenderReportData {
            rtp_timestamp: 1_000_000,
            rtp_timestamp_ext: 1_000_000,
            ntp_timestamp: NtpTime(130u64 << 32),
            packet_count: 12,
            packet_count_ext: 12,
            padding_only_drops: 0,
            at: now,
        });
        let (first, newest) = r.rtcp_sender_report_data();
        let newest = newest.unwrap();
        assert_eq!(newest.rtp_timestamp_ext, (1u64 << 32) + 1_000_000);
        assert_eq!(first.map(|sr| sr.rtp_timestamp), Some(4_000_000_000));
    }

    #[test]
    fn test_sender_report_regression_resets_first() {
        let r = new_stats();
        feed(&r, 1, 0, 1000);

        let now = Instant::now();
        r.set_rtcp_sender_report_data(&RtcpSenderReportData {
            rtp_timestamp: 100_000,
            rtp_timestamp_ext: 100_000,
            ntp_timestamp: NtpTime(100u64 << 32),
            packet_count: 10,
            packet_count_ext: 10,
            padding_only_drops: 0,
            at: now,
        });

        // later NTP but a much older RTP timestamp: track was replaced
        r.set_rtcp_sender_report_data(&RtcpSenderReportData {
            rtp_timestamp: 50_000,
            rtp_timestamp_ext: 50_000,
            ntp_timestamp: NtpTime(101u64 << 32),
            packet_count: 11,
            packet_count_ext: 11,
            padding_only_drops: 0,
            at: now,
        });

        let (first, newest) = r.rtcp_sender_report_data();
        assert_eq!(first.map(|sr| sr.rtp_timestamp), Some(50_000));
        assert_eq!(newest.map(|sr| sr.rtp_timestamp), Some(50_000));
    }

    #[test]
    fn test_resync_on_next_packet() {
        let r = new_stats();
        feed(&r, 100, 1000, 1000);
        feed(&r, 101, 1000, 1000);

        r.set_rtcp_sender_report_data(&RtcpSenderReportData {
            rtp_timestamp: 50_000,
            rtp_timestamp_ext: 50_000,
            ntp_timestamp: NtpTime::now(),
            packet_count: 50,
            packet_count_ext: 50,
            padding_only_drops: 0,
            at: Instant::now(),
        });
        r.resync_on_next_packet(false);

        // a big jump right after resync does not count as loss
        let flow = feed(&r, 300, 52_000, 1000);
        assert!(!flow.has_loss);
        assert_eq!(flow.ext_sequence_number, 300);
        {
            let inner = r.inner.read();
            assert_eq!(inner.sequence_number.extended_highest(), 300);
            assert_eq!(inner.timestamp.extended_highest(), 52_000);
            assert_eq!(inner.packets_lost, 0);
        }
    }

    #[test]
    fn test_snapshot_delta_rotation() {
        let r = new_stats();
        let id = r.new_snapshot_id();
        assert_eq!(id, FIRST_SNAPSHOT_ID);

        for sn in 1u16..=10 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }

        let delta = r.delta_info(id).unwrap();
        assert_eq!(delta.packets, 10);
        assert_eq!(delta.packets_lost, 0);
        assert_eq!(delta.bytes, 10 * (HDR_SIZE as u64 + 1000));

        // the read rotated the baseline
        let delta = r.delta_info(id).unwrap();
        assert_eq!(delta.packets, 0);
        assert_eq!(delta.bytes, 0);

        for sn in 11u16..=15 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }
        let delta = r.delta_info(id).unwrap();
        assert_eq!(delta.packets, 5);
    }

    #[test]
    fn test_reception_report_fraction_lost() {
        let r = new_stats();
        let id = r.new_snapshot_id();

        for sn in 1u16..=5 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }
        for sn in 11u16..=15 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }

        let rr = r.snapshot_rtcp_reception_report(0x1234, 0, id).unwrap();
        assert_eq!(rr.ssrc, 0x1234);
        assert_eq!(rr.total_lost, 5);
        // 5 lost out of 15 expected
        assert_eq!(rr.fraction_lost, (5.0f32 / 15.0 * 256.0) as u8);
        assert_eq!(rr.last_sequence_number, 16);
        assert_eq!(rr.delay, 0);
        assert_eq!(rr.last_sender_report, 0);

        // proxied fraction wins when larger
        for sn in 16u16..=20 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }
        let rr = r.snapshot_rtcp_reception_report(0x1234, 200, id).unwrap();
        assert_eq!(rr.fraction_lost, 200);
    }

    #[test]
    fn test_sender_report_generation() {
        let r = new_stats();
        for sn in 1u16..=20 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }

        let sr = r.rtcp_sender_report(0xCAFE, 0).unwrap();
        assert_eq!(sr.ssrc, 0xCAFE);
        assert_eq!(sr.packet_count, 20);
        assert_eq!(sr.octet_count, 20 * (HDR_SIZE as u32 + 1000));
        assert!(sr.ntp_time != 0);

        // generated reports never run backwards
        let sr2 = r.rtcp_sender_report(0xCAFE, 0).unwrap();
        let (_, newest) = r.rtcp_sender_report_data();
        assert_eq!(newest.map(|d| d.rtp_timestamp), Some(sr2.rtp_time));
        assert!(sr2.rtp_time.wrapping_sub(sr.rtp_time) < (1 << 31));
    }

    #[test]
    fn test_receiver_report_driven_override() {
        let r = RtpStats::new(RtpStatsParams {
            clock_rate: CLOCK_RATE,
            is_receiver_report_driven: true,
        });
        let id = r.new_snapshot_id();

        for sn in 100u16..=120 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }

        let rr = ReceptionReport {
            ssrc: 1,
            last_sequence_number: 120,
            total_lost: 2,
            jitter: 700,
            ..Default::default()
        };
        let (rtt, rtt_changed) = r.update_from_receiver_report(&rr);
        assert_eq!(rtt, 0);
        assert!(!rtt_changed);
        {
            let inner = r.inner.read();
            assert_eq!(inner.ext_highest_sn_overridden, 120);
            assert_eq!(inner.packets_lost_overridden, 2);
            assert_eq!(inner.jitter_overridden, 700.0);
        }

        let delta = r.delta_info_overridden(id).unwrap();
        assert_eq!(delta.packets_lost, 2);

        // a report whose highest SN predates the start is remembered but
        // does not override
        let rr = ReceptionReport {
            ssrc: 1,
            last_sequence_number: 10,
            total_lost: 50,
            ..Default::default()
        };
        r.update_from_receiver_report(&rr);
        assert_eq!(r.inner.read().packets_lost_overridden, 2);
    }

    #[test]
    fn test_summary_counts() {
        let r = new_stats();
        for sn in 1u16..=9 {
            feed(&r, sn, sn as u32 * 3000, 1000);
        }
        feed(&r, 11, 11 * 3000, 1000);
        std::thread::sleep(Duration::from_millis(10));
        r.stop();

        let summary = r.summary().unwrap();
        assert_eq!(summary.packets, 10);
        assert_eq!(summary.packets_lost, 1);
        assert_eq!(summary.packets_expected, 11);
        assert_eq!(summary.gap_histogram[0], 1);
        assert!(summary.duration > 0.0);
        assert!(summary.bitrate > 0.0);

        // display surface holds together
        let text = format!("{summary}");
        assert!(text.contains("ep: 11"));
        assert!(text.contains("gh:[1:1]"));
    }

    #[test]
    fn test_seed_clones_counters() {
        let r = new_stats();
        for sn in 1u16..=10 {
            feed(&r, sn, sn as u32 * 100, 1000);
        }

        let seeded = new_stats();
        seeded.seed(&r);
        {
            let inner = seeded.inner.read();
            assert!(inner.initialized);
            assert_eq!(inner.sequence_number.extended_highest(), 10);
            assert_eq!(inner.bytes, 10 * (HDR_SIZE as u64 + 1000));
        }

        // continues numbering where the source left off
        let flow = feed(&seeded, 11, 1100, 1000);
        assert!(!flow.has_loss);
        assert_eq!(flow.ext_sequence_number, 11);
    }

    #[test]
    fn test_delta_refuses_oversized_interval() {
        let r = new_stats();
        let id = r.new_snapshot_id();

        feed(&r, 0, 0, 1000);
        // jump in chunks that stay in-order for the extender but push the
        // interval far past one full sequence number range
        let mut sn = 0u16;
        for _ in 0..4 {
            sn = sn.wrapping_add(30000);
            feed(&r, sn, sn as u32, 1000);
        }

        assert!(r.delta_info(id).is_none());
    }
}
