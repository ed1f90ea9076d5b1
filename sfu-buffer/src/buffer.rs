//! Per-layer front end of the reception core.
//!
//! The network read loop pushes every parsed packet of one SSRC in here.
//! The buffer updates the stats engine, keeps the raw packet window for
//! retransmissions, chases losses with upstream NACKs, throttles PLIs,
//! tracks the audio level, and hands extended packets to the forwarder
//! through a non-blocking queue.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::warn;
use parking_lot::Mutex;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use rtp::header::Header;

use crate::audio_level::{AudioLevel, AudioLevelParams};
use crate::error::{Error, Result};
use crate::nack::NackQueue;
use crate::packet_cache::PacketCache;
use crate::rtp_stats::{RtpDeltaInfo, RtpFlowState, RtpStats, RtpStatsParams, RtpStatsSummary};
use crate::sender_report::RtcpSenderReportData;

/// Raw packets kept for retransmission, per layer.
const PACKET_CACHE_SIZE: usize = 1024;
/// Extended packets queued towards the forwarder before drops start.
const EXT_PACKET_QUEUE_SIZE: usize = 512;

/// RTCP packets the buffer emits towards the publisher.
pub type RtcpPackets = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

pub type OnRtcpFeedback = Arc<dyn Fn(RtcpPackets) + Send + Sync>;
pub type OnRtcpSenderReport = Arc<dyn Fn() + Send + Sync>;

/// A received packet with its extended counters, as handed to the
/// forwarder.
#[derive(Debug, Clone)]
pub struct ExtPacket {
    pub arrival: Instant,
    pub header: Header,
    pub payload: Bytes,
    pub raw: Bytes,
    pub ext_sequence_number: u64,
    pub ext_timestamp: u64,
    pub is_out_of_order: bool,
    /// Spatial layer for SVC packets, -1 when the stream itself selects
    /// the layer.
    pub spatial: i32,
    pub temporal: i32,
    pub dependency_descriptor: Option<Bytes>,
}

/// One packet as handed in by the read loop.
pub struct WritePacket<'a> {
    pub header: Header,
    pub raw: &'a [u8],
    pub payload_size: usize,
    pub padding_size: usize,
    pub arrival: Instant,
    pub spatial: i32,
    pub temporal: i32,
    pub dependency_descriptor: Option<Bytes>,
}

struct BufferInner {
    cache: PacketCache,
    nack_queue: Option<NackQueue>,
    audio_level: Option<AudioLevel>,
    audio_level_ext_id: u8,
    pli_throttle: Duration,
    paused: bool,
    closed: bool,
    rtt: u32,
    on_rtcp_feedback: Option<OnRtcpFeedback>,
    on_rtcp_sender_report: Option<OnRtcpSenderReport>,
    pkt_tx: Option<SyncSender<ExtPacket>>,
}

/// Reception state for a single incoming SSRC.
pub struct Buffer {
    media_ssrc: u32,
    clock_rate: u32,
    rtp_stats: RtpStats,
    delta_snapshot_id: u32,
    inner: Mutex<BufferInner>,
    pkt_rx: Mutex<Receiver<ExtPacket>>,
}

impl Buffer {
    pub fn new(media_ssrc: u32, clock_rate: u32) -> Self {
        let (pkt_tx, pkt_rx) = std::sync::mpsc::sync_channel(EXT_PACKET_QUEUE_SIZE);
        let rtp_stats = RtpStats::new(RtpStatsParams {
            clock_rate,
            is_receiver_report_driven: false,
        });
        let delta_snapshot_id = rtp_stats.new_snapshot_id();

        Self {
            media_ssrc,
            clock_rate,
            rtp_stats,
            delta_snapshot_id,
            inner: Mutex::new(BufferInner {
                cache: PacketCache::new(PACKET_CACHE_SIZE),
                nack_queue: None,
                audio_level: None,
                audio_level_ext_id: 0,
                pli_throttle: Duration::ZERO,
                paused: false,
                closed: false,
                rtt: 0,
                on_rtcp_feedback: None,
                on_rtcp_sender_report: None,
                pkt_tx: Some(pkt_tx),
            }),
            pkt_rx: Mutex::new(pkt_rx),
        }
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Enables upstream NACK generation for this stream.
    pub fn set_nack_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        inner.nack_queue = if enabled { Some(NackQueue::new()) } else { None };
    }

    pub fn set_audio_level_params(&self, params: AudioLevelParams, extension_id: u8) {
        let mut inner = self.inner.lock();
        inner.audio_level = Some(AudioLevel::new(params));
        inner.audio_level_ext_id = extension_id;
    }

    /// Minimum time between PLIs sent on behalf of this stream.
    pub fn set_pli_throttle(&self, throttle: Duration) {
        self.inner.lock().pli_throttle = throttle;
    }

    pub fn on_rtcp_feedback(&self, f: OnRtcpFeedback) {
        self.inner.lock().on_rtcp_feedback = Some(f);
    }

    pub fn on_rtcp_sender_report(&self, f: OnRtcpSenderReport) {
        self.inner.lock().on_rtcp_sender_report = Some(f);
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().paused = paused;
    }

    pub fn set_rtt(&self, rtt: u32) {
        self.inner.lock().rtt = rtt;
        self.rtp_stats.update_rtt(rtt);
    }

    /// Ingests one packet from the read loop and forwards it.
    pub fn write_rtp(&self, pkt: WritePacket<'_>) -> Result<RtpFlowState> {
        if pkt.payload_size + pkt.padding_size > pkt.raw.len() {
            return Err(Error::InvalidPacket);
        }
        let header_size = pkt.raw.len() - pkt.payload_size - pkt.padding_size;

        {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
        }

        let flow_state = self.rtp_stats.update(
            &pkt.header,
            header_size,
            pkt.payload_size,
            pkt.padding_size,
            pkt.arrival,
        );
        if flow_state.is_not_handled {
            return Ok(flow_state);
        }

        let mut feedback: Option<(OnRtcpFeedback, RtcpPackets)> = None;
        let mut nack_count = 0u32;
        let tx = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.closed {
                return Err(Error::Closed);
            }

            if !flow_state.is_duplicate && pkt.payload_size > 0 {
                // padding only packets are never retransmitted, no need
                // to remember their bytes
                inner
                    .cache
                    .insert(flow_state.ext_sequence_number, pkt.raw);
            }

            if let Some(nack_queue) = &mut inner.nack_queue {
                if flow_state.has_loss {
                    nack_queue.push_range(
                        flow_state.loss_start_inclusive,
                        flow_state.loss_end_exclusive,
                        pkt.arrival,
                    );
                }
                if flow_state.is_out_of_order {
                    nack_queue.remove(flow_state.ext_sequence_number);
                }
            }

            if !inner.paused {
                if let Some(nack_queue) = &mut inner.nack_queue {
                    if let Some(pairs) = nack_queue.pairs(pkt.arrival) {
                        nack_count = pairs.len() as u32;
                        let nack = TransportLayerNack {
                            sender_ssrc: self.media_ssrc,
                            media_ssrc: self.media_ssrc,
                            nacks: pairs,
                        };
                        if let Some(cb) = &inner.on_rtcp_feedback {
                            feedback = Some((Arc::clone(cb), vec![Box::new(nack)]));
                        }
                    }
                }
            }

            if inner.audio_level_ext_id != 0 {
                if let Some(audio_level) = &mut inner.audio_level {
                    let ext_id = inner.audio_level_ext_id;
                    if let Some(ext) = pkt
                        .header
                        .extensions
                        .iter()
                        .find(|ext| ext.id == ext_id)
                        .map(|ext| &ext.payload)
                    {
                        if !ext.is_empty() {
                            // 20ms is the common opus frame duration; the
                            // aggregation only needs relative weights
                            audio_level.observe(ext[0] & 0x7F, 20);
                        }
                    }
                }
            }

            inner.pkt_tx.clone()
        };

        if let Some((cb, packets)) = feedback {
            self.rtp_stats.update_nack(nack_count);
            cb(packets);
        }

        if let Some(tx) = tx {
            let ext_packet = ExtPacket {
                arrival: pkt.arrival,
                header: pkt.header,
                payload: Bytes::copy_from_slice(
                    &pkt.raw[header_size..header_size + pkt.payload_size],
                ),
                raw: Bytes::copy_from_slice(pkt.raw),
                ext_sequence_number: flow_state.ext_sequence_number,
                ext_timestamp: flow_state.ext_timestamp,
                is_out_of_order: flow_state.is_out_of_order,
                spatial: pkt.spatial,
                temporal: pkt.temporal,
                dependency_descriptor: pkt.dependency_descriptor,
            };
            if let Err(TrySendError::Full(_)) = tx.try_send(ext_packet) {
                warn!(
                    "forward queue full, dropping packet, ssrc: {}, sn: {}",
                    self.media_ssrc, flow_state.ext_sequence_number,
                );
            }
        }

        Ok(flow_state)
    }

    /// Blocks for the next extended packet. Fails with `Closed` once the
    /// buffer is closed and drained.
    pub fn read_extended(&self) -> Result<ExtPacket> {
        let rx = self.pkt_rx.lock();
        rx.recv().map_err(|_| Error::Closed)
    }

    /// Copies the raw packet with the given sequence number into `buf`,
    /// for retransmission.
    pub fn get_packet(&self, buf: &mut [u8], sn: u16) -> Result<usize> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.cache.get_by_wire_sn(sn, buf)
    }

    /// Requests a keyframe, honoring the PLI throttle unless forced.
    pub fn send_pli(&self, force: bool) {
        let (throttle, cb) = {
            let inner = self.inner.lock();
            if inner.closed {
                return;
            }
            (inner.pli_throttle, inner.on_rtcp_feedback.clone())
        };

        if !force {
            if let Some(since_last) = self.rtp_stats.time_since_last_pli() {
                if since_last < throttle {
                    return;
                }
            }
        }

        self.rtp_stats.update_pli_and_time(1);

        if let Some(cb) = cb {
            let pli = PictureLossIndication {
                sender_ssrc: self.media_ssrc,
                media_ssrc: self.media_ssrc,
            };
            cb(vec![Box::new(pli)]);
        }
    }

    /// Ingests a publisher sender report and notifies the listener.
    pub fn set_sender_report(&self, sr: &SenderReport, at: Instant) {
        let cb = {
            let inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.on_rtcp_sender_report.clone()
        };

        let sr_data = RtcpSenderReportData::from_sender_report(sr, 0, at);
        self.rtp_stats.set_rtcp_sender_report_data(&sr_data);

        if let Some(cb) = cb {
            cb();
        }
    }

    pub fn sender_report_data(
        &self,
    ) -> (Option<RtcpSenderReportData>, Option<RtcpSenderReportData>) {
        self.rtp_stats.rtcp_sender_report_data()
    }

    pub fn stats(&self) -> &RtpStats {
        &self.rtp_stats
    }

    pub fn get_stats(&self) -> Option<RtpStatsSummary> {
        self.rtp_stats.summary()
    }

    /// Interval counters since this was last called.
    pub fn get_delta_stats(&self) -> Option<RtpDeltaInfo> {
        self.rtp_stats.delta_info(self.delta_snapshot_id)
    }

    pub fn get_audio_level(&self) -> Option<(f64, bool)> {
        let inner = self.inner.lock();
        inner.audio_level.as_ref().map(|al| al.level())
    }

    /// Freezes the buffer; the forward loop wakes up with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.pkt_tx = None;
        inner.on_rtcp_feedback = None;
        inner.on_rtcp_sender_report = None;
        drop(inner);

        self.rtp_stats.stop();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn raw_packet(sn: u16, ts: u32, payload_len: usize) -> (Header, Vec<u8>) {
        let header = Header {
            sequence_number: sn,
            timestamp: ts,
            ..Default::default()
        };
        (header, vec![0u8; 12 + payload_len])
    }

    fn write(buffer: &Buffer, sn: u16, ts: u32, payload_len: usize) -> Result<RtpFlowState> {
        let (header, raw) = raw_packet(sn, ts, payload_len);
        buffer.write_rtp(WritePacket {
            header,
            raw: &raw,
            payload_size: payload_len,
            padding_size: 0,
            arrival: Instant::now(),
            spatial: -1,
            temporal: 0,
            dependency_descriptor: None,
        })
    }

    #[test]
    fn test_write_read_round_trip() {
        let buffer = Buffer::new(0x1111, 90000);

        write(&buffer, 10, 1000, 100).unwrap();
        write(&buffer, 11, 1000, 100).unwrap();

        let pkt = buffer.read_extended().unwrap();
        assert_eq!(pkt.header.sequence_number, 10);
        assert_eq!(pkt.ext_sequence_number, 10);
        assert_eq!(pkt.payload.len(), 100);
        assert_eq!(pkt.raw.len(), 112);

        let pkt = buffer.read_extended().unwrap();
        assert_eq!(pkt.header.sequence_number, 11);
    }

    #[test]
    fn test_get_packet_for_retransmission() {
        let buffer = Buffer::new(0x1111, 90000);
        write(&buffer, 500, 1000, 64).unwrap();

        let mut buf = vec![0u8; 1500];
        let n = buffer.get_packet(&mut buf, 500).unwrap();
        assert_eq!(n, 76);

        assert_eq!(
            buffer.get_packet(&mut buf, 501),
            Err(Error::PacketNotFound)
        );
    }

    #[test]
    fn test_nack_feedback_on_loss() {
        let buffer = Buffer::new(0x2222, 90000);
        buffer.set_nack_enabled(true);

        let feedback: Arc<PlMutex<Vec<RtcpPackets>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&feedback);
        buffer.on_rtcp_feedback(Arc::new(move |packets| {
            sink.lock().push(packets);
        }));

        write(&buffer, 100, 1000, 100).unwrap();
        write(&buffer, 105, 2000, 100).unwrap();

        let sent = feedback.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 1);

        // nack counter was bumped
        let summary_nacks = buffer.get_stats().map(|s| s.nacks);
        assert_eq!(summary_nacks, Some(1));
    }

    #[test]
    fn test_pli_throttle() {
        let buffer = Buffer::new(0x3333, 90000);
        buffer.set_pli_throttle(Duration::from_secs(60));

        let count = Arc::new(PlMutex::new(0usize));
        let sink = Arc::clone(&count);
        buffer.on_rtcp_feedback(Arc::new(move |_| {
            *sink.lock() += 1;
        }));

        write(&buffer, 1, 0, 100).unwrap();

        buffer.send_pli(false);
        buffer.send_pli(false); // throttled
        assert_eq!(*count.lock(), 1);

        buffer.send_pli(true); // forced
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_sender_report_hook() {
        let buffer = Buffer::new(0x4444, 90000);

        let called = Arc::new(PlMutex::new(false));
        let sink = Arc::clone(&called);
        buffer.on_rtcp_sender_report(Arc::new(move || {
            *sink.lock() = true;
        }));

        write(&buffer, 1, 0, 100).unwrap();

        let sr = SenderReport {
            ssrc: 0x4444,
            ntp_time: utils::NtpTime::now().as_u64(),
            rtp_time: 1234,
            packet_count: 1,
            octet_count: 100,
            ..Default::default()
        };
        buffer.set_sender_report(&sr, Instant::now());

        assert!(*called.lock());
        let (_, newest) = buffer.sender_report_data();
        assert_eq!(newest.map(|d| d.rtp_timestamp), Some(1234));
    }

    #[test]
    fn test_closed_buffer_rejects_writes() {
        let buffer = Buffer::new(0x5555, 90000);
        write(&buffer, 1, 0, 100).unwrap();
        buffer.close();

        assert_eq!(write(&buffer, 2, 0, 100), Err(Error::Closed));
        assert_eq!(buffer.read_extended().map(|_| ()), Err(Error::Closed));
        assert!(buffer.is_closed());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        let buffer = Buffer::new(0x6666, 90000);
        let (header, raw) = raw_packet(1, 0, 10);
        let res = buffer.write_rtp(WritePacket {
            header,
            raw: &raw,
            payload_size: 100, // larger than the packet
            padding_size: 0,
            arrival: Instant::now(),
            spatial: -1,
            temporal: 0,
            dependency_descriptor: None,
        });
        assert_eq!(res.map(|_| ()), Err(Error::InvalidPacket));
    }
}
