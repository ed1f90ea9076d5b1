//! Memory of recently forwarded packets, keyed by the outgoing sequence
//! number, to answer NACK retransmission requests.
//!
//! A `seq` ring of `max_track + max_padding` slots maps outgoing sequence
//! numbers to entries in a circular `meta` arena. Padding slots and gaps
//! hold no entry so a NACK for them is refused. Retransmissions are rate
//! limited per sequence number and capped at three sends.

use std::time::Instant;

use log::debug;
use parking_lot::Mutex;

const DEFAULT_RTT: u32 = 70;
/// Ignore a repeat retransmission request within this many milliseconds.
const IGNORE_RETRANSMISSION_MS: u32 = 100;
const MAX_NACKED: u8 = 3;

/// What the down track needs to rebuild and resend one packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketMeta {
    /// Sequence number on the publisher's stream, used to find the
    /// original packet.
    pub source_seq_no: u16,
    /// Sequence number on the down track. Offset-adjusted, must not be
    /// shared across tracks.
    pub target_seq_no: u16,
    /// Timestamp on the down track.
    pub timestamp: u32,
    pub marker: bool,
    /// Spatial layer the packet came from.
    pub layer: i8,
    /// Codec-dependent rewrite state.
    pub codec_bytes: Vec<u8>,
    /// Dependency descriptor of the packet.
    pub dd_bytes: Vec<u8>,

    /// When this packet was last requested, in milliseconds since the
    /// sequencer start. Clients re-request packets they are about to
    /// receive; this keeps us from sending them twice.
    last_nack: u32,
    /// How many times this packet has been requested.
    nacked: u8,
}

struct SequencerInner {
    init: bool,
    seq: Vec<Option<usize>>,
    meta: Vec<PacketMeta>,
    meta_write_ptr: usize,
    step: usize,
    head_sn: u16,
    rtt: u32,
}

/// Ring of recently forwarded packet metadata for one down track.
pub struct Sequencer {
    max: usize,
    start_time: Instant,
    inner: Mutex<SequencerInner>,
}

impl Sequencer {
    pub fn new(max_track: usize, max_padding: usize) -> Self {
        Self {
            max: max_track + max_padding,
            start_time: Instant::now(),
            inner: Mutex::new(SequencerInner {
                init: false,
                seq: vec![None; max_track + max_padding],
                meta: vec![PacketMeta::default(); max_track],
                meta_write_ptr: 0,
                step: 0,
                head_sn: 0,
                rtt: DEFAULT_RTT,
            }),
        }
    }

    pub fn set_rtt(&self, rtt: u32) {
        let mut inner = self.inner.lock();
        inner.rtt = if rtt == 0 { DEFAULT_RTT } else { rtt };
    }

    /// Records one forwarded packet. Byte slices are copied so the caller
    /// keeps ownership of its buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &self,
        sn: u16,
        off_sn: u16,
        timestamp: u32,
        marker: bool,
        layer: i8,
        codec_bytes: &[u8],
        dd_bytes: &[u8],
    ) {
        let ref_time = self.ref_time_ms();
        let mut inner = self.inner.lock();

        let slot = match self.get_slot(&mut inner, off_sn) {
            Some(slot) => slot,
            None => return,
        };

        let meta_write_ptr = inner.meta_write_ptr;
        inner.meta[meta_write_ptr] = PacketMeta {
            source_seq_no: sn,
            target_seq_no: off_sn,
            timestamp,
            marker,
            layer,
            codec_bytes: codec_bytes.to_vec(),
            dd_bytes: dd_bytes.to_vec(),
            // delay retransmissions after the original transmission
            last_nack: ref_time,
            nacked: 0,
        };
        inner.seq[slot] = Some(meta_write_ptr);

        inner.meta_write_ptr = (meta_write_ptr + 1) % inner.meta.len();
    }

    /// Records an outgoing padding slot; NACKs for it are refused.
    pub fn push_padding(&self, off_sn: u16) {
        let mut inner = self.inner.lock();

        if let Some(slot) = self.get_slot(&mut inner, off_sn) {
            inner.seq[slot] = None;
        }
    }

    /// Returns metadata for the requested sequence numbers that are known,
    /// due (outside the pacing window) and under the retry cap. Returned
    /// byte buffers are independent copies.
    pub fn get_packets_meta(&self, seq_nos: &[u16]) -> Vec<PacketMeta> {
        let ref_time = self.ref_time_ms();
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let mut metas = Vec::with_capacity(seq_nos.len());
        for &sn in seq_nos {
            let diff = inner.head_sn.wrapping_sub(sn);
            if diff > (1 << 15) || diff as usize >= self.max {
                // out-of-order from head (should not happen) or too old
                continue;
            }

            let slot = self.wrap(inner.step as i64 - diff as i64 - 1);
            let meta_idx = match inner.seq[slot] {
                Some(idx) => idx,
                None => continue,
            };

            let meta = &mut inner.meta[meta_idx];
            if meta.target_seq_no != sn {
                continue;
            }

            let pacing = IGNORE_RETRANSMISSION_MS.min(2 * inner.rtt);
            if ref_time.wrapping_sub(meta.last_nack) > pacing && meta.nacked < MAX_NACKED {
                meta.nacked += 1;
                meta.last_nack = ref_time;

                metas.push(meta.clone());
            }
        }

        metas
    }

    fn get_slot(&self, inner: &mut SequencerInner, off_sn: u16) -> Option<usize> {
        if !inner.init {
            inner.head_sn = off_sn.wrapping_sub(1);
            inner.init = true;
        }

        let diff = off_sn.wrapping_sub(inner.head_sn);
        if diff == 0 {
            // duplicate
            return None;
        }

        let slot = if diff > (1 << 15) {
            // out-of-order
            let back = inner.head_sn.wrapping_sub(off_sn) as usize;
            if back >= self.max {
                debug!(
                    "old packet, can not be sequenced, head: {}, received: {}",
                    inner.head_sn, off_sn,
                );
                return None;
            }
            inner.step as i64 - back as i64 - 1
        } else {
            inner.head_sn = off_sn;

            // invalidate intervening slots
            for idx in 0..(diff as usize - 1) {
                let s = self.wrap(inner.step as i64 + idx as i64);
                inner.seq[s] = None;
            }

            let slot = inner.step as i64 + diff as i64 - 1;

            // for the next packet
            inner.step = self.wrap(inner.step as i64 + diff as i64);

            slot
        };

        Some(self.wrap(slot))
    }

    fn wrap(&self, mut slot: i64) -> usize {
        let max = self.max as i64;
        while slot < 0 {
            slot += max;
        }
        while slot >= max {
            slot -= max;
        }
        slot as usize
    }

    fn ref_time_ms(&self) -> u32 {
        self.start_time.elapsed().as_millis() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn test_push_and_fetch() {
        let s = Sequencer::new(500, 20);
        s.set_rtt(0); // falls back to the 70ms default

        for i in 0..10u16 {
            s.push(100 + i, 1000 + i, 777, i == 9, 1, &[1, 2, i as u8], &[9, i as u8]);
        }

        sleep(Duration::from_millis(150));

        let metas = s.get_packets_meta(&[1002, 1005, 1009]);
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[0].source_seq_no, 102);
        assert_eq!(metas[0].target_seq_no, 1002);
        assert_eq!(metas[0].layer, 1);
        assert_eq!(metas[0].codec_bytes, vec![1, 2, 2]);
        assert_eq!(metas[0].dd_bytes, vec![9, 2]);
        assert!(metas[2].marker);

        // unknown sequence number returns nothing
        assert!(s.get_packets_meta(&[2000]).is_empty());
    }

    #[test]
    fn test_returned_buffers_are_independent() {
        let s = Sequencer::new(100, 10);
        s.push(1, 501, 0, false, 0, &[1, 2, 3], &[4, 5]);

        sleep(Duration::from_millis(150));

        let mut metas = s.get_packets_meta(&[501]);
        assert_eq!(metas.len(), 1);
        metas[0].codec_bytes[0] = 99;

        sleep(Duration::from_millis(150));
        let metas = s.get_packets_meta(&[501]);
        assert_eq!(metas[0].codec_bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_nack_pacing_and_cap() {
        let s = Sequencer::new(100, 10);
        s.set_rtt(40); // pacing window min(100, 2*40) = 80ms

        s.push(500, 500, 0, false, 0, &[], &[]);

        // too soon after the original transmission
        sleep(Duration::from_millis(50));
        assert!(s.get_packets_meta(&[500]).is_empty());

        // past the pacing window
        sleep(Duration::from_millis(70));
        let metas = s.get_packets_meta(&[500]);
        assert_eq!(metas.len(), 1);

        // each further request is returned once per pacing window
        sleep(Duration::from_millis(90));
        assert_eq!(s.get_packets_meta(&[500]).len(), 1);
        // immediate repeat is paced out
        assert!(s.get_packets_meta(&[500]).is_empty());

        sleep(Duration::from_millis(90));
        assert_eq!(s.get_packets_meta(&[500]).len(), 1);

        // fourth request hits the cap
        sleep(Duration::from_millis(90));
        assert!(s.get_packets_meta(&[500]).is_empty());
    }

    #[test]
    fn test_padding_refused() {
        let s = Sequencer::new(100, 10);
        s.push(1, 700, 0, false, 0, &[], &[]);
        s.push_padding(701);
        s.push(2, 702, 0, false, 0, &[], &[]);

        sleep(Duration::from_millis(150));

        let metas = s.get_packets_meta(&[700, 701, 702]);
        assert_eq!(metas.len(), 2);
        assert_eq!(metas[0].target_seq_no, 700);
        assert_eq!(metas[1].target_seq_no, 702);
    }

    #[test]
    fn test_gap_slots_are_invalid() {
        let s = Sequencer::new(100, 10);
        s.push(1, 100, 0, false, 0, &[], &[]);
        // jump: 101..=104 never pushed
        s.push(2, 105, 0, false, 0, &[], &[]);

        sleep(Duration::from_millis(150));

        let metas = s.get_packets_meta(&[100, 102, 103, 105]);
        let targets: Vec<u16> = metas.iter().map(|m| m.target_seq_no).collect();
        assert_eq!(targets, vec![100, 105]);
    }

    #[test]
    fn test_out_of_order_push() {
        let s = Sequencer::new(100, 10);
        s.push(1, 300, 0, false, 0, &[], &[]);
        s.push(3, 302, 0, false, 0, &[], &[]);
        // late packet fills its old slot
        s.push(2, 301, 0, false, 0, &[], &[]);

        sleep(Duration::from_millis(150));

        let metas = s.get_packets_meta(&[300, 301, 302]);
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[1].source_seq_no, 2);
    }

    #[test]
    fn test_too_old_out_of_order_dropped() {
        let s = Sequencer::new(32, 0);
        s.push(1, 1000, 0, false, 0, &[], &[]);
        for i in 1..40u16 {
            s.push(1 + i, 1000 + i, 0, false, 0, &[], &[]);
        }
        // way behind the ring
        s.push(99, 1000, 0, false, 0, &[], &[]);

        sleep(Duration::from_millis(150));
        assert!(s.get_packets_meta(&[1000]).is_empty());
    }

    #[test]
    fn test_duplicate_push_ignored() {
        let s = Sequencer::new(100, 10);
        s.push(1, 400, 0, false, 0, &[1], &[]);
        s.push(7, 400, 0, false, 0, &[7], &[]);

        sleep(Duration::from_millis(150));
        let metas = s.get_packets_meta(&[400]);
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].codec_bytes, vec![1]);
    }
}
