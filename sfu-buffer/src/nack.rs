//! Upstream retransmission requests for losses seen on the incoming
//! stream.
//!
//! Missing sequence numbers reported by the stats engine are remembered
//! here; due entries are periodically turned into `TransportLayerNack`
//! pairs for the publisher. Entries back off between sends, are capped in
//! tries, and expire.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rtcp::transport_feedbacks::transport_layer_nack::NackPair;

/// How long a missing packet is worth chasing at all.
const NACK_LIFETIME: Duration = Duration::from_secs(2);
/// Minimum spacing between requests for the same sequence number.
const NACK_BACKOFF: Duration = Duration::from_millis(100);
/// A sequence number is requested at most this many times.
const MAX_TRIES: u8 = 3;
/// Bound on remembered missing sequence numbers.
const MAX_QUEUED: usize = 100;

#[derive(Debug, Clone, Copy)]
struct NackEntry {
    first_at: Instant,
    last_sent_at: Option<Instant>,
    tries: u8,
}

/// Tracks missing extended sequence numbers and paces retransmission
/// requests for them.
pub struct NackQueue {
    missing: BTreeMap<u64, NackEntry>,
}

impl NackQueue {
    pub fn new() -> Self {
        Self {
            missing: BTreeMap::new(),
        }
    }

    /// Remembers `[start, end)` as missing.
    pub fn push_range(&mut self, start_inclusive: u64, end_exclusive: u64, now: Instant) {
        let mut esn = start_inclusive;
        while esn != end_exclusive {
            self.missing.insert(
                esn,
                NackEntry {
                    first_at: now,
                    last_sent_at: None,
                    tries: 0,
                },
            );
            esn = esn.wrapping_add(1);
        }

        while self.missing.len() > MAX_QUEUED {
            // the oldest entries would age out first anyway
            if let Some((&oldest, _)) = self.missing.iter().next() {
                self.missing.remove(&oldest);
            }
        }
    }

    /// Forgets a sequence number, e.g. because it arrived out-of-order.
    pub fn remove(&mut self, ext_sequence_number: u64) {
        self.missing.remove(&ext_sequence_number);
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// Returns the NACK pairs that are due now, if any. The per-entry
    /// backoff and try cap are applied here.
    pub fn pairs(&mut self, now: Instant) -> Option<Vec<NackPair>> {
        let mut due: Vec<u16> = Vec::new();

        self.missing.retain(|&esn, entry| {
            if now.duration_since(entry.first_at) >= NACK_LIFETIME || entry.tries >= MAX_TRIES {
                return false;
            }

            let is_due = match entry.last_sent_at {
                Some(last) => now.duration_since(last) >= NACK_BACKOFF,
                None => true,
            };
            if is_due {
                entry.tries += 1;
                entry.last_sent_at = Some(now);
                due.push((esn & 0xFFFF) as u16);
            }
            true
        });

        if due.is_empty() {
            return None;
        }

        // compress into (pid, blp) pairs covering runs of 17
        let mut pairs = Vec::new();
        let mut pid = due[0];
        let mut blp = 0u16;
        for &sn in &due[1..] {
            let diff = sn.wrapping_sub(pid);
            if diff > 0 && diff <= 16 {
                blp |= 1 << (diff - 1);
            } else {
                pairs.push(NackPair {
                    packet_id: pid,
                    lost_packets: blp,
                });
                pid = sn;
                blp = 0;
            }
        }
        pairs.push(NackPair {
            packet_id: pid,
            lost_packets: blp,
        });

        Some(pairs)
    }
}

impl Default for NackQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairs_compress_runs() {
        let mut q = NackQueue::new();
        let now = Instant::now();
        q.push_range(103, 113, now);

        let pairs = q.pairs(now).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].packet_id, 103);
        assert_eq!(pairs[0].lost_packets, 0b1_1111_1111);
    }

    #[test]
    fn test_backoff_between_sends() {
        let mut q = NackQueue::new();
        let now = Instant::now();
        q.push_range(10, 11, now);

        assert!(q.pairs(now).is_some());
        // immediately again: not due
        assert!(q.pairs(now + Duration::from_millis(10)).is_none());
        // past the backoff: due again
        assert!(q.pairs(now + Duration::from_millis(150)).is_some());
    }

    #[test]
    fn test_try_cap_and_lifetime() {
        let mut q = NackQueue::new();
        let now = Instant::now();
        q.push_range(10, 11, now);

        for i in 0..MAX_TRIES {
            assert!(q
                .pairs(now + Duration::from_millis(110 * i as u64))
                .is_some());
        }
        // capped out
        assert!(q.pairs(now + Duration::from_millis(500)).is_none());
        assert!(q.is_empty());

        // a fresh entry expires after the lifetime even if never sent
        q.push_range(20, 21, now);
        assert!(q.pairs(now + Duration::from_secs(3)).is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_remove_on_recovery() {
        let mut q = NackQueue::new();
        let now = Instant::now();
        q.push_range(100, 105, now);
        for esn in 100..105u64 {
            q.remove(esn);
        }
        assert!(q.pairs(now).is_none());
    }

    #[test]
    fn test_bounded_queue() {
        let mut q = NackQueue::new();
        let now = Instant::now();
        q.push_range(0, 500, now);
        assert!(q.missing.len() <= MAX_QUEUED);
        // the newest entries survive
        assert!(q.missing.contains_key(&499));
        assert!(!q.missing.contains_key(&0));
    }
}
