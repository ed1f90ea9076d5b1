//! Bounded window of recently received raw packets.
//!
//! Retransmission requests and `ReadRTP` are answered out of this ring.
//! Entries are keyed by the extended sequence numbers the stats engine
//! produces, the same numbering the rest of the reception path runs on:
//! each slot remembers the full extended value it holds, so a slot left
//! over from an earlier lap of the ring simply fails the identity check
//! instead of needing an invalidation sweep. Requests arrive with 16-bit
//! wire sequence numbers; the cache maps them back to the most recent
//! extended value before looking up.

use bytes::Bytes;

use crate::error::{Error, Result};

struct Slot {
    ext_sequence_number: u64,
    raw: Bytes,
}

/// Ring of raw packets keyed by extended sequence number.
pub struct PacketCache {
    slots: Vec<Option<Slot>>,
    mask: u64,
    /// Highest extended sequence number inserted so far.
    highest: Option<u64>,
}

impl PacketCache {
    /// `capacity` is rounded up to the next power of two so slot indexing
    /// stays a mask.
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self {
            slots,
            mask: size as u64 - 1,
            highest: None,
        }
    }

    fn window(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Stores a copy of `raw` under its extended sequence number. Late
    /// packets land in their old slot as long as they are still inside
    /// the retention window; anything older is dropped rather than
    /// displacing the newer lap that owns the slot now.
    pub fn insert(&mut self, ext_sequence_number: u64, raw: &[u8]) {
        match self.highest {
            None => self.highest = Some(ext_sequence_number),
            Some(highest) => {
                if ext_sequence_number > highest {
                    self.highest = Some(ext_sequence_number);
                } else if highest - ext_sequence_number >= self.window() {
                    return;
                }
            }
        }

        let slot = &mut self.slots[(ext_sequence_number & self.mask) as usize];
        match slot {
            // keep the first copy of a retransmitted packet
            Some(existing) if existing.ext_sequence_number >= ext_sequence_number => {}
            _ => {
                *slot = Some(Slot {
                    ext_sequence_number,
                    raw: Bytes::copy_from_slice(raw),
                });
            }
        }
    }

    /// Copies the packet stored under `ext_sequence_number` into `out`
    /// and returns its length. Lost packets and slots reused by a later
    /// lap report `PacketNotFound`; everything behind the retention
    /// window reports `PacketTooOld`.
    pub fn get(&self, ext_sequence_number: u64, out: &mut [u8]) -> Result<usize> {
        let highest = self.highest.ok_or(Error::PacketNotFound)?;
        if ext_sequence_number > highest {
            return Err(Error::PacketNotFound);
        }
        if highest - ext_sequence_number >= self.window() {
            return Err(Error::PacketTooOld);
        }

        let raw = match &self.slots[(ext_sequence_number & self.mask) as usize] {
            Some(slot) if slot.ext_sequence_number == ext_sequence_number => &slot.raw,
            _ => return Err(Error::PacketNotFound),
        };

        if out.len() < raw.len() {
            return Err(Error::BufferTooSmall);
        }
        out[..raw.len()].copy_from_slice(raw);
        Ok(raw.len())
    }

    /// Looks up a 16-bit wire sequence number by reconstructing the most
    /// recent extended value carrying it.
    pub fn get_by_wire_sn(&self, sn: u16, out: &mut [u8]) -> Result<usize> {
        let highest = self.highest.ok_or(Error::PacketNotFound)?;

        let mut ext_sequence_number = (highest & !0xFFFF) | sn as u64;
        if ext_sequence_number > highest {
            // the requested number belongs to the previous lap of the
            // 16-bit counter
            ext_sequence_number = ext_sequence_number.wrapping_sub(1 << 16);
        }

        self.get(ext_sequence_number, out)
    }
}
