//! Packet-count based layer liveness detection.

use std::time::Duration;

use crate::config::StreamTrackerPacketConfig;
use crate::stream_tracker::StreamStatus;

/// Declares a layer live once enough packets arrive and stopped after a
/// run of silent cycles.
pub struct StreamTrackerPacket {
    config: StreamTrackerPacketConfig,

    samples_since_reset: u32,
    packets_in_cycle: u32,
    silent_cycles: u32,
}

impl StreamTrackerPacket {
    pub fn new(config: StreamTrackerPacketConfig) -> Self {
        Self {
            config,
            samples_since_reset: 0,
            packets_in_cycle: 0,
            silent_cycles: 0,
        }
    }

    pub(crate) fn cycle_duration(&self) -> Duration {
        Duration::from_millis(self.config.cycle_duration_ms)
    }

    pub(crate) fn observe(
        &mut self,
        _temporal: i32,
        _pkt_size: usize,
        payload_size: usize,
        _marker: bool,
    ) -> Option<StreamStatus> {
        if payload_size == 0 {
            // padding keeps a stopped layer stopped
            return None;
        }

        self.samples_since_reset = self.samples_since_reset.saturating_add(1);
        self.packets_in_cycle += 1;

        if self.samples_since_reset >= self.config.samples_required {
            return Some(StreamStatus::Active);
        }
        None
    }

    pub(crate) fn check_status(&mut self) -> Option<StreamStatus> {
        let mut proposed = None;
        if self.packets_in_cycle == 0 {
            self.silent_cycles += 1;
            if self.silent_cycles >= self.config.cycles_required {
                self.samples_since_reset = 0;
                proposed = Some(StreamStatus::Stopped);
            }
        } else {
            self.silent_cycles = 0;
        }

        self.packets_in_cycle = 0;
        proposed
    }

    pub(crate) fn reset(&mut self) {
        self.samples_since_reset = 0;
        self.packets_in_cycle = 0;
        self.silent_cycles = 0;
    }
}
