//! Frame-rate based layer liveness detection.
//!
//! Frames are detected by RTP timestamp transitions; a layer is live
//! while its frame rate stays at or above the configured floor.

use std::time::Duration;

use crate::config::StreamTrackerFrameConfig;
use crate::stream_tracker::StreamStatus;

pub struct StreamTrackerFrame {
    config: StreamTrackerFrameConfig,

    last_timestamp: Option<u32>,
    frames_in_cycle: u32,
    seen_frame_since_reset: bool,
}

impl StreamTrackerFrame {
    pub fn new(config: StreamTrackerFrameConfig) -> Self {
        Self {
            config,
            last_timestamp: None,
            frames_in_cycle: 0,
            seen_frame_since_reset: false,
        }
    }

    pub(crate) fn cycle_duration(&self) -> Duration {
        Duration::from_millis(self.config.cycle_duration_ms)
    }

    pub(crate) fn observe(&mut self, _marker: bool, timestamp: u32) -> Option<StreamStatus> {
        if self.last_timestamp == Some(timestamp) {
            // another packet of the same frame
            return None;
        }
        self.last_timestamp = Some(timestamp);
        self.frames_in_cycle += 1;

        if !self.seen_frame_since_reset {
            self.seen_frame_since_reset = true;
            return Some(StreamStatus::Active);
        }
        None
    }

    pub(crate) fn check_status(&mut self) -> Option<StreamStatus> {
        let fps = self.frames_in_cycle as f64 / self.cycle_duration().as_secs_f64();
        self.frames_in_cycle = 0;

        if fps < self.config.min_fps {
            self.seen_frame_since_reset = false;
            Some(StreamStatus::Stopped)
        } else {
            Some(StreamStatus::Active)
        }
    }

    pub(crate) fn reset(&mut self) {
        self.last_timestamp = None;
        self.frames_in_cycle = 0;
        self.seen_frame_since_reset = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tracker(min_fps: f64) -> StreamTrackerFrame {
        StreamTrackerFrame::new(StreamTrackerFrameConfig {
            min_fps,
            cycle_duration_ms: 1000,
        })
    }

    #[test]
    fn test_first_frame_declares() {
        let mut t = new_tracker(5.0);
        assert_eq!(t.observe(false, 3000), Some(StreamStatus::Active));
        // more packets of the same frame change nothing
        assert_eq!(t.observe(true, 3000), None);
    }

    #[test]
    fn test_fps_gate() {
        let mut t = new_tracker(5.0);

        // 10 frames in a 1s cycle
        for i in 0..10u32 {
            t.observe(true, i * 9000);
        }
        assert_eq!(t.check_status(), Some(StreamStatus::Active));

        // only 2 frames the next cycle
        t.observe(true, 100_000);
        t.observe(true, 109_000);
        assert_eq!(t.check_status(), Some(StreamStatus::Stopped));

        // the first frame after the drop redeclares
        assert_eq!(t.observe(true, 200_000), Some(StreamStatus::Active));
    }
}
