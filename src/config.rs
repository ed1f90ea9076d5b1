//! Configuration surface of the reception core.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Certificate material for the outer endpoint; unused by the core
/// itself, carried so one config file covers the whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tls: Option<TlsConfig>,
    pub port: u16,
    /// Down-track count at which packet broadcast switches from
    /// sequential to parallel. 0 disables parallel writes.
    pub lb_threshold: usize,
    pub pli_throttle: PliThrottleConfig,
    pub audio: AudioConfig,
    pub trackers: StreamTrackersConfig,
    pub ops_queue: OpsQueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tls: None,
            port: 7880,
            lb_threshold: 3,
            pli_throttle: PliThrottleConfig::default(),
            audio: AudioConfig::default(),
            trackers: StreamTrackersConfig::default(),
            ops_queue: OpsQueueConfig::default(),
        }
    }
}

impl Config {
    /// Clamps values into their documented ranges.
    pub fn validate(&mut self) {
        if self.lb_threshold > 150 {
            self.lb_threshold = 150;
        }
    }
}

/// Minimum spacing of keyframe requests, per simulcast quality tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PliThrottleConfig {
    pub low_quality_ms: u64,
    pub mid_quality_ms: u64,
    pub high_quality_ms: u64,
}

impl Default for PliThrottleConfig {
    fn default() -> Self {
        Self {
            low_quality_ms: 500,
            mid_quality_ms: 1000,
            high_quality_ms: 1000,
        }
    }
}

impl PliThrottleConfig {
    pub fn for_layer(&self, layer: i32) -> Duration {
        let ms = match layer {
            0 => self.low_quality_ms,
            1 => self.mid_quality_ms,
            2 => self.high_quality_ms,
            _ => self.mid_quality_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Active speaker detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// dBov attenuation below which a packet counts as speech.
    pub active_level: u8,
    /// Percent of a window that must be speech.
    pub min_percentile: u8,
    pub update_interval_ms: u32,
    pub smooth_intervals: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            active_level: 35,
            min_percentile: 40,
            update_interval_ms: 400,
            smooth_intervals: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTrackerType {
    Packet,
    Frame,
}

/// Packet-count based layer liveness detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerPacketConfig {
    /// Packets needed after a reset before the layer declares itself.
    pub samples_required: u32,
    /// Silent cycles before the layer is declared stopped.
    pub cycles_required: u32,
    pub cycle_duration_ms: u64,
}

impl Default for StreamTrackerPacketConfig {
    fn default() -> Self {
        Self {
            samples_required: 1,
            cycles_required: 4,
            cycle_duration_ms: 500,
        }
    }
}

/// Frame-rate based layer liveness detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerFrameConfig {
    /// Layer is stopped when it falls below this frame rate.
    pub min_fps: f64,
    pub cycle_duration_ms: u64,
}

impl Default for StreamTrackerFrameConfig {
    fn default() -> Self {
        Self {
            min_fps: 5.0,
            cycle_duration_ms: 2000,
        }
    }
}

/// Per-source tracker selection and per-layer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackerConfig {
    pub tracker_type: StreamTrackerType,
    pub bitrate_report_interval_ms: BTreeMap<i32, u64>,
    pub packet_tracker: BTreeMap<i32, StreamTrackerPacketConfig>,
    pub frame_tracker: BTreeMap<i32, StreamTrackerFrameConfig>,
}

impl Default for StreamTrackerConfig {
    fn default() -> Self {
        let layers = 0..=buffer::DEFAULT_MAX_LAYER_SPATIAL;
        Self {
            tracker_type: StreamTrackerType::Packet,
            bitrate_report_interval_ms: layers.clone().map(|l| (l, 1000)).collect(),
            packet_tracker: layers
                .clone()
                .map(|l| (l, StreamTrackerPacketConfig::default()))
                .collect(),
            frame_tracker: layers
                .map(|l| (l, StreamTrackerFrameConfig::default()))
                .collect(),
        }
    }
}

impl StreamTrackerConfig {
    pub fn bitrate_report_interval(&self, layer: i32) -> Option<Duration> {
        self.bitrate_report_interval_ms
            .get(&layer)
            .map(|ms| Duration::from_millis(*ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamTrackersConfig {
    pub video: StreamTrackerConfig,
    pub screenshare: StreamTrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsQueueConfig {
    pub min_size: usize,
    pub flush_on_stop: bool,
}

impl Default for OpsQueueConfig {
    fn default() -> Self {
        Self {
            min_size: 16,
            flush_on_stop: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.lb_threshold, 3);
        assert_eq!(
            config.pli_throttle.for_layer(0),
            Duration::from_millis(500)
        );
        assert_eq!(
            config.pli_throttle.for_layer(7),
            Duration::from_millis(1000)
        );
        assert!(config
            .trackers
            .video
            .bitrate_report_interval(0)
            .is_some());
        assert!(config
            .trackers
            .video
            .bitrate_report_interval(5)
            .is_none());
    }

    #[test]
    fn test_validate_clamps_lb_threshold() {
        let mut config = Config {
            lb_threshold: 10_000,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.lb_threshold, 150);
    }
}
