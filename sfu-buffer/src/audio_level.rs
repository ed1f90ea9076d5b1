//! Active speaker detection from RFC 6464 audio level header extensions.

/// Parameters for audio level smoothing and activity detection. Levels
/// are dBov attenuation values: 0 is loudest, 127 is silence.
#[derive(Debug, Clone, Copy)]
pub struct AudioLevelParams {
    /// Levels quieter than this (numerically larger) do not count as
    /// speech.
    pub active_level: u8,
    /// Percent of an observe window that must be active for the window to
    /// count as speech.
    pub min_percentile: u8,
    /// Length of one observe window, in milliseconds.
    pub observe_duration_ms: u32,
    /// Exponential smoothing span across windows.
    pub smooth_intervals: u32,
}

impl Default for AudioLevelParams {
    fn default() -> Self {
        Self {
            active_level: 35,
            min_percentile: 40,
            observe_duration_ms: 500,
            smooth_intervals: 4,
        }
    }
}

/// Aggregates per-packet audio levels into a smoothed activity signal.
pub struct AudioLevel {
    params: AudioLevelParams,

    // current observe window
    level_duration_sum: f64,
    active_duration: u32,
    total_duration: u32,

    smoothed_level: f64,
    is_active: bool,
}

impl AudioLevel {
    pub fn new(params: AudioLevelParams) -> Self {
        Self {
            params,
            level_duration_sum: 0.0,
            active_duration: 0,
            total_duration: 0,
            smoothed_level: 0.0,
            is_active: false,
        }
    }

    /// Records one packet's level covering `duration_ms` of audio.
    pub fn observe(&mut self, level: u8, duration_ms: u32) {
        self.total_duration += duration_ms;

        if level < self.params.active_level {
            self.active_duration += duration_ms;
            self.level_duration_sum += level as f64 * duration_ms as f64;
        }

        if self.total_duration >= self.params.observe_duration_ms {
            let active_pct = self.active_duration * 100 / self.total_duration;
            if self.active_duration > 0 && active_pct >= self.params.min_percentile as u32 {
                let window_level = self.level_duration_sum / self.active_duration as f64;
                self.smoothed_level += (window_level - self.smoothed_level)
                    / self.params.smooth_intervals.max(1) as f64;
                self.is_active = true;
            } else {
                self.is_active = false;
            }

            self.level_duration_sum = 0.0;
            self.active_duration = 0;
            self.total_duration = 0;
        }
    }

    /// Smoothed level of the most recent active window and whether the
    /// speaker is currently considered active. The level is inverted to
    /// "loudness" (higher is louder) for consumers.
    pub fn level(&self) -> (f64, bool) {
        if !self.is_active {
            return (0.0, false);
        }
        (127.0 - self.smoothed_level, true)
    }
}
