//! Layer tracking driven by the dependency descriptor extension.
//!
//! SVC streams carry all spatial layers in one RTP stream; the
//! depacketizer attributes each packet to a (spatial, temporal) pair.
//! One shared tracker owns the per-layer state and hands out per-layer
//! views that plug into the manager like any other worker.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::error;
use parking_lot::Mutex;

use buffer::{DEFAULT_MAX_LAYER_SPATIAL, DEFAULT_MAX_LAYER_TEMPORAL};
use utils::Fuse;

use crate::stream_tracker::{
    OnBitrateAvailable, OnStatusChanged, StreamStatus, StreamTrackerWorker,
};

const SPATIAL_LAYERS: usize = DEFAULT_MAX_LAYER_SPATIAL as usize + 1;
const TEMPORAL_LAYERS: usize = DEFAULT_MAX_LAYER_TEMPORAL as usize + 1;

/// A layer with no packets for this many report intervals is stopped.
const SILENT_INTERVALS_TO_STOP: u32 = 2;

struct DdState {
    bytes: [[i64; TEMPORAL_LAYERS]; SPATIAL_LAYERS],
    bitrates: [[i64; TEMPORAL_LAYERS]; SPATIAL_LAYERS],
    active: [bool; SPATIAL_LAYERS],
    last_seen: [Option<Instant>; SPATIAL_LAYERS],
    bitrate_available: [bool; SPATIAL_LAYERS],
    paused: bool,
    fuse: Option<Fuse>,
}

#[derive(Default)]
struct DdLayerCallbacks {
    on_status_changed: Option<OnStatusChanged>,
    on_bitrate_available: Option<OnBitrateAvailable>,
}

struct DdShared {
    bitrate_report_interval: Duration,
    state: Mutex<DdState>,
    callbacks: Mutex<[DdLayerCallbacks; SPATIAL_LAYERS]>,
}

impl DdShared {
    fn fire_status(&self, layer: usize, status: StreamStatus) {
        let callbacks = self.callbacks.lock();
        if let Some(cb) = callbacks[layer].on_status_changed.as_ref() {
            cb(status);
        }
    }

    fn fire_bitrate_available(&self, layer: usize) {
        let callbacks = self.callbacks.lock();
        if let Some(cb) = callbacks[layer].on_bitrate_available.as_ref() {
            cb();
        }
    }

    fn worker(self: Arc<Self>, fuse: Fuse) {
        loop {
            if fuse.wait_timeout(self.bitrate_report_interval) {
                return;
            }

            let mut stopped_layers = Vec::new();
            let mut bitrate_layers = Vec::new();
            {
                let mut state = self.state.lock();
                if state.paused {
                    continue;
                }

                let secs = self.bitrate_report_interval.as_secs_f64();
                let silence =
                    self.bitrate_report_interval * SILENT_INTERVALS_TO_STOP;
                for s in 0..SPATIAL_LAYERS {
                    for t in 0..TEMPORAL_LAYERS {
                        state.bitrates[s][t] = (state.bytes[s][t] as f64 * 8.0 / secs) as i64;
                        state.bytes[s][t] = 0;
                    }

                    if state.active[s] {
                        let silent = match state.last_seen[s] {
                            Some(seen) => seen.elapsed() > silence,
                            None => true,
                        };
                        if silent {
                            state.active[s] = false;
                            stopped_layers.push(s);
                        }
                    }

                    if !state.bitrate_available[s]
                        && state.bitrates[s].iter().any(|b| *b != 0)
                    {
                        state.bitrate_available[s] = true;
                        bitrate_layers.push(s);
                    }
                }
            }

            for s in stopped_layers {
                self.fire_status(s, StreamStatus::Stopped);
            }
            for s in bitrate_layers {
                self.fire_bitrate_available(s);
            }
        }
    }

    fn ensure_started(self: &Arc<Self>) {
        let fuse = {
            let mut state = self.state.lock();
            if state.fuse.is_some() {
                return;
            }
            let fuse = Fuse::new();
            state.fuse = Some(fuse.clone());
            fuse
        };

        let shared = Arc::clone(self);
        let builder = thread::Builder::new().name("stream-tracker-dd".to_owned());
        if let Err(err) = builder.spawn(move || shared.worker(fuse)) {
            error!("failed to spawn dependency descriptor tracker worker: {err}");
        }
    }
}

/// Shared tracker for all spatial layers of a dependency-descriptor
/// stream.
pub struct StreamTrackerDependencyDescriptor {
    shared: Arc<DdShared>,
}

impl StreamTrackerDependencyDescriptor {
    pub fn new(bitrate_report_interval: Duration) -> Self {
        Self {
            shared: Arc::new(DdShared {
                bitrate_report_interval,
                state: Mutex::new(DdState {
                    bytes: [[0; TEMPORAL_LAYERS]; SPATIAL_LAYERS],
                    bitrates: [[0; TEMPORAL_LAYERS]; SPATIAL_LAYERS],
                    active: [false; SPATIAL_LAYERS],
                    last_seen: [None; SPATIAL_LAYERS],
                    bitrate_available: [false; SPATIAL_LAYERS],
                    paused: false,
                    fuse: None,
                }),
                callbacks: Mutex::new(Default::default()),
            }),
        }
    }

    /// Per-layer view over the shared state, usable wherever a regular
    /// worker is.
    pub fn layered_tracker(&self, layer: i32) -> Arc<dyn StreamTrackerWorker> {
        let layer = layer.clamp(0, DEFAULT_MAX_LAYER_SPATIAL) as usize;
        Arc::new(DdLayerView {
            shared: Arc::clone(&self.shared),
            layer,
        })
    }

    /// Stops the shared worker for all layers.
    pub fn stop(&self) {
        let fuse = self.shared.state.lock().fuse.take();
        if let Some(fuse) = fuse {
            fuse.close();
        }
    }
}

struct DdLayerView {
    shared: Arc<DdShared>,
    layer: usize,
}

impl StreamTrackerWorker for DdLayerView {
    fn start(&self) {
        self.shared.ensure_started();
    }

    fn stop(&self) {
        // the shared worker keeps running for the other layers
        let mut state = self.shared.state.lock();
        state.active[self.layer] = false;
        state.last_seen[self.layer] = None;
    }

    fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.active[self.layer] = false;
        state.last_seen[self.layer] = None;
        state.bitrate_available[self.layer] = false;
        state.bytes[self.layer] = [0; TEMPORAL_LAYERS];
        state.bitrates[self.layer] = [0; TEMPORAL_LAYERS];
    }

    fn set_paused(&self, paused: bool) {
        self.shared.state.lock().paused = paused;
    }

    fn on_status_changed(&self, f: OnStatusChanged) {
        self.shared.callbacks.lock()[self.layer].on_status_changed = Some(f);
    }

    fn on_bitrate_available(&self, f: OnBitrateAvailable) {
        self.shared.callbacks.lock()[self.layer].on_bitrate_available = Some(f);
    }

    fn observe(
        &self,
        temporal: i32,
        pkt_size: usize,
        payload_size: usize,
        _marker: bool,
        _timestamp: u32,
    ) {
        let became_active = {
            let mut state = self.shared.state.lock();
            if state.paused {
                return;
            }

            let t = temporal.clamp(0, DEFAULT_MAX_LAYER_TEMPORAL) as usize;
            state.bytes[self.layer][t] += pkt_size as i64;
            state.last_seen[self.layer] = Some(Instant::now());

            if !state.active[self.layer] && payload_size > 0 {
                state.active[self.layer] = true;
                true
            } else {
                false
            }
        };

        if became_active {
            self.shared.fire_status(self.layer, StreamStatus::Active);
        }
    }

    fn bitrate_temporal_cumulative(&self) -> Vec<i64> {
        let state = self.shared.state.lock();
        let mut cumulative = vec![0i64; TEMPORAL_LAYERS];
        let mut sum = 0i64;
        for (t, out) in cumulative.iter_mut().enumerate() {
            sum += state.bitrates[self.layer][t];
            *out = sum;
        }
        cumulative
    }
}
