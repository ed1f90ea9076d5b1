//! Per-layer stream liveness and bitrate tracking.
//!
//! Each spatial layer of a published track gets a worker that decides
//! whether the layer is currently live and measures its bitrate per
//! temporal layer. Detection comes in three kinds: packet-count based,
//! frame-rate based, and dependency-descriptor driven (one shared tracker
//! vending per-layer views). The manager aggregates workers into the set
//! of available layers and the events subscribers react to.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::error;
use parking_lot::Mutex;

use buffer::DEFAULT_MAX_LAYER_TEMPORAL;
use utils::Fuse;

pub mod dependency_descriptor;
pub mod frame;
pub mod manager;
pub mod packet;

pub use dependency_descriptor::StreamTrackerDependencyDescriptor;
pub use frame::StreamTrackerFrame;
pub use manager::{StreamTrackerManager, StreamTrackerManagerListener, TrackKind, TrackParams, TrackSource};
pub use packet::StreamTrackerPacket;

const TEMPORAL_LAYERS: usize = DEFAULT_MAX_LAYER_TEMPORAL as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Stopped,
    Active,
}

pub type OnStatusChanged = Box<dyn Fn(StreamStatus) + Send + Sync>;
pub type OnBitrateAvailable = Box<dyn Fn() + Send + Sync>;

/// Common surface of the per-layer workers the manager drives.
pub trait StreamTrackerWorker: Send + Sync {
    fn start(&self);
    fn stop(&self);
    /// Clears detection state so the layer re-declares itself on its next
    /// packet.
    fn reset(&self);
    fn set_paused(&self, paused: bool);
    fn on_status_changed(&self, f: OnStatusChanged);
    fn on_bitrate_available(&self, f: OnBitrateAvailable);
    fn observe(
        &self,
        temporal: i32,
        pkt_size: usize,
        payload_size: usize,
        marker: bool,
        timestamp: u32,
    );
    /// Bitrate per temporal layer, cumulative: index t includes all
    /// temporal layers up to and including t.
    fn bitrate_temporal_cumulative(&self) -> Vec<i64>;
}

/// Detection variants driven by the generic worker.
pub enum StreamTrackerKind {
    Packet(StreamTrackerPacket),
    Frame(StreamTrackerFrame),
}

impl StreamTrackerKind {
    fn cycle_duration(&self) -> Duration {
        match self {
            StreamTrackerKind::Packet(t) => t.cycle_duration(),
            StreamTrackerKind::Frame(t) => t.cycle_duration(),
        }
    }

    /// Per-packet observation; may propose an immediate transition to
    /// `Active`.
    fn observe(
        &mut self,
        temporal: i32,
        pkt_size: usize,
        payload_size: usize,
        marker: bool,
        timestamp: u32,
    ) -> Option<StreamStatus> {
        match self {
            StreamTrackerKind::Packet(t) => t.observe(temporal, pkt_size, payload_size, marker),
            StreamTrackerKind::Frame(t) => t.observe(marker, timestamp),
        }
    }

    /// Per-cycle evaluation; may propose a transition.
    fn check_status(&mut self) -> Option<StreamStatus> {
        match self {
            StreamTrackerKind::Packet(t) => t.check_status(),
            StreamTrackerKind::Frame(t) => t.check_status(),
        }
    }

    fn reset(&mut self) {
        match self {
            StreamTrackerKind::Packet(t) => t.reset(),
            StreamTrackerKind::Frame(t) => t.reset(),
        }
    }
}

pub struct StreamTrackerParams {
    pub kind: StreamTrackerKind,
    pub bitrate_report_interval: Duration,
}

struct TrackerState {
    kind: StreamTrackerKind,
    status: StreamStatus,
    paused: bool,
    bytes: [i64; TEMPORAL_LAYERS],
    bitrates: [i64; TEMPORAL_LAYERS],
    bitrate_available: bool,
    fuse: Option<Fuse>,
}

struct TrackerShared {
    bitrate_report_interval: Duration,
    state: Mutex<TrackerState>,
    on_status_changed: Mutex<Option<OnStatusChanged>>,
    on_bitrate_available: Mutex<Option<OnBitrateAvailable>>,
}

impl TrackerShared {
    fn fire_status(&self, status: StreamStatus) {
        let cb = self.on_status_changed.lock();
        if let Some(cb) = cb.as_ref() {
            cb(status);
        }
    }

    fn fire_bitrate_available(&self) {
        let cb = self.on_bitrate_available.lock();
        if let Some(cb) = cb.as_ref() {
            cb();
        }
    }
}

/// Generic liveness/bitrate worker around one detection kind.
pub struct StreamTracker {
    shared: Arc<TrackerShared>,
}

impl StreamTracker {
    pub fn new(params: StreamTrackerParams) -> Self {
        Self {
            shared: Arc::new(TrackerShared {
                bitrate_report_interval: params.bitrate_report_interval,
                state: Mutex::new(TrackerState {
                    kind: params.kind,
                    status: StreamStatus::Stopped,
                    paused: false,
                    bytes: [0; TEMPORAL_LAYERS],
                    bitrates: [0; TEMPORAL_LAYERS],
                    bitrate_available: false,
                    fuse: None,
                }),
                on_status_changed: Mutex::new(None),
                on_bitrate_available: Mutex::new(None),
            }),
        }
    }

    fn worker(shared: Arc<TrackerShared>, fuse: Fuse) {
        let mut since_bitrate = Duration::ZERO;
        loop {
            let cycle = shared.state.lock().kind.cycle_duration();
            if fuse.wait_timeout(cycle) {
                return;
            }
            since_bitrate += cycle;

            let mut status_change = None;
            let mut bitrate_event = false;
            {
                let mut state = shared.state.lock();
                if state.paused {
                    continue;
                }

                if let Some(proposed) = state.kind.check_status() {
                    if proposed != state.status {
                        state.status = proposed;
                        status_change = Some(proposed);
                    }
                }

                if since_bitrate >= shared.bitrate_report_interval {
                    let secs = since_bitrate.as_secs_f64();
                    for t in 0..TEMPORAL_LAYERS {
                        state.bitrates[t] = (state.bytes[t] as f64 * 8.0 / secs) as i64;
                        state.bytes[t] = 0;
                    }
                    since_bitrate = Duration::ZERO;

                    if !state.bitrate_available && state.bitrates.iter().any(|b| *b != 0) {
                        state.bitrate_available = true;
                        bitrate_event = true;
                    }
                }
            }

            // callbacks run without holding the state lock
            if let Some(status) = status_change {
                shared.fire_status(status);
            }
            if bitrate_event {
                shared.fire_bitrate_available();
            }
        }
    }
}

impl StreamTrackerWorker for StreamTracker {
    fn start(&self) {
        let fuse = {
            let mut state = self.shared.state.lock();
            if state.fuse.is_some() {
                return;
            }
            let fuse = Fuse::new();
            state.fuse = Some(fuse.clone());
            fuse
        };

        let shared = Arc::clone(&self.shared);
        let builder = thread::Builder::new().name("stream-tracker".to_owned());
        if let Err(err) = builder.spawn(move || StreamTracker::worker(shared, fuse)) {
            error!("failed to spawn stream tracker worker: {err}");
        }
    }

    fn stop(&self) {
        let fuse = self.shared.state.lock().fuse.take();
        if let Some(fuse) = fuse {
            fuse.close();
        }
    }

    fn reset(&self) {
        let mut state = self.shared.state.lock();
        state.kind.reset();
        state.status = StreamStatus::Stopped;
        state.bytes = [0; TEMPORAL_LAYERS];
        state.bitrates = [0; TEMPORAL_LAYERS];
        state.bitrate_available = false;
    }

    fn set_paused(&self, paused: bool) {
        self.shared.state.lock().paused = paused;
    }

    fn on_status_changed(&self, f: OnStatusChanged) {
        *self.shared.on_status_changed.lock() = Some(f);
    }

    fn on_bitrate_available(&self, f: OnBitrateAvailable) {
        *self.shared.on_bitrate_available.lock() = Some(f);
    }

    fn observe(
        &self,
        temporal: i32,
        pkt_size: usize,
        payload_size: usize,
        marker: bool,
        timestamp: u32,
    ) {
        let transition = {
            let mut state = self.shared.state.lock();
            if state.paused {
                return;
            }

            let t = temporal.clamp(0, DEFAULT_MAX_LAYER_TEMPORAL) as usize;
            state.bytes[t] += pkt_size as i64;

            match state
                .kind
                .observe(temporal, pkt_size, payload_size, marker, timestamp)
            {
                Some(proposed) if proposed != state.status => {
                    state.status = proposed;
                    Some(proposed)
                }
                _ => None,
            }
        };

        if let Some(status) = transition {
            self.shared.fire_status(status);
        }
    }

    fn bitrate_temporal_cumulative(&self) -> Vec<i64> {
        let state = self.shared.state.lock();
        let mut cumulative = vec![0i64; TEMPORAL_LAYERS];
        let mut sum = 0i64;
        for (t, out) in cumulative.iter_mut().enumerate() {
            sum += state.bitrates[t];
            *out = sum;
        }
        cumulative
    }
}
