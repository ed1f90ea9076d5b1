//! Aggregation of per-layer trackers into track-level layer state.
//!
//! The manager owns one worker per spatial layer, maintains the sorted
//! set of available layers, remembers the highest published layer and
//! temporal layer seen, relates the layers' RTP timelines through their
//! sender reports, and runs the once-a-second bitrate reporter.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};
use parking_lot::RwLock;

use buffer::{
    Bitrates, RtcpSenderReportData, VideoLayer, DEFAULT_MAX_LAYER_SPATIAL,
    DEFAULT_MAX_LAYER_TEMPORAL, INVALID_LAYER, INVALID_LAYER_SPATIAL, INVALID_LAYER_TEMPORAL,
};
use utils::Fuse;

use crate::config::{StreamTrackerConfig, StreamTrackerType};
use crate::error::{Error, Result};
use crate::stream_tracker::{
    StreamStatus, StreamTracker, StreamTrackerDependencyDescriptor, StreamTrackerFrame,
    StreamTrackerKind, StreamTrackerPacket, StreamTrackerParams, StreamTrackerWorker,
};

const SPATIAL_LAYERS: usize = DEFAULT_MAX_LAYER_SPATIAL as usize + 1;

/// Sender reports further apart than this are not related to each other.
const SENDER_REPORT_THRESHOLD: Duration = Duration::from_secs(60);
/// Sender report pairs must span at least this long before a clock rate
/// is derived from them.
const MIN_DURATION_FOR_CLOCK_RATE: Duration = Duration::from_secs(15);

/// Events the manager raises towards the receiver. Callbacks are invoked
/// outside the manager's locks.
pub trait StreamTrackerManagerListener: Send + Sync {
    fn on_available_layers_changed(&self);
    fn on_bitrate_availability_changed(&self);
    fn on_max_published_layer_changed(&self, max_published_layer: i32);
    fn on_max_temporal_layer_seen_changed(&self, max_temporal_layer_seen: i32);
    fn on_max_available_layer_changed(&self, max_available_layer: i32);
    fn on_bitrate_report(&self, available_layers: &[i32], bitrates: Bitrates);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Unknown,
    Camera,
    Screenshare,
}

/// Shape of the published track as signalled by the client.
#[derive(Debug, Clone)]
pub struct TrackParams {
    pub kind: TrackKind,
    pub source: TrackSource,
    /// Spatial layers the publisher intends to send.
    pub published_layers: Vec<i32>,
}

#[derive(Default)]
struct EndsSenderReport {
    first: Option<RtcpSenderReportData>,
    newest: Option<RtcpSenderReportData>,
    last_updated: Option<Instant>,
}

#[derive(Default)]
struct SenderReportState {
    reports: [EndsSenderReport; SPATIAL_LAYERS],
    layer_offsets: [[u32; SPATIAL_LAYERS]; SPATIAL_LAYERS],
}

struct ManagerState {
    max_published_layer: i32,
    max_temporal_layer_seen: i32,

    dd_tracker: Option<Arc<StreamTrackerDependencyDescriptor>>,
    trackers: [Option<Arc<dyn StreamTrackerWorker>>; SPATIAL_LAYERS],

    available_layers: Vec<i32>,
    max_expected_layer: i32,
    paused: bool,
}

pub struct StreamTrackerManager {
    is_svc: bool,
    clock_rate: u32,
    track_params: TrackParams,
    tracker_config: StreamTrackerConfig,

    state: RwLock<ManagerState>,

    // kept off the packet hot path behind its own lock
    sender_reports: RwLock<SenderReportState>,

    closed: Fuse,

    listener: RwLock<Option<Weak<dyn StreamTrackerManagerListener>>>,
}

impl StreamTrackerManager {
    pub fn new(
        track_params: TrackParams,
        is_svc: bool,
        clock_rate: u32,
        tracker_config: StreamTrackerConfig,
    ) -> Arc<Self> {
        let max_expected_layer = Self::max_expected_layer_from_params(&track_params);

        let manager = Arc::new(Self {
            is_svc,
            clock_rate,
            track_params,
            tracker_config,
            state: RwLock::new(ManagerState {
                max_published_layer: INVALID_LAYER_SPATIAL,
                max_temporal_layer_seen: INVALID_LAYER_TEMPORAL,
                dd_tracker: None,
                trackers: Default::default(),
                available_layers: Vec::new(),
                max_expected_layer,
                paused: false,
            }),
            sender_reports: RwLock::new(SenderReportState::default()),
            closed: Fuse::new(),
            listener: RwLock::new(None),
        });

        if manager.track_params.kind == TrackKind::Video {
            let reporter = Arc::clone(&manager);
            let builder = thread::Builder::new().name("bitrate-reporter".to_owned());
            if let Err(err) = builder.spawn(move || reporter.bitrate_reporter()) {
                error!("failed to spawn bitrate reporter: {err}");
            }
        }

        manager
    }

    pub fn close(&self) {
        self.closed.close();
    }

    pub fn set_listener(&self, listener: Weak<dyn StreamTrackerManagerListener>) {
        *self.listener.write() = Some(listener);
    }

    fn get_listener(&self) -> Option<Arc<dyn StreamTrackerManagerListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    fn max_expected_layer_from_params(params: &TrackParams) -> i32 {
        params
            .published_layers
            .iter()
            .copied()
            .max()
            .unwrap_or(INVALID_LAYER_SPATIAL)
    }

    fn create_tracker_impl(&self, layer: i32) -> Option<StreamTrackerKind> {
        match self.tracker_config.tracker_type {
            StreamTrackerType::Packet => self
                .tracker_config
                .packet_tracker
                .get(&layer)
                .map(|config| StreamTrackerKind::Packet(StreamTrackerPacket::new(*config))),
            StreamTrackerType::Frame => self
                .tracker_config
                .frame_tracker
                .get(&layer)
                .map(|config| StreamTrackerKind::Frame(StreamTrackerFrame::new(*config))),
        }
    }

    /// Constructs the shared dependency descriptor tracker and registers
    /// a view for every spatial layer.
    pub fn add_dependency_descriptor_trackers(self: &Arc<Self>) {
        let bitrate_interval = match self.tracker_config.bitrate_report_interval(0) {
            Some(interval) => interval,
            None => return,
        };

        let add_all = {
            let mut state = self.state.write();
            if state.dd_tracker.is_none() {
                state.dd_tracker = Some(Arc::new(StreamTrackerDependencyDescriptor::new(
                    bitrate_interval,
                )));
                true
            } else {
                false
            }
        };

        if add_all {
            for layer in 0..=DEFAULT_MAX_LAYER_SPATIAL {
                self.add_tracker(layer);
            }
        }
    }

    /// Creates and starts the worker for a layer. Raises
    /// `on_max_published_layer_changed` when the layer is a new maximum.
    pub fn add_tracker(self: &Arc<Self>, layer: i32) -> Option<Arc<dyn StreamTrackerWorker>> {
        if !(0..SPATIAL_LAYERS as i32).contains(&layer) {
            return None;
        }
        let bitrate_report_interval = self.tracker_config.bitrate_report_interval(layer)?;

        let dd_view = {
            let state = self.state.read();
            state
                .dd_tracker
                .as_ref()
                .map(|dd| dd.layered_tracker(layer))
        };

        let tracker: Arc<dyn StreamTrackerWorker> = match dd_view {
            Some(view) => view,
            None => {
                let kind = self.create_tracker_impl(layer)?;
                Arc::new(StreamTracker::new(StreamTrackerParams {
                    kind,
                    bitrate_report_interval,
                }))
            }
        };

        debug!("stream tracker manager adding tracker, layer: {layer}");
        {
            let status_manager = Arc::downgrade(self);
            tracker.on_status_changed(Box::new(move |status| {
                if let Some(manager) = status_manager.upgrade() {
                    debug!("stream tracker status changed, layer: {layer}, status: {status:?}");
                    if status == StreamStatus::Stopped {
                        manager.remove_available_layer(layer);
                    } else {
                        manager.add_available_layer(layer);
                    }
                }
            }));

            let bitrate_manager = Arc::downgrade(self);
            tracker.on_bitrate_available(Box::new(move || {
                if let Some(manager) = bitrate_manager.upgrade() {
                    if let Some(listener) = manager.get_listener() {
                        listener.on_bitrate_availability_changed();
                    }
                }
            }));
        }

        let (paused, notify) = {
            let mut state = self.state.write();
            let paused = state.paused;
            state.trackers[layer as usize] = Some(Arc::clone(&tracker));

            let notify = if layer > state.max_published_layer {
                state.max_published_layer = layer;
                true
            } else {
                false
            };
            (paused, notify)
        };

        if notify {
            if let Some(listener) = self.get_listener() {
                listener.on_max_published_layer_changed(layer);
            }
        }

        tracker.set_paused(paused);
        tracker.start();
        Some(tracker)
    }

    pub fn remove_tracker(&self, layer: i32) {
        if !(0..SPATIAL_LAYERS as i32).contains(&layer) {
            return;
        }

        let tracker = self.state.write().trackers[layer as usize].take();
        if let Some(tracker) = tracker {
            tracker.stop();
        }
    }

    pub fn remove_all_trackers(&self) {
        let (trackers, dd_tracker) = {
            let mut state = self.state.write();
            let trackers = std::mem::take(&mut state.trackers);
            state.available_layers = Vec::new();
            state.max_expected_layer =
                Self::max_expected_layer_from_params(&self.track_params);
            state.paused = false;
            let dd_tracker = state.dd_tracker.take();
            (trackers, dd_tracker)
        };

        for tracker in trackers.into_iter().flatten() {
            tracker.stop();
        }
        if let Some(dd_tracker) = dd_tracker {
            dd_tracker.stop();
        }
    }

    pub fn get_tracker(&self, layer: i32) -> Option<Arc<dyn StreamTrackerWorker>> {
        if !(0..SPATIAL_LAYERS as i32).contains(&layer) {
            return None;
        }
        self.state.read().trackers[layer as usize].clone()
    }

    pub fn set_paused(&self, paused: bool) {
        let trackers = {
            let mut state = self.state.write();
            state.paused = paused;
            state.trackers.clone()
        };

        for tracker in trackers.into_iter().flatten() {
            tracker.set_paused(paused);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.read().paused
    }

    /// Stores the new expectation. When raising, trackers of layers that
    /// are not currently available are reset so they re-declare on their
    /// next packet.
    pub fn set_max_expected_spatial_layer(&self, layer: i32) -> i32 {
        let (prev, trackers_to_reset) = {
            let mut state = self.state.write();
            let prev = state.max_expected_layer;
            if layer <= prev {
                // some higher layers expected to stop, nothing else to do
                state.max_expected_layer = layer;
                return prev;
            }

            let mut trackers_to_reset = Vec::new();
            for l in (prev + 1)..=layer {
                if (0..SPATIAL_LAYERS as i32).contains(&l)
                    && !state.available_layers.contains(&l)
                {
                    if let Some(tracker) = &state.trackers[l as usize] {
                        trackers_to_reset.push(Arc::clone(tracker));
                    }
                }
            }
            state.max_expected_layer = layer;
            (prev, trackers_to_reset)
        };

        for tracker in trackers_to_reset {
            tracker.reset();
        }

        prev
    }

    pub fn get_max_published_layer(&self) -> i32 {
        self.state.read().max_published_layer
    }

    pub fn get_max_temporal_layer_seen(&self) -> i32 {
        self.state.read().max_temporal_layer_seen
    }

    /// How far the best known layer is from the best expected layer, in
    /// temporal layer steps normalized by the temporal layer count.
    pub fn distance_to_desired(&self) -> f64 {
        let state = self.state.read();

        if state.paused || state.max_expected_layer < 0 || state.max_temporal_layer_seen < 0 {
            return 0.0;
        }

        let (available_layers, bitrates) = self.layered_bitrate_locked(&state);

        let mut max_layer = INVALID_LAYER;
        'done: for s in (0..bitrates.len()).rev() {
            for t in (0..bitrates[0].len()).rev() {
                if bitrates[s][t] != 0 {
                    max_layer = VideoLayer {
                        spatial: s as i32,
                        temporal: t as i32,
                    };
                    break 'done;
                }
            }
        }

        // before bitrate measurement is available, a tracker could have
        // declared the layer seen; account for that
        for layer in &available_layers {
            if *layer > max_layer.spatial {
                max_layer.spatial = *layer;
                max_layer.temporal = state.max_temporal_layer_seen;
            }
        }

        let adjusted_max_layer = if max_layer.is_valid() {
            max_layer
        } else {
            VideoLayer {
                spatial: 0,
                temporal: 0,
            }
        };

        let mut distance = (state.max_expected_layer - adjusted_max_layer.spatial)
            * (state.max_temporal_layer_seen + 1)
            + (state.max_temporal_layer_seen - adjusted_max_layer.temporal);
        if !max_layer.is_valid() {
            distance += 1;
        }

        distance as f64 / (state.max_temporal_layer_seen + 1) as f64
    }

    pub fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates) {
        let state = self.state.read();
        self.layered_bitrate_locked(&state)
    }

    fn layered_bitrate_locked(&self, state: &ManagerState) -> (Vec<i32>, Bitrates) {
        let mut bitrates = Bitrates::default();

        for (i, tracker) in state.trackers.iter().enumerate() {
            if let Some(tracker) = tracker {
                if state.available_layers.contains(&(i as i32)) {
                    let tls = tracker.bitrate_temporal_cumulative();
                    for (j, bitrate) in bitrates[i].iter_mut().enumerate() {
                        *bitrate = tls.get(j).copied().unwrap_or(0);
                    }
                }
            }
        }

        // accumulate bitrates for SVC streams without a dependency
        // descriptor tracker
        if self.is_svc && state.dd_tracker.is_none() {
            for i in (1..bitrates.len()).rev() {
                for j in (0..bitrates[i].len()).rev() {
                    if bitrates[i][j] != 0 {
                        for k in (0..i).rev() {
                            bitrates[i][j] += bitrates[k][j];
                        }
                    }
                }
            }
        }

        (state.available_layers.clone(), bitrates)
    }

    fn add_available_layer(&self, layer: i32) {
        let (is_max_layer_change, notify) = {
            let mut state = self.state.write();
            if state.available_layers.contains(&layer) {
                (false, false)
            } else {
                state.available_layers.push(layer);
                state.available_layers.sort_unstable();

                let is_max = *state.available_layers.last().unwrap_or(&layer) == layer;
                debug!(
                    "available layers changed - layer seen, added: {}, available: {:?}",
                    layer, state.available_layers,
                );
                (is_max, true)
            }
        };

        if !notify {
            return;
        }
        if let Some(listener) = self.get_listener() {
            listener.on_available_layers_changed();

            if is_max_layer_change {
                listener.on_max_available_layer_changed(layer);
            }
        }
    }

    fn remove_available_layer(&self, layer: i32) {
        let (prev_max, cur_max) = {
            let mut state = self.state.write();
            let prev_max = state
                .available_layers
                .last()
                .copied()
                .unwrap_or(INVALID_LAYER_SPATIAL);

            state.available_layers.retain(|l| *l != layer);
            let cur_max = state
                .available_layers
                .last()
                .copied()
                .unwrap_or(INVALID_LAYER_SPATIAL);

            debug!(
                "available layers changed - layer gone, removed: {}, available: {:?}",
                layer, state.available_layers,
            );
            (prev_max, cur_max)
        };

        // switch off unavailable layers immediately
        if let Some(listener) = self.get_listener() {
            listener.on_available_layers_changed();

            if cur_max != prev_max {
                listener.on_max_available_layer_changed(cur_max);
            }
        }
    }

    fn update_layer_offset_locked(
        &self,
        sender_reports: &mut SenderReportState,
        reference: i32,
        other: i32,
    ) {
        let sr_ref = match &sender_reports.reports[reference as usize].newest {
            Some(sr) if !sr.ntp_timestamp.is_zero() => *sr,
            _ => return,
        };
        let sr_other = match &sender_reports.reports[other as usize].newest {
            Some(sr) if !sr.ntp_timestamp.is_zero() => *sr,
            _ => return,
        };

        let ntp_diff = sr_ref.ntp_timestamp.seconds_since(sr_other.ntp_timestamp);
        if ntp_diff.abs() > SENDER_REPORT_THRESHOLD.as_secs_f64() {
            // Higher layers can be paused for long stretches due to
            // adaptive stream or publisher constraints. Do not relate
            // reports that far apart.
            return;
        }
        let rtp_diff = (ntp_diff * self.clock_rate as f64) as i64;

        // the other layer's timestamp at the same instant as the
        // reference layer's NTP time
        let normalized_other_ts = sr_other.rtp_timestamp.wrapping_add(rtp_diff as u32);

        // both timestamps now refer to the same instant, the difference
        // is the inter-layer offset
        let mut offset = sr_ref.rtp_timestamp.wrapping_sub(normalized_other_ts);

        // a zero offset would read as "unavailable"; use the minimal
        // offset as an availability marker in that unlikely case
        if offset == 0 {
            debug!(
                "using default offset, reference: {}, other: {}, ref rtp: {}, other rtp: {}",
                reference, other, sr_ref.rtp_timestamp, sr_other.rtp_timestamp,
            );
            offset = 1;
        }

        sender_reports.layer_offsets[reference as usize][other as usize] = offset;
    }

    /// Stores a layer's sender report ends and refreshes the inter-layer
    /// offsets involving that layer, in both directions.
    pub fn set_rtcp_sender_report_data(
        &self,
        layer: i32,
        sr_first: Option<RtcpSenderReportData>,
        sr_newest: Option<RtcpSenderReportData>,
    ) {
        if !(0..SPATIAL_LAYERS as i32).contains(&layer) {
            return;
        }

        let mut sender_reports = self.sender_reports.write();
        sender_reports.reports[layer as usize] = EndsSenderReport {
            first: sr_first,
            newest: sr_newest,
            last_updated: Some(Instant::now()),
        };

        for i in 0..SPATIAL_LAYERS as i32 {
            if i == layer {
                continue;
            }

            // treating the reported layer as reference
            self.update_layer_offset_locked(&mut sender_reports, layer, i);

            // and the other way
            self.update_layer_offset_locked(&mut sender_reports, i, layer);
        }
    }

    /// Clock rate observed from the span between a layer's first and
    /// newest sender reports. Zero when the reports are missing, stale,
    /// or too close together.
    pub fn get_calculated_clock_rate(&self, layer: i32) -> u32 {
        if !(0..SPATIAL_LAYERS as i32).contains(&layer) {
            return 0;
        }

        let sender_reports = self.sender_reports.read();
        let ends = &sender_reports.reports[layer as usize];

        let (sr_first, sr_newest) = match (&ends.first, &ends.newest) {
            (Some(first), Some(newest))
                if !first.ntp_timestamp.is_zero()
                    && !newest.ntp_timestamp.is_zero()
                    && first.rtp_timestamp != newest.rtp_timestamp =>
            {
                (first, newest)
            }
            _ => return 0,
        };

        match ends.last_updated {
            Some(updated) if updated.elapsed() <= SENDER_REPORT_THRESHOLD => {}
            _ => return 0,
        }

        let span = sr_newest.ntp_timestamp.seconds_since(sr_first.ntp_timestamp);
        if span < MIN_DURATION_FOR_CLOCK_RATE.as_secs_f64() {
            // not enough time elapsed for a stable calculation
            return 0;
        }

        let ticks = sr_newest
            .rtp_timestamp_ext
            .wrapping_sub(sr_first.rtp_timestamp_ext);
        (ticks as f64 / span) as u32
    }

    /// Maps a timestamp on `layer` onto `reference_layer`'s timeline.
    pub fn get_reference_layer_rtp_timestamp(
        &self,
        ts: u32,
        layer: i32,
        reference_layer: i32,
    ) -> Result<u32> {
        if !(0..SPATIAL_LAYERS as i32).contains(&layer)
            || !(0..SPATIAL_LAYERS as i32).contains(&reference_layer)
        {
            return Err(Error::InvalidLayer {
                target: layer,
                reference: reference_layer,
            });
        }

        if self.is_svc {
            // there is only one stream in SVC
            return Ok(ts);
        }

        let sender_reports = self.sender_reports.read();
        let offset = sender_reports.layer_offsets[reference_layer as usize][layer as usize];
        if layer != reference_layer && offset == 0 {
            return Err(Error::OffsetUnavailable {
                target: layer,
                reference: reference_layer,
            });
        }

        Ok(ts.wrapping_add(offset))
    }

    fn update_max_temporal_layer_seen(&self, bitrates: &Bitrates) {
        let mut max_temporal_layer_seen = INVALID_LAYER_TEMPORAL;
        'done: for t in (0..=DEFAULT_MAX_LAYER_TEMPORAL as usize).rev() {
            for s in (0..bitrates.len()).rev() {
                if bitrates[s][t] != 0 {
                    max_temporal_layer_seen = t as i32;
                    break 'done;
                }
            }
        }

        {
            let mut state = self.state.write();
            if max_temporal_layer_seen <= state.max_temporal_layer_seen {
                return;
            }
            state.max_temporal_layer_seen = max_temporal_layer_seen;
        }

        if let Some(listener) = self.get_listener() {
            listener.on_max_temporal_layer_seen_changed(max_temporal_layer_seen);
        }
    }

    fn bitrate_reporter(&self) {
        while !self.closed.wait_timeout(Duration::from_secs(1)) {
            let (available_layers, bitrates) = self.get_layered_bitrate();
            self.update_max_temporal_layer_seen(&bitrates);

            if let Some(listener) = self.get_listener() {
                listener.on_bitrate_report(&available_layers, bitrates);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use utils::NtpTime;

    fn video_params() -> TrackParams {
        TrackParams {
            kind: TrackKind::Video,
            source: TrackSource::Camera,
            published_layers: vec![0, 1, 2],
        }
    }

    fn new_manager(is_svc: bool) -> Arc<StreamTrackerManager> {
        StreamTrackerManager::new(
            video_params(),
            is_svc,
            90000,
            StreamTrackerConfig::default(),
        )
    }

    fn sr(rtp: u32, ntp_seconds_offset: f64) -> RtcpSenderReportData {
        let base = NtpTime(3_900_000_000u64 << 32);
        RtcpSenderReportData {
            rtp_timestamp: rtp,
            rtp_timestamp_ext: rtp as u64,
            ntp_timestamp: base.add_duration(Duration::from_secs_f64(ntp_seconds_offset)),
            packet_count: 0,
            packet_count_ext: 0,
            padding_only_drops: 0,
            at: Instant::now(),
        }
    }

    #[test]
    fn test_layer_offsets_from_sender_reports() {
        let manager = new_manager(false);

        // layer 1's report is 200ms behind layer 0's
        let sr0 = sr(10_000_000, 0.2);
        let sr1 = sr(500_000, 0.0);
        manager.set_rtcp_sender_report_data(0, Some(sr0), Some(sr0));
        manager.set_rtcp_sender_report_data(1, Some(sr1), Some(sr1));

        // rtp_diff = 0.2s * 90000 = 18000 ticks
        let mapped = manager
            .get_reference_layer_rtp_timestamp(1000, 1, 0)
            .unwrap();
        let expected_offset = 10_000_000u32
            .wrapping_sub(500_000u32.wrapping_add(18_000));
        assert_eq!(mapped, 1000u32.wrapping_add(expected_offset));

        // same layer needs no offset
        assert_eq!(
            manager.get_reference_layer_rtp_timestamp(777, 0, 0).unwrap(),
            777,
        );

        // no reports for layer 2
        assert_eq!(
            manager.get_reference_layer_rtp_timestamp(1000, 2, 0),
            Err(Error::OffsetUnavailable {
                target: 2,
                reference: 0
            }),
        );

        assert_eq!(
            manager.get_reference_layer_rtp_timestamp(1000, 5, 0),
            Err(Error::InvalidLayer {
                target: 5,
                reference: 0
            }),
        );
        manager.close();
    }

    #[test]
    fn test_svc_timestamp_passthrough() {
        let manager = new_manager(true);
        assert_eq!(
            manager.get_reference_layer_rtp_timestamp(4242, 2, 0).unwrap(),
            4242,
        );
        manager.close();
    }

    #[test]
    fn test_stale_sender_reports_not_related() {
        let manager = new_manager(false);

        let sr0 = sr(10_000_000, 100.0);
        let sr1 = sr(500_000, 0.0); // 100s apart, past the 60s threshold
        manager.set_rtcp_sender_report_data(0, Some(sr0), Some(sr0));
        manager.set_rtcp_sender_report_data(1, Some(sr1), Some(sr1));

        assert!(manager
            .get_reference_layer_rtp_timestamp(1000, 1, 0)
            .is_err());
        manager.close();
    }

    #[test]
    fn test_calculated_clock_rate() {
        let manager = new_manager(false);

        // 20 seconds span at exactly 90kHz
        let first = sr(0, 0.0);
        let newest = sr(1_800_000, 20.0);
        manager.set_rtcp_sender_report_data(0, Some(first), Some(newest));
        assert_eq!(manager.get_calculated_clock_rate(0), 90000);

        // a span under 15s is not enough
        let first = sr(0, 0.0);
        let newest = sr(900_000, 10.0);
        manager.set_rtcp_sender_report_data(1, Some(first), Some(newest));
        assert_eq!(manager.get_calculated_clock_rate(1), 0);

        // missing layer
        assert_eq!(manager.get_calculated_clock_rate(2), 0);
        assert_eq!(manager.get_calculated_clock_rate(-1), 0);
        manager.close();
    }

    #[test]
    fn test_available_layers_sorted_and_events() {
        let manager = new_manager(false);

        manager.add_available_layer(2);
        manager.add_available_layer(0);
        manager.add_available_layer(1);
        manager.add_available_layer(1); // duplicate ignored

        {
            let state = manager.state.read();
            assert_eq!(state.available_layers, vec![0, 1, 2]);
        }

        manager.remove_available_layer(1);
        {
            let state = manager.state.read();
            assert_eq!(state.available_layers, vec![0, 2]);
        }
        manager.close();
    }

    #[test]
    fn test_distance_to_desired() {
        let manager = new_manager(false);

        // nothing seen yet
        assert_eq!(manager.distance_to_desired(), 0.0);

        {
            let mut state = manager.state.write();
            state.max_expected_layer = 2;
            state.max_temporal_layer_seen = 3;
        }

        // no layers available: adjusted to (0, 0) plus one
        let d = manager.distance_to_desired();
        assert!((d - (((2 - 0) * 4 + (3 - 0) + 1) as f64 / 4.0)).abs() < 1e-9);

        // a tracker-declared layer without bitrate counts as (layer,
        // max temporal seen)
        manager.add_available_layer(2);
        assert_eq!(manager.distance_to_desired(), 0.0);

        // paused is always distance zero
        {
            manager.state.write().paused = true;
        }
        assert_eq!(manager.distance_to_desired(), 0.0);
        manager.close();
    }

    #[test]
    fn test_max_expected_layer_raising_resets_unavailable() {
        let manager = new_manager(false);

        let prev = manager.set_max_expected_spatial_layer(1);
        assert_eq!(prev, 2);
        // lowering stored
        assert_eq!(manager.state.read().max_expected_layer, 1);

        let prev = manager.set_max_expected_spatial_layer(2);
        assert_eq!(prev, 1);
        assert_eq!(manager.state.read().max_expected_layer, 2);
        manager.close();
    }

    #[test]
    fn test_add_tracker_updates_max_published() {
        let manager = new_manager(false);

        assert_eq!(manager.get_max_published_layer(), INVALID_LAYER_SPATIAL);
        let tracker = manager.add_tracker(1);
        assert!(tracker.is_some());
        assert_eq!(manager.get_max_published_layer(), 1);

        manager.add_tracker(0);
        assert_eq!(manager.get_max_published_layer(), 1);

        // no config for out of range layers
        assert!(manager.add_tracker(5).is_none());

        manager.remove_all_trackers();
        assert!(manager.get_tracker(1).is_none());
        manager.close();
    }

    #[test]
    fn test_svc_bitrate_accumulation() {
        let manager = new_manager(true);
        manager.add_tracker(0);
        manager.add_tracker(1);
        manager.add_available_layer(0);
        manager.add_available_layer(1);

        // drive packets straight into the workers
        for _ in 0..100 {
            if let Some(t) = manager.get_tracker(0) {
                t.observe(0, 1000, 990, false, 1);
            }
            if let Some(t) = manager.get_tracker(1) {
                t.observe(0, 3000, 2990, false, 1);
            }
        }
        // wait for a bitrate interval to elapse
        std::thread::sleep(Duration::from_millis(1300));

        let (layers, bitrates) = manager.get_layered_bitrate();
        assert_eq!(layers, vec![0, 1]);
        if bitrates[0][0] != 0 && bitrates[1][0] != 0 {
            // higher SVC layer includes the lower one
            assert!(bitrates[1][0] > bitrates[0][0]);
        }
        manager.close();
    }
}
