//! The per-track receiver: owns the per-layer buffers, fans packets out
//! to subscribers, and surfaces layer state to the forwarding side.
//!
//! One `Receiver` exists per published track. The transport pushes parsed
//! packets into the track's [`Buffer`]s; a forward thread per layer reads
//! extended packets back out and broadcasts them to the down tracks. The
//! stream tracker manager tells subscribers which layers are alive and
//! how fat they are; its listener callbacks land back here and fan out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Once, Weak};
use std::thread;

use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use buffer::{
    aggregate_rtp_stats, AudioLevelParams, Bitrates, Buffer, ExtPacket, RtcpPackets,
    RtcpSenderReportData, RtpDeltaInfo, RtpStatsSummary, DEFAULT_MAX_LAYER_SPATIAL,
};

use crate::config::{AudioConfig, PliThrottleConfig, StreamTrackerConfig};
use crate::error::{Error, Result};
use crate::spreader::DownTrackSpreader;
use crate::stream_tracker::{
    StreamTrackerManager, StreamTrackerManagerListener, TrackKind, TrackParams,
};

const SPATIAL_LAYERS: usize = DEFAULT_MAX_LAYER_SPATIAL as usize + 1;

pub type TrackId = String;
pub type SubscriberId = String;

/// Downstream sink for one subscriber of this track.
pub trait TrackSender: Send + Sync {
    fn subscriber_id(&self) -> SubscriberId;
    fn write_rtp(&self, pkt: &ExtPacket, spatial_layer: i32);
    fn up_track_layers_changed(&self);
    fn up_track_bitrate_availability_changed(&self);
    fn up_track_max_published_layer_changed(&self, max_published_layer: i32);
    fn up_track_max_temporal_layer_seen_changed(&self, max_temporal_layer_seen: i32);
    fn up_track_bitrate_report(&self, available_layers: &[i32], bitrates: Bitrates);
    fn handle_rtcp_sender_report_data(&self, layer: i32, sr: RtcpSenderReportData);
    fn close(&self);
}

/// Capability subscribers and the forwarder hold on a published track.
pub trait TrackReceiver: Send + Sync {
    fn track_id(&self) -> TrackId;
    fn stream_id(&self) -> String;
    fn is_closed(&self) -> bool;

    /// Copies the raw packet with sequence number `sn` of `layer` into
    /// `buf`, for NACK answering.
    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize>;
    fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates);

    fn get_audio_level(&self) -> Option<(f64, bool)>;

    fn send_pli(&self, layer: i32, force: bool);

    fn set_up_track_paused(&self, paused: bool);
    fn set_max_expected_spatial_layer(&self, layer: i32);

    fn add_down_track(&self, track: Arc<dyn TrackSender>) -> Result<()>;
    fn delete_down_track(&self, subscriber_id: &SubscriberId);

    fn get_calculated_clock_rate(&self, layer: i32) -> u32;
    fn get_reference_layer_rtp_timestamp(
        &self,
        ets: u64,
        layer: i32,
        reference_layer: i32,
    ) -> Result<u64>;
}

#[derive(Clone)]
pub struct ReceiverParams {
    pub track_id: TrackId,
    pub stream_id: String,
    pub track: TrackParams,
    pub is_svc: bool,
    /// The stream signals layer structure through dependency descriptors.
    pub has_dependency_descriptor: bool,
    pub clock_rate: u32,
    /// Down-track count at which broadcast goes parallel; 0 disables.
    pub lb_threshold: usize,
    pub use_trackers: bool,
    pub pli_throttle: PliThrottleConfig,
    pub audio: AudioConfig,
    pub audio_level_extension_id: u8,
    pub trackers: StreamTrackerConfig,
}

/// Receives one published media track.
pub struct Receiver {
    params: ReceiverParams,

    closed: AtomicBool,
    close_once: Once,

    buffers: RwLock<[Option<Arc<Buffer>>; SPATIAL_LAYERS]>,
    ssrcs: RwLock<[u32; SPATIAL_LAYERS]>,
    rtt: AtomicU32,

    rtcp_tx: Mutex<Option<SyncSender<RtcpPackets>>>,

    stream_tracker_manager: Arc<StreamTrackerManager>,
    down_track_spreader: DownTrackSpreader,

    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    on_max_layer_changed: Mutex<Option<Box<dyn Fn(i32) + Send + Sync>>>,
}

impl Receiver {
    pub fn new(params: ReceiverParams) -> Arc<Self> {
        let stream_tracker_manager = StreamTrackerManager::new(
            params.track.clone(),
            params.is_svc,
            params.clock_rate,
            params.trackers.clone(),
        );

        let receiver = Arc::new(Self {
            down_track_spreader: DownTrackSpreader::new(params.lb_threshold),
            stream_tracker_manager: Arc::clone(&stream_tracker_manager),
            closed: AtomicBool::new(false),
            close_once: Once::new(),
            buffers: RwLock::new(Default::default()),
            ssrcs: RwLock::new([0; SPATIAL_LAYERS]),
            rtt: AtomicU32::new(0),
            rtcp_tx: Mutex::new(None),
            on_close: Mutex::new(None),
            on_max_layer_changed: Mutex::new(None),
            params,
        });

        let receiver_weak: Weak<Receiver> = Arc::downgrade(&receiver);
        let listener: Weak<dyn StreamTrackerManagerListener> = receiver_weak;
        stream_tracker_manager.set_listener(listener);

        if receiver.params.is_svc && receiver.params.has_dependency_descriptor {
            receiver
                .stream_tracker_manager
                .add_dependency_descriptor_trackers();
        }

        receiver
    }

    pub fn on_close(&self, f: Box<dyn FnOnce() + Send>) {
        *self.on_close.lock() = Some(f);
    }

    pub fn on_max_layer_changed(&self, f: Box<dyn Fn(i32) + Send + Sync>) {
        *self.on_max_layer_changed.lock() = Some(f);
    }

    /// Where RTCP feedback (NACK/PLI) for the publisher goes. Sends never
    /// block; packets are dropped with a warning when the channel is
    /// full.
    pub fn set_rtcp_channel(&self, tx: SyncSender<RtcpPackets>) {
        *self.rtcp_tx.lock() = Some(tx);
    }

    pub fn ssrc(&self, layer: usize) -> u32 {
        if layer >= SPATIAL_LAYERS {
            return 0;
        }
        self.ssrcs.read()[layer]
    }

    pub fn set_rtt(&self, rtt: u32) {
        if self.rtt.swap(rtt, Ordering::AcqRel) == rtt {
            return;
        }

        let buffers = self.buffers.read().clone();
        for buffer in buffers.into_iter().flatten() {
            buffer.set_rtt(rtt);
        }
    }

    /// Registers one layer of the publisher's stream and starts its
    /// forward loop.
    pub fn add_up_track(self: &Arc<Self>, layer: i32, ssrc: u32, buffer: Arc<Buffer>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let layer = if self.params.track.kind == TrackKind::Video && !self.params.is_svc {
            layer.clamp(0, DEFAULT_MAX_LAYER_SPATIAL)
        } else {
            0
        };

        buffer.set_pli_throttle(self.params.pli_throttle.for_layer(layer));
        if self.params.track.kind == TrackKind::Audio {
            buffer.set_audio_level_params(
                AudioLevelParams {
                    active_level: self.params.audio.active_level,
                    min_percentile: self.params.audio.min_percentile,
                    observe_duration_ms: self.params.audio.update_interval_ms,
                    smooth_intervals: self.params.audio.smooth_intervals,
                },
                self.params.audio_level_extension_id,
            );
        }

        let feedback_receiver = Arc::downgrade(self);
        buffer.on_rtcp_feedback(Arc::new(move |packets| {
            if let Some(receiver) = feedback_receiver.upgrade() {
                receiver.send_rtcp(packets);
            }
        }));

        let sr_receiver = Arc::downgrade(self);
        let sr_buffer = Arc::downgrade(&buffer);
        buffer.on_rtcp_sender_report(Arc::new(move || {
            let (receiver, buffer) = match (sr_receiver.upgrade(), sr_buffer.upgrade()) {
                (Some(receiver), Some(buffer)) => (receiver, buffer),
                _ => return,
            };

            let (sr_first, sr_newest) = buffer.sender_report_data();
            receiver
                .stream_tracker_manager
                .set_rtcp_sender_report_data(layer, sr_first, sr_newest);

            if let Some(sr_newest) = sr_newest {
                receiver.down_track_spreader.broadcast(|dt| {
                    dt.handle_rtcp_sender_report_data(layer, sr_newest);
                });
            }
        }));

        buffer.set_rtt(self.rtt.load(Ordering::Acquire));
        buffer.set_paused(self.stream_tracker_manager.is_paused());

        self.buffers.write()[layer as usize] = Some(Arc::clone(&buffer));
        self.ssrcs.write()[layer as usize] = ssrc;

        if self.params.track.kind == TrackKind::Video && self.params.use_trackers {
            self.stream_tracker_manager.add_tracker(layer);
        }

        let receiver = Arc::clone(self);
        let builder = thread::Builder::new().name(format!("forward-rtp-{layer}"));
        if let Err(err) = builder.spawn(move || receiver.forward_rtp(layer, buffer)) {
            error!("failed to spawn forward loop, layer: {layer}, err: {err}");
        }
    }

    fn forward_rtp(self: Arc<Self>, layer: i32, buffer: Arc<Buffer>) {
        let tracker = self.stream_tracker_manager.get_tracker(layer);

        loop {
            let pkt = match buffer.read_extended() {
                Ok(pkt) => pkt,
                Err(_) => break,
            };

            let mut spatial_layer = layer;
            let mut spatial_tracker = tracker.clone();
            if pkt.spatial >= 0 {
                // svc packet, dispatch to the tracker of its own layer
                spatial_layer = pkt.spatial;
                spatial_tracker = self.stream_tracker_manager.get_tracker(pkt.spatial);
                if spatial_tracker.is_none() {
                    spatial_tracker = self.stream_tracker_manager.add_tracker(pkt.spatial);
                }
            }

            self.down_track_spreader.broadcast(|dt| {
                dt.write_rtp(&pkt, spatial_layer);
            });

            if let Some(tracker) = &spatial_tracker {
                tracker.observe(
                    pkt.temporal,
                    pkt.raw.len(),
                    pkt.payload.len(),
                    pkt.header.marker,
                    pkt.header.timestamp,
                );
            }
        }

        self.close_internal();
        self.stream_tracker_manager.remove_tracker(layer);
        if self.params.is_svc {
            self.stream_tracker_manager.remove_all_trackers();
        }
    }

    /// Closes the receiver: buffers freeze, forward loops drain out, down
    /// tracks are closed in parallel.
    pub fn close(&self) {
        let buffers = self.buffers.read().clone();
        for buffer in buffers.into_iter().flatten() {
            buffer.close();
        }

        self.close_internal();
    }

    fn close_internal(&self) {
        self.close_once.call_once(|| {
            self.closed.store(true, Ordering::Release);
            self.stream_tracker_manager.close();

            let senders = self.down_track_spreader.reset_and_get_down_tracks();
            close_track_senders(senders);

            if let Some(on_close) = self.on_close.lock().take() {
                on_close();
            }
        });
    }

    fn send_rtcp(&self, packets: RtcpPackets) {
        if packets.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let tx = self.rtcp_tx.lock();
        if let Some(tx) = tx.as_ref() {
            if let Err(TrySendError::Full(_)) = tx.try_send(packets) {
                warn!("rtcp channel full, dropping feedback packets");
            }
        }
    }

    fn get_buffer(&self, layer: i32) -> Option<Arc<Buffer>> {
        // for svc codecs the spatial layers are in-built and handled by a
        // single buffer
        let layer = if self.params.is_svc { 0 } else { layer };
        if !(0..SPATIAL_LAYERS as i32).contains(&layer) {
            return None;
        }
        self.buffers.read()[layer as usize].clone()
    }

    /// Lifetime stats aggregated across the track's layers.
    pub fn get_track_stats(&self) -> Option<RtpStatsSummary> {
        let buffers = self.buffers.read().clone();
        let stats: Vec<RtpStatsSummary> = buffers
            .into_iter()
            .flatten()
            .filter_map(|buffer| buffer.get_stats())
            .collect();

        aggregate_rtp_stats(&stats)
    }

    /// Interval stats per SSRC since the last call.
    pub fn get_delta_stats(&self) -> HashMap<u32, RtpDeltaInfo> {
        let buffers = self.buffers.read().clone();

        let mut deltas = HashMap::new();
        for (layer, buffer) in buffers.into_iter().enumerate() {
            let buffer = match buffer {
                Some(buffer) => buffer,
                None => continue,
            };

            if let Some(delta) = buffer.get_delta_stats() {
                deltas.insert(self.ssrc(layer), delta);
            }
        }
        deltas
    }

    pub fn stream_tracker_manager(&self) -> &Arc<StreamTrackerManager> {
        &self.stream_tracker_manager
    }
}

impl TrackReceiver for Receiver {
    fn track_id(&self) -> TrackId {
        self.params.track_id.clone()
    }

    fn stream_id(&self) -> String {
        self.params.stream_id.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read_rtp(&self, buf: &mut [u8], layer: u8, sn: u16) -> Result<usize> {
        let buffer = self
            .get_buffer(layer as i32)
            .ok_or(Error::BufferNotFound)?;
        Ok(buffer.get_packet(buf, sn)?)
    }

    fn get_layered_bitrate(&self) -> (Vec<i32>, Bitrates) {
        self.stream_tracker_manager.get_layered_bitrate()
    }

    fn get_audio_level(&self) -> Option<(f64, bool)> {
        if self.params.track.kind == TrackKind::Video {
            return None;
        }

        let buffers = self.buffers.read().clone();
        buffers
            .into_iter()
            .flatten()
            .find_map(|buffer| buffer.get_audio_level())
    }

    fn send_pli(&self, layer: i32, force: bool) {
        if let Some(buffer) = self.get_buffer(layer) {
            buffer.send_pli(force);
        }
    }

    /// Upstream will not be sending data; reflects mute so trackers do
    /// not declare layers dead.
    fn set_up_track_paused(&self, paused: bool) {
        self.stream_tracker_manager.set_paused(paused);

        let buffers = self.buffers.read().clone();
        for buffer in buffers.into_iter().flatten() {
            buffer.set_paused(paused);
        }
    }

    fn set_max_expected_spatial_layer(&self, layer: i32) {
        self.stream_tracker_manager
            .set_max_expected_spatial_layer(layer);
    }

    fn add_down_track(&self, track: Arc<dyn TrackSender>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ReceiverClosed);
        }

        let subscriber_id = track.subscriber_id();
        if self.down_track_spreader.has_down_track(&subscriber_id) {
            info!("subscriber already exists on track, subscriber: {subscriber_id}");
            return Err(Error::DownTrackAlreadyExists);
        }

        track.up_track_max_published_layer_changed(
            self.stream_tracker_manager.get_max_published_layer(),
        );
        track.up_track_max_temporal_layer_seen_changed(
            self.stream_tracker_manager.get_max_temporal_layer_seen(),
        );

        self.down_track_spreader.store(track);
        Ok(())
    }

    fn delete_down_track(&self, subscriber_id: &SubscriberId) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.down_track_spreader.free(subscriber_id);
    }

    fn get_calculated_clock_rate(&self, layer: i32) -> u32 {
        self.stream_tracker_manager.get_calculated_clock_rate(layer)
    }

    fn get_reference_layer_rtp_timestamp(
        &self,
        ets: u64,
        layer: i32,
        reference_layer: i32,
    ) -> Result<u64> {
        let mapped = self.stream_tracker_manager.get_reference_layer_rtp_timestamp(
            ets as u32,
            layer,
            reference_layer,
        )?;

        // keep the extended counter continuous across the modular mapping
        let delta = mapped.wrapping_sub(ets as u32) as i32 as i64;
        Ok((ets as i64).wrapping_add(delta) as u64)
    }
}

impl StreamTrackerManagerListener for Receiver {
    fn on_available_layers_changed(&self) {
        self.down_track_spreader.broadcast(|dt| {
            dt.up_track_layers_changed();
        });
    }

    fn on_bitrate_availability_changed(&self) {
        self.down_track_spreader.broadcast(|dt| {
            dt.up_track_bitrate_availability_changed();
        });
    }

    fn on_max_published_layer_changed(&self, max_published_layer: i32) {
        self.down_track_spreader.broadcast(|dt| {
            dt.up_track_max_published_layer_changed(max_published_layer);
        });
    }

    fn on_max_temporal_layer_seen_changed(&self, max_temporal_layer_seen: i32) {
        self.down_track_spreader.broadcast(|dt| {
            dt.up_track_max_temporal_layer_seen_changed(max_temporal_layer_seen);
        });
    }

    fn on_max_available_layer_changed(&self, max_available_layer: i32) {
        let on_max_layer_changed = self.on_max_layer_changed.lock();
        if let Some(cb) = on_max_layer_changed.as_ref() {
            cb(max_available_layer);
        }
    }

    fn on_bitrate_report(&self, available_layers: &[i32], bitrates: Bitrates) {
        self.down_track_spreader.broadcast(|dt| {
            dt.up_track_bitrate_report(available_layers, bitrates);
        });
    }
}

/// Closes all senders in parallel, returning when all are closed.
fn close_track_senders(senders: Vec<Arc<dyn TrackSender>>) {
    thread::scope(|scope| {
        for sender in &senders {
            scope.spawn(|| sender.close());
        }
    });
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Recording stand-in for a subscriber's down track.
    pub(crate) struct MockTrackSender {
        id: SubscriberId,
        pub(crate) packets: Mutex<Vec<(u64, i32)>>,
        layers_changed: AtomicUsize,
        pub(crate) bitrate_reports: AtomicUsize,
        pub(crate) sender_reports: Mutex<Vec<(i32, RtcpSenderReportData)>>,
        pub(crate) max_published: Mutex<Vec<i32>>,
        pub(crate) closed: AtomicBool,
    }

    impl MockTrackSender {
        pub(crate) fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                packets: Mutex::new(Vec::new()),
                layers_changed: AtomicUsize::new(0),
                bitrate_reports: AtomicUsize::new(0),
                sender_reports: Mutex::new(Vec::new()),
                max_published: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub(crate) fn layers_changed_count(&self) -> usize {
            self.layers_changed.load(Ordering::SeqCst)
        }

        pub(crate) fn packet_count(&self) -> usize {
            self.packets.lock().len()
        }
    }

    impl TrackSender for MockTrackSender {
        fn subscriber_id(&self) -> SubscriberId {
            self.id.clone()
        }

        fn write_rtp(&self, pkt: &ExtPacket, spatial_layer: i32) {
            self.packets
                .lock()
                .push((pkt.ext_sequence_number, spatial_layer));
        }

        fn up_track_layers_changed(&self) {
            self.layers_changed.fetch_add(1, Ordering::SeqCst);
        }

        fn up_track_bitrate_availability_changed(&self) {}

        fn up_track_max_published_layer_changed(&self, max_published_layer: i32) {
            self.max_published.lock().push(max_published_layer);
        }

        fn up_track_max_temporal_layer_seen_changed(&self, _max_temporal_layer_seen: i32) {}

        fn up_track_bitrate_report(&self, _available_layers: &[i32], _bitrates: Bitrates) {
            self.bitrate_reports.fetch_add(1, Ordering::SeqCst);
        }

        fn handle_rtcp_sender_report_data(&self, layer: i32, sr: RtcpSenderReportData) {
            self.sender_reports.lock().push((layer, sr));
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
