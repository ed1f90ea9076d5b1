//! Fan-out of packets and events to the subscribers of one track.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;

use crate::receiver::{SubscriberId, TrackSender};

struct SpreaderState {
    senders: Vec<Arc<dyn TrackSender>>,
    index: HashMap<SubscriberId, usize>,
}

/// Holds the down tracks of one receiver and broadcasts to them, in
/// parallel once their count reaches the threshold.
pub struct DownTrackSpreader {
    threshold: usize,
    state: RwLock<SpreaderState>,
}

impl DownTrackSpreader {
    /// `threshold` of 0 disables parallel writes.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            state: RwLock::new(SpreaderState {
                senders: Vec::new(),
                index: HashMap::new(),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.state.read().senders.len()
    }

    pub fn has_down_track(&self, subscriber_id: &SubscriberId) -> bool {
        self.state.read().index.contains_key(subscriber_id)
    }

    /// Adds or replaces the down track for a subscriber.
    pub fn store(&self, sender: Arc<dyn TrackSender>) {
        let mut state = self.state.write();
        let subscriber_id = sender.subscriber_id();
        match state.index.get(&subscriber_id) {
            Some(slot) => {
                let slot = *slot;
                state.senders[slot] = sender;
            }
            None => {
                let slot = state.senders.len();
                state.index.insert(subscriber_id, slot);
                state.senders.push(sender);
            }
        }
    }

    pub fn free(&self, subscriber_id: &SubscriberId) {
        let mut state = self.state.write();
        let slot = match state.index.remove(subscriber_id) {
            Some(slot) => slot,
            None => return,
        };

        state.senders.swap_remove(slot);
        if slot < state.senders.len() {
            let moved_id = state.senders[slot].subscriber_id();
            state.index.insert(moved_id, slot);
        }
    }

    /// Removes and returns all down tracks.
    pub fn reset_and_get_down_tracks(&self) -> Vec<Arc<dyn TrackSender>> {
        let mut state = self.state.write();
        state.index.clear();
        std::mem::take(&mut state.senders)
    }

    /// Applies `f` to every down track. Below the threshold, writes go
    /// out sequentially; at or above it, each down track gets its own
    /// scoped thread so one slow subscriber cannot block the rest.
    pub fn broadcast<F>(&self, f: F)
    where
        F: Fn(&Arc<dyn TrackSender>) + Send + Sync,
    {
        let senders: Vec<Arc<dyn TrackSender>> = self.state.read().senders.clone();

        if self.threshold == 0 || senders.len() < self.threshold {
            for sender in &senders {
                f(sender);
            }
            return;
        }

        thread::scope(|scope| {
            for sender in &senders {
                scope.spawn(|| f(sender));
            }
        });
    }
}
