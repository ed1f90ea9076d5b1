//! Single-consumer serialized closure execution.
//!
//! Components that must run callbacks off their hot path enqueue closures
//! here; exactly one consumer thread drains them in FIFO order. The wake
//! signal has capacity one so enqueuing never blocks, and the consumer
//! drains until empty before re-arming it.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use log::error;
use parking_lot::{Condvar, Mutex};

type Op = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug)]
pub struct OpsQueueParams {
    /// Name of the consumer thread.
    pub name: String,
    /// Expected steady-state queue depth, used to size the deque.
    pub min_size: usize,
    /// Whether closures still queued at stop time run before the consumer
    /// exits, or are dropped.
    pub flush_on_stop: bool,
}

/// Completion handle returned by [`OpsQueue::stop`]. Repeated `stop` calls
/// return handles to the same completion state.
#[derive(Clone, Default)]
pub struct OpsQueueDone {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl OpsQueueDone {
    fn set(&self) {
        let mut done = self.inner.0.lock();
        *done = true;
        self.inner.1.notify_all();
    }

    /// Blocks until the consumer has exited.
    pub fn wait(&self) {
        let mut done = self.inner.0.lock();
        while !*done {
            self.inner.1.wait(&mut done);
        }
    }
}

struct State {
    ops: VecDeque<Op>,
    is_started: bool,
    is_stopped: bool,
}

pub struct OpsQueue {
    params: OpsQueueParams,
    state: Mutex<State>,
    wake_tx: SyncSender<()>,
    wake_rx: Mutex<Option<Receiver<()>>>,
    done: OpsQueueDone,
}

impl OpsQueue {
    pub fn new(params: OpsQueueParams) -> Self {
        let (wake_tx, wake_rx) = std::sync::mpsc::sync_channel(1);
        let capacity_exp = (usize::BITS - params.min_size.wrapping_sub(1).leading_zeros()).min(7);
        Self {
            params,
            state: Mutex::new(State {
                ops: VecDeque::with_capacity(1usize << capacity_exp),
                is_started: false,
                is_stopped: false,
            }),
            wake_tx,
            wake_rx: Mutex::new(Some(wake_rx)),
            done: OpsQueueDone::default(),
        }
    }

    /// Launches the consumer. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.is_started {
                return;
            }
            state.is_started = true;
        }

        let wake_rx = match self.wake_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };

        let queue = Arc::clone(self);
        let builder = thread::Builder::new().name(self.params.name.clone());
        if let Err(err) = builder.spawn(move || queue.process(wake_rx)) {
            error!("ops queue {}: failed to spawn consumer: {}", self.params.name, err);
        }
    }

    /// Stops the consumer and returns a completion handle. A second call
    /// returns the same handle.
    pub fn stop(&self) -> OpsQueueDone {
        let mut state = self.state.lock();
        if state.is_stopped {
            return self.done.clone();
        }

        state.is_stopped = true;
        drop(state);

        let _ = self.wake_tx.try_send(());
        self.done.clone()
    }

    /// Adds a closure to the queue. Dropped silently after stop.
    pub fn enqueue<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.is_stopped {
            return;
        }

        state.ops.push_back(Box::new(op));
        if state.ops.len() == 1 {
            let _ = self.wake_tx.try_send(());
        }
    }

    fn process(self: Arc<Self>, wake_rx: Receiver<()>) {
        loop {
            if wake_rx.recv().is_err() {
                break;
            }
            loop {
                let op = {
                    let mut state = self.state.lock();
                    if state.is_stopped && (!self.params.flush_on_stop || state.ops.is_empty()) {
                        drop(state);
                        self.done.set();
                        return;
                    }

                    match state.ops.pop_front() {
                        Some(op) => op,
                        None => break,
                    }
                };

                op();
            }
        }
        self.done.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn new_queue(flush_on_stop: bool) -> Arc<OpsQueue> {
        Arc::new(OpsQueue::new(OpsQueueParams {
            name: "test-ops".to_owned(),
            min_size: 16,
            flush_on_stop,
        }))
    }

    #[test]
    fn test_runs_ops_in_order() {
        let queue = new_queue(true);
        queue.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.enqueue(move || seen.lock().push(i));
        }

        queue.stop().wait();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_flush_on_stop_runs_pending() {
        let queue = new_queue(true);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            queue.enqueue(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        // consumer starts after everything is queued
        queue.start();
        queue.stop().wait();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_enqueue_after_stop_is_dropped() {
        let queue = new_queue(true);
        queue.start();
        let done = queue.stop();

        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        queue.enqueue(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        done.wait();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_second_stop_returns_same_completion() {
        let queue = new_queue(false);
        queue.start();

        let first = queue.stop();
        let second = queue.stop();
        first.wait();
        second.wait();
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[test]
    fn test_consumer_drains_before_rearming() {
        let queue = new_queue(true);
        queue.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            for _ in 0..50 {
                let count = Arc::clone(&count);
                queue.enqueue(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        queue.stop().wait();
        assert_eq!(count.load(Ordering::SeqCst), 150);
    }
}
