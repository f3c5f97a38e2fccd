//! Coalescing work queue keyed by object key.
//!
//! FIFO over distinct keys. A key added while queued is coalesced; a key added
//! while a worker holds it is parked as dirty and re-queued by `done`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kratix_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

#[derive(Default)]
struct State {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    failures: FxHashMap<ObjectKey, u32>,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl WorkQueue {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self { state: Mutex::new(State::default()), notify: Notify::new(), backoff_base, backoff_max }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Number of keys waiting (not counting keys in flight).
    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn add(&self, key: ObjectKey) {
        {
            let mut st = self.lock();
            if st.shutdown { return; }
            if st.processing.contains(&key) {
                st.dirty.insert(key);
                return;
            }
            if !st.queued.insert(key.clone()) { return; }
            st.order.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Wait for the next key and mark it in flight. `None` once shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            // Register interest before checking so a concurrent add or shutdown is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutdown { return None; }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release an in-flight key; if it changed meanwhile it goes back on the queue.
    pub fn done(&self, key: &ObjectKey) {
        let requeue = {
            let mut st = self.lock();
            st.processing.remove(key);
            let requeue = st.dirty.remove(key) && !st.shutdown && st.queued.insert(key.clone());
            if requeue { st.order.push_back(key.clone()); }
            requeue
        };
        if requeue { self.notify.notify_one(); }
    }

    /// Reset the failure count of a key.
    pub fn forget(&self, key: &ObjectKey) { self.lock().failures.remove(key); }

    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Re-add after a per-key exponential delay; returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff_base.saturating_mul(1u32 << (*n).min(20)).min(self.backoff_max);
            *n = n.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
        delay
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}
