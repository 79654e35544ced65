//! Deduplicating work queue
//!
//! A key is handed to at most one worker at a time. Adding a key that is
//! being processed marks it dirty; it is queued again when the worker calls
//! `done`. Failed keys are re-added after a per-key exponential backoff.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// First retry delay of a failing key
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Retry delay cap
pub const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    failures: DashMap<String, ExponentialBackoff>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            failures: DashMap::new(),
        }
    }

    /// Queue a key unless it is already waiting
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Queue a key after its next backoff delay; returns the delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) -> Duration {
        let delay = self.next_delay(key);
        self.add_after(key, delay);
        delay
    }

    fn next_delay(&self, key: &str) -> Duration {
        let mut backoff = self
            .failures
            .entry(key.to_string())
            .or_insert_with(|| ExponentialBackoff {
                current_interval: BASE_DELAY,
                initial_interval: BASE_DELAY,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: MAX_DELAY,
                max_elapsed_time: None,
                ..Default::default()
            });
        backoff.next_backoff().unwrap_or(MAX_DELAY)
    }

    /// Reset the backoff of a key after a successful pass
    pub fn forget(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key finished; requeues it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
