//! Controller runtime: worker pool, watch sources and periodic resync

use super::workqueue::WorkQueue;
use crate::domain::ports::{LabelSelector, ObjectStoreRef};
use crate::error::{ErrorAction, Result};
use crate::metrics::ControllerMetrics;
use crate::store::StoredObject;
use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next watch event or resync
    AwaitChange,
    RequeueAfter(Duration),
}

impl Action {
    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue(delay: Duration) -> Self {
        Action::RequeueAfter(delay)
    }
}

/// A single reconcile function for one object kind
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Converge the object named `key`
    async fn reconcile(&self, key: &str) -> Result<Action>;
}

/// Run one reconcile pass for `key` and schedule its follow-up
pub async fn process(
    queue: &Arc<WorkQueue>,
    reconciler: &dyn Reconciler,
    metrics: &ControllerMetrics,
    key: &str,
) {
    let started = Instant::now();
    let result = reconciler.reconcile(key).await;
    metrics.observe(reconciler.name(), started, result.as_ref().err());

    match result {
        Ok(Action::AwaitChange) => queue.forget(key),
        Ok(Action::RequeueAfter(delay)) => {
            queue.forget(key);
            queue.add_after(key, delay);
        }
        Err(e) => match e.action() {
            ErrorAction::RequeueWithBackoff => {
                let delay = queue.add_rate_limited(key);
                warn!(
                    controller = reconciler.name(),
                    key = %key,
                    error = %e,
                    retry_in = ?delay,
                    "Reconcile failed"
                );
            }
            ErrorAction::RequeueAfter(delay) => {
                debug!(
                    controller = reconciler.name(),
                    key = %key,
                    reason = %e,
                    "Reconcile waiting"
                );
                queue.forget(key);
                queue.add_after(key, delay);
            }
            ErrorAction::NoRequeue => {
                warn!(
                    controller = reconciler.name(),
                    key = %key,
                    error = %e,
                    "Reconcile failed, waiting for a spec change"
                );
                queue.forget(key);
            }
        },
    }
}

/// Run `workers` workers until the queue shuts down
pub async fn run_workers(
    queue: Arc<WorkQueue>,
    workers: usize,
    reconciler: Arc<dyn Reconciler>,
    metrics: ControllerMetrics,
) {
    info!(controller = reconciler.name(), workers, "Starting workers");
    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let queue = queue.clone();
            let reconciler = reconciler.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    process(&queue, reconciler.as_ref(), &metrics, &key).await;
                    queue.done(&key);
                }
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(controller = reconciler.name(), error = %e, "Worker panicked");
        }
    }
    info!(controller = reconciler.name(), "Workers stopped");
}

/// Enqueue the keys of every object touched in the watched collection
pub async fn watch<K, F>(
    api: Api<K>,
    config: watcher::Config,
    queue: Arc<WorkQueue>,
    keys: F,
    token: CancellationToken,
) where
    K: StoredObject,
    F: Fn(&K) -> Vec<String> + Send + 'static,
{
    let stream = watcher(api, config).default_backoff().touched_objects();
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            item = stream.next() => match item {
                Some(Ok(obj)) => {
                    for key in keys(&obj) {
                        queue.add(&key);
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Watch stream error"),
                None => break,
            },
        }
    }
}

/// Re-enqueue every listed object once per `interval`, starting immediately
pub async fn resync<K, F>(
    store: ObjectStoreRef<K>,
    selector: LabelSelector,
    queue: Arc<WorkQueue>,
    keys: F,
    interval: Duration,
    token: CancellationToken,
) where
    K: StoredObject,
    F: Fn(&K) -> Vec<String> + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match store.list(&selector).await {
                Ok(objects) => {
                    for obj in &objects {
                        for key in keys(obj) {
                            queue.add(&key);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Resync list failed"),
            },
        }
    }
}
