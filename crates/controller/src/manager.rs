//! Watch, queue and worker wiring.
//!
//! Watchers turn object events into [`WorkItem`]s on a [`WorkQueue`]. A fixed
//! pool of workers pulls items, runs the matching reconcile and schedules the
//! requeue it asked for. Everything stops when the cancellation token fires.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use keel_core::{Backoff, API_VERSION, KIND_APPLICATION, KIND_APP_ROLLOUT};
use keel_kubehub::{watch_keys, KubeCluster, ObjectKey};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ControllerApi, ControllerConfig, ErrorClass, Requeue, WorkQueue};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    Application(ObjectKey),
    Rollout(ObjectKey),
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::Application(k) => write!(f, "application {}", k),
            WorkItem::Rollout(k) => write!(f, "rollout {}", k),
        }
    }
}

const WATCH_BACKOFF: Backoff =
    Backoff { steps: u32::MAX, initial: Duration::from_secs(1), factor: 2, max: Duration::from_secs(60) };

/// Keep a watch running until `cancel` fires or the key receiver is dropped.
/// A failed stream is restarted after `backoff`, growing with consecutive
/// failures. A stream that ends cleanly is restarted after the initial delay.
pub async fn supervise_watch<F, Fut>(
    kind: &str,
    backoff: &Backoff,
    tx: mpsc::Sender<ObjectKey>,
    cancel: CancellationToken,
    mut watch: F,
) where
    F: FnMut(mpsc::Sender<ObjectKey>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failures = 0u32;
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => return,
            res = watch(tx.clone()) => res,
        };
        if tx.is_closed() {
            debug!(kind, "key receiver dropped; watch stopped");
            return;
        }
        let delay = match res {
            Ok(()) => {
                failures = 0;
                warn!(kind, "watch stream ended; restarting");
                backoff.initial
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                error!(kind, error = ?e, attempt = failures, "watch failed; restarting");
                backoff.delay(failures)
            }
        };
        counter!("watch_restarts_total", 1u64, "kind" => kind.to_string());
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

pub struct Manager {
    api: Arc<dyn ControllerApi>,
    queue: Arc<WorkQueue<WorkItem>>,
    config: ControllerConfig,
    /// Consecutive transient failures per item, for requeue backoff.
    failures: Mutex<FxHashMap<WorkItem, u32>>,
    retry: Backoff,
}

impl Manager {
    pub fn new(api: Arc<dyn ControllerApi>, config: ControllerConfig) -> Self {
        Self {
            api,
            queue: Arc::new(WorkQueue::with_capacity(config.queue_cap)),
            config,
            failures: Mutex::new(FxHashMap::default()),
            retry: Backoff { steps: u32::MAX, initial: Duration::from_secs(1), factor: 2, max: Duration::from_secs(300) },
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue<WorkItem>> { self.queue.clone() }

    /// Run one item and turn its result into a requeue decision.
    pub async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> Requeue {
        let res = match item {
            WorkItem::Application(k) => self.api.reconcile(k, cancel).await,
            WorkItem::Rollout(k) => self.api.reconcile_rollout(k, cancel).await,
        };
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        match res {
            Ok(requeue) => {
                failures.remove(item);
                requeue
            }
            Err(e) => {
                let class = e.class();
                counter!("reconcile_errors_total", 1u64, "class" => class.as_str());
                match class {
                    ErrorClass::UserSpec => {
                        failures.remove(item);
                        info!(%item, error = %e, "spec error; waiting for a change");
                        Requeue::Done
                    }
                    ErrorClass::StatusPersist => Requeue::NOW,
                    ErrorClass::Apply => Requeue::After(self.config.health_requeue),
                    ErrorClass::Transient => {
                        let n = failures.entry(item.clone()).or_insert(0);
                        *n = n.saturating_add(1);
                        Requeue::After(self.retry.delay(*n))
                    }
                }
            }
        }
    }

    fn schedule(&self, item: WorkItem, after: Duration, cancel: &CancellationToken) {
        if after.is_zero() {
            self.queue.add(item);
            return;
        }
        let queue = self.queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(after) => queue.add(item),
            }
        });
    }

    async fn worker(self: Arc<Self>, id: usize, cancel: CancellationToken) {
        debug!(worker = id, "worker started");
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.next() => match next {
                    Some(item) => item,
                    None => break,
                },
            };
            let requeue = self.process(&item, &cancel).await;
            self.queue.done(&item);
            if let Requeue::After(d) = requeue {
                debug!(%item, after_ms = d.as_millis() as u64, "requeue");
                self.schedule(item, d, &cancel);
            }
        }
        debug!(worker = id, "worker stopped");
    }

    /// Start the worker pool and block until `cancel` fires.
    pub async fn run_workers(self: Arc<Self>, cancel: CancellationToken) {
        let handles: Vec<_> = (0..self.config.workers)
            .map(|id| tokio::spawn(self.clone().worker(id, cancel.clone())))
            .collect();
        info!(workers = handles.len(), "workers running");
        cancel.cancelled().await;
        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("workers stopped");
    }

    /// Watch Applications and AppRollouts in `namespace` (all when `None`)
    /// and reconcile them until `cancel` fires.
    pub async fn run(self: Arc<Self>, cluster: Arc<KubeCluster>, namespace: Option<String>, cancel: CancellationToken) -> Result<()> {
        for (kind, wrap) in [
            (KIND_APPLICATION, WorkItem::Application as fn(ObjectKey) -> WorkItem),
            (KIND_APP_ROLLOUT, WorkItem::Rollout as fn(ObjectKey) -> WorkItem),
        ] {
            let (tx, mut rx) = mpsc::channel::<ObjectKey>(self.config.queue_cap);
            let cluster = cluster.clone();
            let ns = namespace.clone();
            let watch_cancel = cancel.clone();
            tokio::spawn(async move {
                supervise_watch(kind, &WATCH_BACKOFF, tx, watch_cancel, |tx| {
                    let cluster = cluster.clone();
                    let ns = ns.clone();
                    async move { watch_keys(&cluster, API_VERSION, kind, ns.as_deref(), tx).await }
                })
                .await
            });
            let queue = self.queue.clone();
            tokio::spawn(async move {
                while let Some(key) = rx.recv().await {
                    queue.add(wrap(key));
                }
            });
        }
        self.run_workers(cancel).await;
        Ok(())
    }
}
