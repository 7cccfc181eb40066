#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use keel_controller::{supervise_watch, ControllerApi, ControllerConfig, Manager, ReconcileError, Requeue, WorkItem};
use keel_core::Backoff;
use keel_core::ResourceRef;
use keel_dispatch::DispatchError;
use keel_kubehub::{ClusterError, ObjectKey};
use keel_rollout::RolloutStatus;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Outcome = Box<dyn Fn(&ObjectKey, u32) -> Result<Requeue, ReconcileError> + Send + Sync>;

struct Fake {
    outcome: Outcome,
    delay: Duration,
    calls: Mutex<HashMap<ObjectKey, u32>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Fake {
    fn new(delay: Duration, outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            delay,
            calls: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn calls(&self, key: &ObjectKey) -> u32 { self.calls.lock().unwrap().get(key).copied().unwrap_or(0) }
}

#[async_trait::async_trait]
impl ControllerApi for Fake {
    async fn reconcile(&self, key: &ObjectKey, _cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        (self.outcome)(key, n)
    }

    async fn reconcile_rollout(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        self.reconcile(key, cancel).await
    }

    async fn rollout_status(&self, _key: &ObjectKey) -> Result<Option<RolloutStatus>, ReconcileError> { Ok(None) }
}

fn by_name(key: &ObjectKey, n: u32) -> Result<Requeue, ReconcileError> {
    match key.name.as_str() {
        "spec" => Err(ReconcileError::InvalidSpec { key: key.clone(), message: "no workload".into() }),
        "apply" => Err(ReconcileError::Dispatch(DispatchError::Apply {
            resource: ResourceRef::new("v1", "ConfigMap", "ns", "x"),
            cause: "controlled by someone else".into(),
        })),
        "status" => Err(ReconcileError::StatusPersist { key: key.clone(), source: ClusterError::Api("down".into()) }),
        "flaky" if n < 3 => Err(ReconcileError::Cluster(ClusterError::Api("connection reset".into()))),
        _ => Ok(Requeue::Done),
    }
}

#[tokio::test]
async fn error_classes_map_to_requeues() {
    let config = ControllerConfig::default();
    let manager = Manager::new(Fake::new(Duration::ZERO, Box::new(by_name)), config.clone());
    let cancel = CancellationToken::new();
    let item = |name: &str| WorkItem::Application(ObjectKey::new("ns", name));

    assert_eq!(manager.process(&item("ok"), &cancel).await, Requeue::Done);
    assert_eq!(manager.process(&item("spec"), &cancel).await, Requeue::Done);
    assert_eq!(manager.process(&item("apply"), &cancel).await, Requeue::After(config.health_requeue));
    assert_eq!(manager.process(&item("status"), &cancel).await, Requeue::NOW);

    // transient failures back off per item and reset on success
    let flaky = WorkItem::Rollout(ObjectKey::new("ns", "flaky"));
    assert_eq!(manager.process(&flaky, &cancel).await, Requeue::After(Duration::from_secs(1)));
    assert_eq!(manager.process(&flaky, &cancel).await, Requeue::After(Duration::from_secs(2)));
    assert_eq!(manager.process(&flaky, &cancel).await, Requeue::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_key_is_never_reconciled_concurrently() {
    let fake = Fake::new(Duration::from_millis(50), Box::new(|_, _| Ok(Requeue::Done)));
    let manager = Arc::new(Manager::new(fake.clone(), ControllerConfig { workers: 4, ..ControllerConfig::default() }));
    let queue = manager.queue();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(manager.clone().run_workers(cancel.clone()));

    let key = ObjectKey::new("ns", "shop");
    queue.add(WorkItem::Application(key.clone()));
    while fake.active.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // events arriving mid-reconcile collapse into one follow-up pass
    for _ in 0..5 {
        queue.add(WorkItem::Application(key.clone()));
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fake.calls(&key) < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(fake.calls(&key), 2);
    assert_eq!(fake.max_active.load(Ordering::SeqCst), 1);
    assert!(queue.is_empty());

    cancel.cancel();
    run.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_run_in_parallel() {
    let fake = Fake::new(Duration::from_millis(100), Box::new(|_, _| Ok(Requeue::Done)));
    let manager = Arc::new(Manager::new(fake.clone(), ControllerConfig { workers: 3, ..ControllerConfig::default() }));
    let queue = manager.queue();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(manager.clone().run_workers(cancel.clone()));

    for name in ["a", "b", "c"] {
        queue.add(WorkItem::Application(ObjectKey::new("ns", name)));
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while ["a", "b", "c"].iter().any(|n| fake.calls(&ObjectKey::new("ns", *n)) == 0) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(fake.max_active.load(Ordering::SeqCst) > 1);

    cancel.cancel();
    run.await.unwrap();
}

/// Fails twice, ends cleanly once, then delivers a key and stays open.
async fn flaky_watch(attempt: usize, tx: mpsc::Sender<ObjectKey>) -> anyhow::Result<()> {
    match attempt {
        0 | 1 => anyhow::bail!("410 Gone"),
        2 => Ok(()),
        _ => {
            tx.send(ObjectKey::new("ns", "shop")).await?;
            std::future::pending().await
        }
    }
}

#[tokio::test(start_paused = true)]
async fn failed_watches_are_restarted_until_shutdown() {
    let backoff = Backoff { steps: u32::MAX, initial: Duration::from_secs(1), factor: 2, max: Duration::from_secs(8) };
    let attempts = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();

    let seen = attempts.clone();
    let stop = cancel.clone();
    let watch = tokio::spawn(async move {
        supervise_watch("Application", &backoff, tx, stop, move |tx| flaky_watch(seen.fetch_add(1, Ordering::SeqCst), tx)).await
    });

    assert_eq!(rx.recv().await, Some(ObjectKey::new("ns", "shop")));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(!watch.is_finished());

    cancel.cancel();
    watch.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn watch_stops_when_the_receiver_is_gone() {
    let backoff = Backoff { steps: u32::MAX, initial: Duration::from_millis(10), factor: 2, max: Duration::from_millis(40) };
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    let attempts = AtomicUsize::new(0);
    supervise_watch("AppRollout", &backoff, tx, CancellationToken::new(), |_tx| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Ok::<(), anyhow::Error>(()) }
    })
    .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
