//! Keel dispatch: apply a revision's manifests under a ResourceTracker and
//! garbage-collect what the previous revision applied but this one does not.
//!
//! Every dispatched object carries exactly one controller owner reference,
//! always pointing at the tracker of the revision that last applied it.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_core::{tracker_name, Backoff, KindRegistry, RenderedManifest, ResourceRef, ResourceTracker, Retryable};
use keel_kubehub::{ClusterClient, ClusterError};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod apply;
mod gc;
mod tracker;

pub use apply::{merge, ApplyOutcome, Applicator};
pub use gc::{collect, sweep_stale_trackers};
pub use tracker::{decode as decode_tracker, TrackerStore};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid revision: {0}")]
    InvalidRevision(String),
    #[error("resource tracker {0} not found")]
    TrackerNotFound(String),
    #[error("apply {resource}: {cause}")]
    Apply { resource: ResourceRef, cause: String },
    #[error("garbage collect {resource}: {cause}")]
    Gc { resource: ResourceRef, cause: String },
    #[error("tracker {name}: {message}")]
    Decode { name: String, message: String },
    #[error("dispatch cancelled")]
    Cancelled,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl Retryable for DispatchError {
    fn is_conflict(&self) -> bool { matches!(self, DispatchError::Cluster(e) if e.is_conflict()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Gc,
    SkipGc,
}

/// One dispatch of a revision's manifests.
pub struct Dispatcher {
    client: Arc<dyn ClusterClient>,
    registry: KindRegistry,
    app: String,
    namespace: String,
    revision: String,
    previous: Option<String>,
    mode: Mode,
    preserve_replicas: bool,
    zero_replicas_on_create: bool,
    yield_to: Option<String>,
    backoff: Backoff,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn ClusterClient>, registry: KindRegistry, app: &str, namespace: &str, revision: &str) -> Self {
        Self {
            client,
            registry,
            app: app.to_string(),
            namespace: namespace.to_string(),
            revision: revision.to_string(),
            previous: None,
            mode: Mode::Gc,
            preserve_replicas: false,
            zero_replicas_on_create: false,
            yield_to: None,
            backoff: Backoff::default(),
        }
    }

    /// After applying, delete what `previous` tracks and this revision does
    /// not, then delete the previous tracker itself.
    pub fn with_gc(mut self, previous: Option<String>) -> Self {
        self.previous = previous;
        self.mode = Mode::Gc;
        self
    }

    /// Take over objects controlled by `previous` but leave everything else of
    /// it alive.
    pub fn with_upgrade_and_skip_gc(mut self, previous: Option<String>) -> Self {
        self.previous = previous;
        self.mode = Mode::SkipGc;
        self
    }

    pub fn preserve_replicas(mut self, on: bool) -> Self {
        self.preserve_replicas = on;
        self
    }

    pub fn zero_replicas_on_create(mut self, on: bool) -> Self {
        self.zero_replicas_on_create = on;
        self
    }

    /// See [`Applicator::yield_to`].
    pub fn yield_to(mut self, kind: Option<String>) -> Self {
        self.yield_to = kind;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn tracker_name(&self) -> String { tracker_name(&self.revision, &self.namespace) }

    /// Apply `manifests` in order and record them in this revision's tracker.
    /// On failure or cancellation what was applied so far stays applied and
    /// tracked; running the same dispatch again converges.
    pub async fn dispatch(
        &self,
        cancel: &CancellationToken,
        manifests: &[RenderedManifest],
    ) -> Result<ResourceTracker, DispatchError> {
        let t0 = Instant::now();
        counter!("dispatch_total", 1u64);
        if self.revision.is_empty() || self.namespace.is_empty() || self.app.is_empty() {
            return Err(DispatchError::InvalidRevision(format!(
                "app {:?} revision {:?} namespace {:?}",
                self.app, self.revision, self.namespace
            )));
        }
        let trackers = TrackerStore::new(self.client.clone(), self.backoff.clone());
        let current_name = self.tracker_name();
        let previous = match self.previous.as_deref().filter(|p| *p != current_name) {
            Some(p) => Some(trackers.get(p).await?.ok_or_else(|| DispatchError::TrackerNotFound(p.to_string()))?),
            None => None,
        };
        let current = trackers.acquire(&current_name, &self.app, &self.namespace).await?;

        let applicator = Applicator::new(self.client.clone(), self.registry.clone())
            .with_backoff(self.backoff.clone())
            .preserve_replicas(self.preserve_replicas)
            .zero_replicas_on_create(self.zero_replicas_on_create)
            .yield_to(self.yield_to.clone());
        let previous_uid = previous.as_ref().map(|p| p.uid.as_str());
        let mut applied = Vec::with_capacity(manifests.len());
        let mut failure = None;
        for m in manifests {
            if cancel.is_cancelled() {
                failure = Some(DispatchError::Cancelled);
                break;
            }
            match applicator.apply(m, &current, previous_uid).await {
                Ok(_) => applied.push(m.resource_ref()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let current = trackers.record(&current_name, &applied).await?;
        if let Some(e) = failure {
            counter!("dispatch_err", 1u64);
            warn!(tracker = %current_name, applied = applied.len(), error = %e, "dispatch stopped early");
            return Err(e);
        }

        if let (Mode::Gc, Some(prev)) = (self.mode, previous.as_ref()) {
            collect(self.client.as_ref(), prev, &current).await?;
            trackers.delete(&prev.name).await?;
            info!(previous = %prev.name, "previous tracker removed");
        }
        histogram!("dispatch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(tracker = %current.name, resources = current.tracked.len(), mode = ?self.mode, "dispatched");
        Ok(current)
    }
}
