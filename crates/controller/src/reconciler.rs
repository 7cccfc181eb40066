//! The Application reconciliation pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use keel_appfile::{parse, Appfile, RenderContext, Renderer};
use keel_core::meta::set_condition;
use keel_core::{
    tracker_name, with_optimistic_retry, Condition, KindRegistry, ResourceRef, API_VERSION, KIND_APPLICATION,
    KIND_APP_ROLLOUT,
};
use keel_dispatch::{sweep_stale_trackers, Dispatcher, TrackerStore};
use keel_kubehub::{ClusterClient, ObjectKey};
use keel_revision::{build_revision, current_revision_name, next_revision_name, Built, RevisionStore};
use keel_rollout::RolloutStatus;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::check_health;
use crate::model::{
    set_status, AppPhase, AppStatus, Application, LatestRevision, CONDITION_APPLIED, CONDITION_BUILT,
    CONDITION_HEALTHY, CONDITION_PARSED,
};
use crate::{ControllerApi, ControllerConfig, Definitions, ErrorClass, ReconcileError, Requeue};

pub struct Reconciler {
    pub(crate) client: Arc<dyn ClusterClient>,
    pub(crate) registry: KindRegistry,
    definitions: Definitions,
    pub(crate) config: ControllerConfig,
}

/// Record `e` as a False condition and hand it back.
fn failed(status: &mut AppStatus, type_: &str, reason: &str, e: impl Into<ReconcileError>) -> ReconcileError {
    let e = e.into();
    set_condition(&mut status.conditions, Condition::error(type_, reason, e.to_string()));
    e
}

impl Reconciler {
    pub fn new(client: Arc<dyn ClusterClient>, registry: KindRegistry, definitions: Definitions, config: ControllerConfig) -> Self {
        Self { client, registry, definitions, config }
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    pub async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let app_ref = ResourceRef::new(API_VERSION, KIND_APPLICATION, &key.namespace, &key.name);
        let Some(obj) = self.client.get(&app_ref).await? else {
            debug!(app = %key, "application gone");
            return Ok(Requeue::Done);
        };
        let app = Application::from_object(&obj)?;
        if app.deleting {
            debug!(app = %key, "application is being deleted");
            return Ok(Requeue::Done);
        }

        info!(app = %key, "start rendering");
        let mut status = app.status.clone();
        status.phase = AppPhase::Rendering;
        let mut outcome = self.pass(&app, &mut status, cancel).await;
        if let Err(e) = &outcome {
            if e.class() == ErrorClass::UserSpec {
                status.phase = AppPhase::Failed;
            }
            counter!("reconcile_err", 1u64);
            warn!(app = %key, class = e.class().as_str(), error = %e, "reconcile failed");
        }
        if status != app.status {
            if let Err(e) = self.persist_status(&app_ref, key, &status).await {
                if outcome.is_ok() {
                    outcome = Err(e);
                } else {
                    warn!(app = %key, error = %e, "status not persisted");
                }
            }
        }
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn pass(&self, app: &Application, status: &mut AppStatus, cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        let ns = app.key.namespace.as_str();
        let backoff = self.config.backoff();

        let templates = match self.definitions.load(self.client.as_ref(), ns).await {
            Ok(t) => t,
            Err(e) => return Err(failed(status, CONDITION_PARSED, "DefinitionError", e)),
        };
        let af = match parse(&app.appfile_source(), &*templates) {
            Ok(af) => af,
            Err(e) => return Err(failed(status, CONDITION_PARSED, "ParseError", e)),
        };
        set_condition(&mut status.conditions, Condition::ready(CONDITION_PARSED));
        status.phase = AppPhase::Parsed;
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let revisions = RevisionStore::new(self.client.clone());
        let renderer = Renderer::new(self.registry.clone());
        let built =
            match with_optimistic_retry(&backoff, || self.build(&af, &renderer, &revisions, ns, app.rollout_template)).await {
                Ok(b) => b,
                Err(e @ ReconcileError::Render(_)) => return Err(failed(status, CONDITION_BUILT, "RenderError", e)),
                Err(e) => return Err(failed(status, CONDITION_BUILT, "RevisionError", e)),
            };
        let rev = built.into_revision();
        set_condition(&mut status.conditions, Condition::ready(CONDITION_BUILT));
        status.phase = AppPhase::Built;
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        // the previously dispatched revision, when its tracker is still around
        let trackers = TrackerStore::new(self.client.clone(), backoff.clone());
        let mut previous = None;
        if let Some(prev) = status.latest_revision.as_ref().map(|r| r.name.as_str()).filter(|p| *p != rev.name) {
            let name = tracker_name(prev, ns);
            if trackers.get(&name).await?.is_some() {
                previous = Some(name);
            }
        }
        let dispatcher = Dispatcher::new(self.client.clone(), self.registry.clone(), &af.name, ns, &rev.name).with_backoff(backoff);
        let dispatcher = if app.rollout_template {
            dispatcher
                .with_upgrade_and_skip_gc(previous)
                .preserve_replicas(true)
                .zero_replicas_on_create(true)
                .yield_to(Some(KIND_APP_ROLLOUT.to_string()))
        } else {
            dispatcher.with_gc(previous)
        };
        let tracker = match dispatcher.dispatch(cancel, &rev.manifests).await {
            Ok(t) => t,
            Err(e) => return Err(failed(status, CONDITION_APPLIED, "ApplyFailed", e)),
        };
        set_condition(&mut status.conditions, Condition::ready(CONDITION_APPLIED));
        status.phase = AppPhase::Applied;
        status.latest_revision =
            Some(LatestRevision { name: rev.name.clone(), revision: rev.revision, revision_hash: rev.content_hash.clone() });

        status.phase = AppPhase::HealthCheck;
        status.services = check_health(self.client.as_ref(), &self.registry, &rev).await?;
        let unhealthy: Vec<String> =
            status.services.iter().filter(|s| !s.healthy).map(|s| format!("{}: {}", s.name, s.message)).collect();
        if !unhealthy.is_empty() {
            set_condition(&mut status.conditions, Condition::error(CONDITION_HEALTHY, "Unhealthy", unhealthy.join("; ")));
            debug!(app = %app.key, unhealthy = unhealthy.len(), "waiting for workloads");
            return Ok(Requeue::After(self.config.health_requeue));
        }
        set_condition(&mut status.conditions, Condition::ready(CONDITION_HEALTHY));

        // rollout mode keeps what a rollout may still move between
        let mut in_use = if app.rollout_template {
            self.revisions_held_by_rollouts(&af.name, ns, &trackers, &tracker).await?
        } else {
            BTreeSet::new()
        };
        let keep: BTreeSet<String> = in_use.iter().map(|r| tracker_name(r, ns)).collect();
        let swept = sweep_stale_trackers(self.client.as_ref(), &trackers, &af.name, ns, &tracker, &keep).await?;
        if !swept.is_empty() {
            info!(app = %app.key, swept = ?swept, "stale trackers removed");
        }
        in_use.insert(rev.name.clone());
        revisions.prune(&af.name, ns, self.config.revision_history, &in_use).await?;

        status.phase = AppPhase::Running;
        info!(app = %app.key, revision = %rev.name, "application running");
        Ok(Requeue::Done)
    }

    /// Render under the latest revision name; when that yields new content,
    /// render again under the next name so the revision's labels match it.
    async fn build(
        &self,
        af: &Appfile,
        renderer: &Renderer,
        revisions: &RevisionStore,
        ns: &str,
        rollout: bool,
    ) -> Result<Built, ReconcileError> {
        let history = revisions.list(&af.name, ns).await?;
        let ctx = RenderContext::new(&af.name, ns, current_revision_name(&af.name, &history)).with_rollout(rollout);
        let mut built = build_revision(af, renderer.render_appfile(af, &ctx)?, ns, &history);
        if built.is_new() && built.revision().name != ctx.app_revision {
            let ctx = RenderContext::new(&af.name, ns, next_revision_name(&af.name, &history)).with_rollout(rollout);
            built = build_revision(af, renderer.render_appfile(af, &ctx)?, ns, &history);
        }
        if let Built::New(rev) = &built {
            revisions.persist(rev).await?;
        }
        Ok(built)
    }

    /// Write `status` onto the object behind `r`, re-reading it on conflict.
    /// A vanished object is not an error.
    pub(crate) async fn persist_status<T: Serialize + Sync>(
        &self,
        r: &ResourceRef,
        key: &ObjectKey,
        status: &T,
    ) -> Result<(), ReconcileError> {
        let res = with_optimistic_retry(&self.config.backoff(), || async {
            let Some(mut obj) = self.client.get(r).await? else { return Ok::<(), ReconcileError>(()) };
            set_status(&mut obj, status)?;
            self.client.update_status(obj).await?;
            Ok(())
        })
        .await;
        res.map_err(|e| match e {
            ReconcileError::Cluster(source) => ReconcileError::StatusPersist { key: key.clone(), source },
            other => other,
        })
    }
}

#[async_trait::async_trait]
impl ControllerApi for Reconciler {
    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        Reconciler::reconcile(self, key, cancel).await
    }

    async fn reconcile_rollout(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        Reconciler::reconcile_rollout(self, key, cancel).await
    }

    async fn rollout_status(&self, key: &ObjectKey) -> Result<Option<RolloutStatus>, ReconcileError> {
        Reconciler::rollout_status(self, key).await
    }
}
