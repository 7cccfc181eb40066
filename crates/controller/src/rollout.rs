//! The AppRollout reconciliation pass.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use keel_core::meta::{controller_of, set_condition};
use keel_core::registry::get_path;
use keel_core::{
    tracker_name, ApplicationRevision, Condition, RenderedManifest, ResourceRef, ResourceTracker, API_VERSION,
    KIND_APP_ROLLOUT,
};
use keel_dispatch::TrackerStore;
use keel_kubehub::{to_json, ObjectKey};
use keel_revision::RevisionStore;
use keel_rollout::{ClusterWorkload, Rollout, RolloutStatus, StepOutcome, WorkloadHandle, CONDITION_ROLLOUT};
use metrics::counter;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::AppRollout;
use crate::{ErrorClass, ReconcileError, Reconciler, Requeue};

/// Transitions taken in one pass before yielding the worker.
const MAX_STEPS: usize = 64;

fn rollout_ref(key: &ObjectKey) -> ResourceRef { ResourceRef::new(API_VERSION, KIND_APP_ROLLOUT, &key.namespace, &key.name) }

impl Reconciler {
    pub async fn reconcile_rollout(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Requeue, ReconcileError> {
        counter!("rollout_reconcile_total", 1u64);
        let r = rollout_ref(key);
        let Some(obj) = self.client.get(&r).await? else {
            debug!(rollout = %key, "rollout gone");
            return Ok(Requeue::Done);
        };
        let ro = AppRollout::from_object(&obj)?;
        if ro.deleting {
            return Ok(Requeue::Done);
        }

        let mut status = ro.status.clone();
        let target = ro.spec.target_app_revision_name.clone();
        if status.retarget(ro.spec.source_app_revision_name.as_deref().unwrap_or(""), &target) {
            info!(rollout = %key, source = ?ro.spec.source_app_revision_name, %target, "rollout (re)started");
        }
        let mut outcome = if status.rolling_state.is_terminal() {
            Ok(Requeue::Done)
        } else {
            self.rollout_pass(&ro, &mut status, cancel).await
        };
        if let Err(e) = &outcome {
            if e.class() == ErrorClass::UserSpec {
                set_condition(&mut status.conditions, Condition::error(CONDITION_ROLLOUT, "InvalidSpec", e.to_string()));
            }
            warn!(rollout = %key, class = e.class().as_str(), error = %e, "rollout reconcile failed");
        }
        if status != ro.status {
            if let Err(e) = self.persist_status(&r, key, &status).await {
                if outcome.is_ok() {
                    outcome = Err(e);
                } else {
                    warn!(rollout = %key, error = %e, "rollout status not persisted");
                }
            }
        }
        outcome
    }

    async fn rollout_pass(
        &self,
        ro: &AppRollout,
        status: &mut RolloutStatus,
        cancel: &CancellationToken,
    ) -> Result<Requeue, ReconcileError> {
        let key = &ro.key;
        let ns = key.namespace.as_str();
        let invalid = |message: String| ReconcileError::InvalidSpec { key: key.clone(), message };
        if ro.spec.target_app_revision_name.is_empty() {
            return Err(invalid("targetAppRevisionName is required".into()));
        }
        if ro.spec.component_list.len() > 1 {
            return Err(invalid("a rollout moves exactly one component".into()));
        }

        let revisions = RevisionStore::new(self.client.clone());
        let Some(target_rev) = revisions.get(ns, &ro.spec.target_app_revision_name).await? else {
            debug!(rollout = %key, target = %ro.spec.target_app_revision_name, "target revision not built yet");
            return Ok(Requeue::After(self.config.rollout_poll));
        };
        // the target revision has to be dispatched before its workload can move
        let trackers = TrackerStore::new(self.client.clone(), self.config.backoff());
        let Some(target_tracker) = trackers.get(&tracker_name(&target_rev.name, ns)).await? else {
            debug!(rollout = %key, target = %target_rev.name, "target revision not dispatched yet");
            return Ok(Requeue::After(self.config.rollout_poll));
        };
        let source_rev = match ro.spec.source_app_revision_name.as_deref() {
            Some(name) => Some(
                revisions
                    .get(ns, name)
                    .await?
                    .ok_or_else(|| invalid(format!("source revision {} not found", name)))?,
            ),
            None => None,
        };

        let component = match ro.spec.component_list.first() {
            Some(c) => c.clone(),
            None => target_rev
                .manifests
                .iter()
                .find(|m| m.is_workload())
                .map(|m| m.component.clone())
                .ok_or_else(|| invalid(format!("revision {} has no workload", target_rev.name)))?,
        };
        let workload_of = |rev: &ApplicationRevision| -> Result<ResourceRef, ReconcileError> {
            rev.workload_for(&component)
                .map(RenderedManifest::resource_ref)
                .ok_or_else(|| invalid(format!("revision {} has no component {}", rev.name, component)))
        };
        let backoff = self.config.backoff();
        let target = ClusterWorkload::new(self.client.clone(), &self.registry, workload_of(&target_rev)?)?.with_backoff(backoff.clone());
        let source = match &source_rev {
            Some(rev) => Some(ClusterWorkload::new(self.client.clone(), &self.registry, workload_of(rev)?)?.with_backoff(backoff)),
            None => None,
        };

        let rollout = Rollout {
            plan: &ro.spec.rollout_plan,
            source: source.as_ref().map(|s| s as &dyn WorkloadHandle),
            target: &target,
            owner: ro.owner_reference(),
            release_to: Some(target_tracker.owner_reference()),
            deadlines: self.config.deadlines(),
        };
        let mut outcome = StepOutcome::Progressed;
        for _ in 0..MAX_STEPS {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled);
            }
            outcome = rollout.step(status, Utc::now()).await?;
            if outcome != StepOutcome::Progressed {
                break;
            }
        }
        debug!(
            rollout = %key,
            state = ?status.rolling_state,
            batch = status.current_batch,
            batch_state = ?status.batch_rolling_state,
            "rollout stepped"
        );
        Ok(match outcome {
            StepOutcome::Terminal => Requeue::Done,
            StepOutcome::Waiting => Requeue::After(self.config.rollout_poll),
            StepOutcome::Progressed => Requeue::NOW,
        })
    }

    /// Revisions of `app` whose trackers the rollout flow still needs: any
    /// revision an AppRollout in the namespace names, plus any revision whose
    /// workloads still run replicas.
    pub(crate) async fn revisions_held_by_rollouts(
        &self,
        app: &str,
        ns: &str,
        trackers: &TrackerStore,
        current: &ResourceTracker,
    ) -> Result<BTreeSet<String>, ReconcileError> {
        let mut held = BTreeSet::new();
        for obj in self.client.list(API_VERSION, KIND_APP_ROLLOUT, Some(ns), &BTreeMap::new()).await? {
            match AppRollout::from_object(&obj) {
                Ok(ro) => {
                    held.insert(ro.spec.target_app_revision_name);
                    held.extend(ro.spec.source_app_revision_name);
                }
                Err(e) => warn!(namespace = ns, error = %e, "ignoring undecodable rollout"),
            }
        }
        let suffix = format!("-{}", ns);
        for t in trackers.list_for_app(app, ns).await? {
            if t.name == current.name {
                continue;
            }
            let Some(rev) = t.name.strip_suffix(&suffix) else { continue };
            if !held.contains(rev) && self.runs_replicas(&t).await? {
                held.insert(rev.to_string());
            }
        }
        Ok(held)
    }

    async fn runs_replicas(&self, t: &ResourceTracker) -> Result<bool, ReconcileError> {
        for r in &t.tracked {
            let Some(paths) = self.registry.scale_paths(&r.api_version, &r.kind) else { continue };
            let Some(live) = self.client.get(r).await? else { continue };
            // a newer tracker that took the object over answers for it
            let refs = live.metadata.owner_references.as_deref().unwrap_or_default();
            if controller_of(refs).map_or(false, |c| c.uid != t.uid && c.kind != KIND_APP_ROLLOUT) {
                continue;
            }
            let doc = to_json(&live)?;
            if get_path(&doc, &paths.replicas).and_then(Json::as_i64).unwrap_or(0) > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn rollout_status(&self, key: &ObjectKey) -> Result<Option<RolloutStatus>, ReconcileError> {
        match self.client.get(&rollout_ref(key)).await? {
            Some(obj) => Ok(Some(AppRollout::from_object(&obj)?.status)),
            None => Ok(None),
        }
    }
}
