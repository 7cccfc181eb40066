//! Ownership-checked create-or-merge of one rendered manifest.

use std::sync::Arc;
use std::time::Instant;

use keel_core::meta::{controller_of, set_controller_owner};
use keel_core::registry::{get_path, set_path};
use keel_core::{with_optimistic_retry, Backoff, KindRegistry, RenderedManifest, ResourceRef, ResourceTracker};
use keel_kubehub::{from_json, to_json, ClusterClient, ClusterError};
use metrics::{counter, histogram};
use serde_json::{Map, Value as Json};
use tracing::{debug, trace};

use crate::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Applies manifests on behalf of a tracker. A live object may be taken over
/// only when it has no controller, or is controlled by the current tracker or
/// the previous one.
#[derive(Clone)]
pub struct Applicator {
    client: Arc<dyn ClusterClient>,
    registry: KindRegistry,
    backoff: Backoff,
    preserve_replicas: bool,
    zero_replicas_on_create: bool,
    yield_to: Option<String>,
}

impl Applicator {
    pub fn new(client: Arc<dyn ClusterClient>, registry: KindRegistry) -> Self {
        Self { client, registry, backoff: Backoff::default(), preserve_replicas: false, zero_replicas_on_create: false, yield_to: None }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Keep the live replica count of scalable kinds instead of the rendered one.
    pub fn preserve_replicas(mut self, on: bool) -> Self {
        self.preserve_replicas = on;
        self
    }

    /// Create scalable kinds with zero replicas.
    pub fn zero_replicas_on_create(mut self, on: bool) -> Self {
        self.zero_replicas_on_create = on;
        self
    }

    /// Leave live objects whose controller is of `kind` untouched. They still
    /// count as applied.
    pub fn yield_to(mut self, kind: Option<String>) -> Self {
        self.yield_to = kind;
        self
    }

    pub async fn apply(
        &self,
        m: &RenderedManifest,
        owner: &ResourceTracker,
        previous_uid: Option<&str>,
    ) -> Result<ApplyOutcome, DispatchError> {
        let t0 = Instant::now();
        let r = m.resource_ref();
        let res = with_optimistic_retry(&self.backoff, || self.apply_once(m, &r, owner, previous_uid)).await;
        match &res {
            Ok(outcome) => {
                histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("apply_ok", 1u64);
                trace!(resource = %r, ?outcome, "applied");
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                debug!(resource = %r, error = %e, "apply failed");
            }
        }
        res
    }

    async fn apply_once(
        &self,
        m: &RenderedManifest,
        r: &ResourceRef,
        owner: &ResourceTracker,
        previous_uid: Option<&str>,
    ) -> Result<ApplyOutcome, DispatchError> {
        let failed = |cause: String| DispatchError::Apply { resource: r.clone(), cause };
        let scale = self.registry.scale_paths(&m.api_version, &m.kind);

        let live = match self.client.get(r).await {
            Ok(live) => live,
            Err(e @ ClusterError::Conflict(_)) => return Err(e.into()),
            Err(e) => return Err(failed(e.to_string())),
        };
        let Some(live) = live else {
            let mut desired = from_json(m.body.clone()).map_err(|e| failed(e.to_string()))?;
            desired.metadata.owner_references = Some(vec![owner.owner_reference()]);
            if let (true, Some(paths)) = (self.zero_replicas_on_create, scale) {
                set_path(&mut desired.data, &paths.replicas, Json::from(0));
            }
            return match self.client.create(desired).await {
                Ok(_) => Ok(ApplyOutcome::Created),
                // someone else created it between our get and create; go round again
                Err(ClusterError::AlreadyExists(msg)) => Err(ClusterError::Conflict(msg).into()),
                Err(e) => Err(failed(e.to_string())),
            };
        };

        let refs = live.metadata.owner_references.clone().unwrap_or_default();
        if let Some(c) = controller_of(&refs) {
            if self.yield_to.as_deref() == Some(c.kind.as_str()) {
                trace!(resource = %r, controller = %c.name, "yielding to controller");
                return Ok(ApplyOutcome::Unchanged);
            }
            if c.uid != owner.uid && Some(c.uid.as_str()) != previous_uid {
                return Err(failed(format!("controlled by {} {}", c.kind, c.name)));
            }
        }

        let live_json = to_json(&live).map_err(|e| failed(e.to_string()))?;
        let mut merged = merge(&live_json, &m.body);
        if let Some(meta) = merged.get_mut("metadata").and_then(Json::as_object_mut) {
            let owners = set_controller_owner(&refs, owner.owner_reference());
            meta.insert("ownerReferences".into(), serde_json::to_value(owners).map_err(|e| failed(e.to_string()))?);
        }
        if let (true, Some(paths)) = (self.preserve_replicas, scale) {
            if let Some(n) = get_path(&live_json, &paths.replicas).cloned() {
                set_path(&mut merged, &paths.replicas, n);
            }
        }
        if merged == live_json {
            return Ok(ApplyOutcome::Unchanged);
        }
        let obj = from_json(merged).map_err(|e| failed(e.to_string()))?;
        match self.client.update(obj).await {
            Ok(_) => Ok(ApplyOutcome::Updated),
            Err(e @ ClusterError::Conflict(_)) => Err(e.into()),
            Err(e) => Err(failed(e.to_string())),
        }
    }
}

/// Desired top-level fields replace live ones. In `metadata`, labels and
/// annotations are merged key by key and server-populated fields are kept.
/// `status` always comes from the live object.
pub fn merge(live: &Json, desired: &Json) -> Json {
    let mut out = live.clone();
    let (Some(out_map), Some(want)) = (out.as_object_mut(), desired.as_object()) else {
        return live.clone();
    };
    for (k, v) in want {
        match k.as_str() {
            "status" => {}
            "metadata" => {
                let meta = out_map.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
                if let (Some(meta), Some(want_meta)) = (meta.as_object_mut(), v.as_object()) {
                    merge_metadata(meta, want_meta);
                }
            }
            _ => {
                out_map.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

fn merge_metadata(meta: &mut Map<String, Json>, want: &Map<String, Json>) {
    for (k, v) in want {
        match k.as_str() {
            "labels" | "annotations" => {
                let slot = meta.entry(k.clone()).or_insert_with(|| Json::Object(Map::new()));
                match (slot.as_object_mut(), v.as_object()) {
                    (Some(cur), Some(add)) => {
                        for (lk, lv) in add {
                            cur.insert(lk.clone(), lv.clone());
                        }
                    }
                    _ => *slot = v.clone(),
                }
            }
            "uid" | "resourceVersion" | "generation" | "creationTimestamp" | "managedFields" | "ownerReferences" => {}
            _ => {
                meta.insert(k.clone(), v.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_replaces_spec_and_unions_labels() {
        let live = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "uid": "u1", "resourceVersion": "7", "labels": { "team": "a", "app": "old" } },
            "spec": { "replicas": 5, "paused": true },
            "status": { "readyReplicas": 5 }
        });
        let desired = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "uid": "bogus", "labels": { "app": "new" } },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 0 }
        });
        let out = merge(&live, &desired);
        assert_eq!(out["spec"], json!({ "replicas": 2 }));
        assert_eq!(out["metadata"]["labels"], json!({ "team": "a", "app": "new" }));
        assert_eq!(out["metadata"]["uid"], "u1");
        assert_eq!(out["metadata"]["resourceVersion"], "7");
        assert_eq!(out["status"]["readyReplicas"], 5);
        assert_eq!(merge(&live, &live), live);
    }
}
