//! ApplicationRevision objects in the cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use keel_core::{labels, ApplicationRevision, RenderedManifest, ResourceRef, API_VERSION, KIND_APP_REVISION};
use keel_kubehub::{new_object, ClusterClient, ClusterError};
use kube::core::DynamicObject;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use crate::RevisionError;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevisionSpec {
    app_name: String,
    revision: u64,
    content_hash: String,
    #[serde(default)]
    manifests: Vec<RenderedManifest>,
    #[serde(default)]
    appfile: Json,
}

#[derive(Clone)]
pub struct RevisionStore {
    client: Arc<dyn ClusterClient>,
}

impl RevisionStore {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self { Self { client } }

    /// Revisions of `app`, oldest first.
    pub async fn list(&self, app: &str, namespace: &str) -> Result<Vec<ApplicationRevision>, RevisionError> {
        let mut selector = BTreeMap::new();
        selector.insert(labels::APP_NAME.to_string(), app.to_string());
        let objs = self.client.list(API_VERSION, KIND_APP_REVISION, Some(namespace), &selector).await?;
        let mut out = objs.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|r| r.revision);
        Ok(out)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Option<ApplicationRevision>, RevisionError> {
        let r = ResourceRef::new(API_VERSION, KIND_APP_REVISION, namespace, name);
        match self.client.get(&r).await? {
            Some(obj) => Ok(Some(decode(&obj)?)),
            None => Ok(None),
        }
    }

    /// Create the revision object. Losing a create race is reported as a
    /// conflict so the caller can rebuild from fresh history.
    pub async fn persist(&self, rev: &ApplicationRevision) -> Result<(), RevisionError> {
        match self.client.create(encode(rev)?).await {
            Ok(_) => {
                counter!("revision_created_total", 1u64);
                info!(revision = %rev.name, hash = %rev.content_hash, "revision created");
                Ok(())
            }
            Err(ClusterError::AlreadyExists(_)) => Err(RevisionError::Conflict(rev.name.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete all but the newest `keep` revisions, skipping names in `in_use`.
    /// Returns the deleted names.
    pub async fn prune(
        &self,
        app: &str,
        namespace: &str,
        keep: usize,
        in_use: &BTreeSet<String>,
    ) -> Result<Vec<String>, RevisionError> {
        let mut all = self.list(app, namespace).await?;
        all.reverse();
        let mut pruned = Vec::new();
        for rev in all.into_iter().skip(keep.max(1)) {
            if in_use.contains(&rev.name) { continue; }
            let r = ResourceRef::new(API_VERSION, KIND_APP_REVISION, namespace, &rev.name);
            match self.client.delete(&r).await {
                Ok(()) | Err(ClusterError::NotFound(_)) => {
                    counter!("revision_pruned_total", 1u64);
                    pruned.push(rev.name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        if !pruned.is_empty() {
            debug!(app, namespace, pruned = pruned.len(), "old revisions pruned");
        }
        Ok(pruned)
    }
}

fn encode(rev: &ApplicationRevision) -> Result<DynamicObject, RevisionError> {
    let mut obj = new_object(API_VERSION, KIND_APP_REVISION, &rev.namespace, &rev.name);
    let mut l = BTreeMap::new();
    l.insert(labels::APP_NAME.to_string(), rev.app_name.clone());
    obj.metadata.labels = Some(l);
    let spec = RevisionSpec {
        app_name: rev.app_name.clone(),
        revision: rev.revision,
        content_hash: rev.content_hash.clone(),
        manifests: rev.manifests.clone(),
        appfile: rev.source_appfile.clone(),
    };
    let spec = serde_json::to_value(spec).map_err(|e| RevisionError::Decode { name: rev.name.clone(), message: e.to_string() })?;
    obj.data = serde_json::json!({ "spec": spec });
    Ok(obj)
}

fn decode(obj: &DynamicObject) -> Result<ApplicationRevision, RevisionError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let spec = obj.data.get("spec").cloned().unwrap_or(Json::Null);
    let spec: RevisionSpec =
        serde_json::from_value(spec).map_err(|e| RevisionError::Decode { name: name.clone(), message: e.to_string() })?;
    Ok(ApplicationRevision {
        name,
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        app_name: spec.app_name,
        revision: spec.revision,
        content_hash: spec.content_hash,
        manifests: spec.manifests,
        source_appfile: spec.appfile,
    })
}
