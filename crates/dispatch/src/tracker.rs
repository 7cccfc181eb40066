//! ResourceTracker objects: cluster-scoped records of what a revision applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{labels, with_optimistic_retry, Backoff, ResourceRef, ResourceTracker, API_VERSION, KIND_RESOURCE_TRACKER};
use keel_kubehub::{new_object, ClusterClient, ClusterError};
use kube::core::DynamicObject;
use serde_json::json;
use tracing::debug;

use crate::DispatchError;

fn tracker_ref(name: &str) -> ResourceRef { ResourceRef::new(API_VERSION, KIND_RESOURCE_TRACKER, "", name) }

pub(crate) fn encode(t: &ResourceTracker) -> DynamicObject {
    let mut obj = new_object(API_VERSION, KIND_RESOURCE_TRACKER, "", &t.name);
    obj.metadata.labels = Some(t.labels.clone());
    obj.metadata.resource_version = t.resource_version.clone();
    if !t.uid.is_empty() { obj.metadata.uid = Some(t.uid.clone()); }
    obj.data = json!({ "spec": { "trackedResources": t.tracked } });
    obj
}

pub fn decode(obj: &DynamicObject) -> Result<ResourceTracker, DispatchError> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    let tracked = match obj.data.pointer("/spec/trackedResources") {
        Some(v) => serde_json::from_value::<Vec<ResourceRef>>(v.clone())
            .map_err(|e| DispatchError::Decode { name: name.clone(), message: e.to_string() })?,
        None => Vec::new(),
    };
    Ok(ResourceTracker {
        name,
        uid: obj.metadata.uid.clone().unwrap_or_default(),
        resource_version: obj.metadata.resource_version.clone(),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        tracked,
    })
}

/// Tracker reads and writes. Writes are read-modify-write cycles retried on
/// conflict.
#[derive(Clone)]
pub struct TrackerStore {
    client: Arc<dyn ClusterClient>,
    backoff: Backoff,
}

impl TrackerStore {
    pub fn new(client: Arc<dyn ClusterClient>, backoff: Backoff) -> Self { Self { client, backoff } }

    pub async fn get(&self, name: &str) -> Result<Option<ResourceTracker>, DispatchError> {
        match self.client.get(&tracker_ref(name)).await? {
            Some(obj) => Ok(Some(decode(&obj)?)),
            None => Ok(None),
        }
    }

    /// Get the tracker, creating it when absent. Losing a create race falls
    /// back to reading the winner's object.
    pub async fn acquire(&self, name: &str, app: &str, namespace: &str) -> Result<ResourceTracker, DispatchError> {
        if let Some(t) = self.get(name).await? {
            return Ok(t);
        }
        let mut t = ResourceTracker::new(name);
        t.labels.insert(labels::APP_NAME.to_string(), app.to_string());
        t.labels.insert(labels::APP_NAMESPACE.to_string(), namespace.to_string());
        match self.client.create(encode(&t)).await {
            Ok(obj) => {
                debug!(tracker = name, "tracker created");
                decode(&obj)
            }
            Err(ClusterError::AlreadyExists(_)) => {
                self.get(name).await?.ok_or_else(|| DispatchError::TrackerNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Union `refs` into the tracker's tracked set.
    pub async fn record(&self, name: &str, refs: &[ResourceRef]) -> Result<ResourceTracker, DispatchError> {
        with_optimistic_retry(&self.backoff, || self.record_once(name, refs)).await
    }

    async fn record_once(&self, name: &str, refs: &[ResourceRef]) -> Result<ResourceTracker, DispatchError> {
        let mut t = self.get(name).await?.ok_or_else(|| DispatchError::TrackerNotFound(name.to_string()))?;
        let mut changed = false;
        for r in refs {
            changed |= t.track(r.clone());
        }
        if !changed {
            return Ok(t);
        }
        let obj = self.client.update(encode(&t)).await?;
        decode(&obj)
    }

    /// Trackers belonging to one application.
    pub async fn list_for_app(&self, app: &str, namespace: &str) -> Result<Vec<ResourceTracker>, DispatchError> {
        let mut selector = BTreeMap::new();
        selector.insert(labels::APP_NAME.to_string(), app.to_string());
        selector.insert(labels::APP_NAMESPACE.to_string(), namespace.to_string());
        let objs = self.client.list(API_VERSION, KIND_RESOURCE_TRACKER, None, &selector).await?;
        let mut out = objs.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Delete a tracker; absence counts as success.
    pub async fn delete(&self, name: &str) -> Result<(), DispatchError> {
        match self.client.delete(&tracker_ref(name)).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kubehub::{memory::Verb, MemoryCluster};
    use std::time::Duration;

    fn quick() -> Backoff { Backoff { steps: 4, initial: Duration::from_millis(1), factor: 2, max: Duration::from_millis(4) } }

    #[tokio::test]
    async fn acquire_is_idempotent_and_record_dedups() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = TrackerStore::new(cluster.clone(), quick());
        let t = store.acquire("app-v1-ns", "app", "ns").await.unwrap();
        assert!(!t.uid.is_empty());
        let stored = cluster.json(&tracker_ref("app-v1-ns")).unwrap();
        assert_eq!(stored.pointer("/spec/trackedResources"), Some(&json!([])));
        let again = store.acquire("app-v1-ns", "app", "ns").await.unwrap();
        assert_eq!(again.uid, t.uid);
        assert_eq!(cluster.calls(Verb::Create), 1);

        let a = ResourceRef::new("v1", "ConfigMap", "ns", "a");
        let b = ResourceRef::new("v1", "ConfigMap", "ns", "b");
        store.record("app-v1-ns", &[a.clone(), b.clone()]).await.unwrap();
        let t = store.record("app-v1-ns", &[b.clone(), a.clone()]).await.unwrap();
        assert_eq!(t.tracked, vec![a, b]);
        assert_eq!(cluster.calls(Verb::Update), 1);
    }

    #[tokio::test]
    async fn record_survives_conflicts() {
        let cluster = Arc::new(MemoryCluster::new());
        let store = TrackerStore::new(cluster.clone(), quick());
        store.acquire("t", "app", "ns").await.unwrap();
        cluster.inject_conflicts(2);
        let t = store.record("t", &[ResourceRef::new("v1", "Secret", "ns", "s")]).await.unwrap();
        assert_eq!(t.tracked.len(), 1);
        assert_eq!(cluster.calls(Verb::Update), 3);
        assert_eq!(store.list_for_app("app", "ns").await.unwrap().len(), 1);
        assert!(store.list_for_app("app", "other").await.unwrap().is_empty());
        store.delete("t").await.unwrap();
        store.delete("t").await.unwrap();
    }
}
