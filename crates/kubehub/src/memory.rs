//! In-process [`ClusterClient`] with API-server semantics that matter to the
//! engine: optimistic concurrency on `resourceVersion`, status written only
//! through `update_status`, and cascading deletion through owner references.
//! Failure and conflict injection make it usable for fault tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use keel_core::{registry::set_path, ResourceRef};
use kube::core::DynamicObject;
use serde_json::Value as Json;
use tracing::trace;

use crate::{labels_match, object_ref, to_json, ClusterClient, ClusterError, ClusterResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
    List,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceRef, DynamicObject>,
    next_rv: u64,
    failures: BTreeMap<(Verb, String), String>,
    conflicts: u32,
    calls: BTreeMap<Verb, u64>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn enter(&mut self, verb: Verb, name: &str) -> ClusterResult<()> {
        *self.calls.entry(verb).or_default() += 1;
        if let Some(msg) = self.failures.get(&(verb, name.to_string())) {
            return Err(ClusterError::Api(msg.clone()));
        }
        if matches!(verb, Verb::Update | Verb::UpdateStatus) && self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(ClusterError::Conflict(format!("injected conflict on {}", name)));
        }
        Ok(())
    }

    fn check_rv(stored: &DynamicObject, incoming: &DynamicObject, r: &ResourceRef) -> ClusterResult<()> {
        match incoming.metadata.resource_version.as_deref() {
            Some(rv) if Some(rv) != stored.metadata.resource_version.as_deref() => {
                Err(ClusterError::Conflict(format!("{} has been modified", r)))
            }
            _ => Ok(()),
        }
    }

    /// Remove dependents whose every owner is gone, until nothing changes.
    fn collect_garbage(&mut self) {
        loop {
            let live: std::collections::BTreeSet<String> =
                self.objects.values().filter_map(|o| o.metadata.uid.clone()).collect();
            let dead: Vec<ResourceRef> = self
                .objects
                .iter()
                .filter(|(_, o)| {
                    let owners = o.metadata.owner_references.as_deref().unwrap_or(&[]);
                    !owners.is_empty() && owners.iter().all(|or| !live.contains(&or.uid))
                })
                .map(|(r, _)| r.clone())
                .collect();
            if dead.is_empty() { break; }
            for r in dead {
                trace!(%r, "cascade delete");
                self.objects.remove(&r);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every `verb` call against objects named `name` fail with an API error.
    pub fn fail_on(&self, verb: Verb, name: &str) {
        self.lock().failures.insert((verb, name.to_string()), format!("injected {:?} failure", verb));
    }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }

    /// The next `n` update or status update calls fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) { self.lock().conflicts = n; }

    pub fn calls(&self, verb: Verb) -> u64 { self.lock().calls.get(&verb).copied().unwrap_or(0) }

    pub fn contains(&self, r: &ResourceRef) -> bool { self.lock().objects.contains_key(r) }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn object(&self, r: &ResourceRef) -> Option<DynamicObject> { self.lock().objects.get(r).cloned() }

    /// Full JSON document of a stored object.
    pub fn json(&self, r: &ResourceRef) -> Option<Json> { self.object(r).and_then(|o| to_json(&o).ok()) }

    pub fn refs_of_kind(&self, kind: &str) -> Vec<ResourceRef> {
        self.lock().objects.keys().filter(|r| r.kind == kind).cloned().collect()
    }

    /// Set a dotted path in an object's data (e.g. `status.readyReplicas`),
    /// simulating another controller's write. Bumps `resourceVersion`.
    pub fn patch_data(&self, r: &ResourceRef, path: &str, value: Json) -> bool {
        let mut inner = self.lock();
        let rv = inner.bump();
        match inner.objects.get_mut(r) {
            Some(o) => {
                o.metadata.resource_version = Some(rv);
                set_path(&mut o.data, path, value)
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, r: &ResourceRef) -> ClusterResult<Option<DynamicObject>> {
        let mut inner = self.lock();
        inner.enter(Verb::Get, &r.name)?;
        Ok(inner.objects.get(r).cloned())
    }

    async fn create(&self, mut obj: DynamicObject) -> ClusterResult<DynamicObject> {
        let r = object_ref(&obj)?;
        let mut inner = self.lock();
        inner.enter(Verb::Create, &r.name)?;
        if inner.objects.contains_key(&r) {
            return Err(ClusterError::AlreadyExists(r.to_string()));
        }
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(r, obj.clone());
        Ok(obj)
    }

    async fn update(&self, mut obj: DynamicObject) -> ClusterResult<DynamicObject> {
        let r = object_ref(&obj)?;
        let mut inner = self.lock();
        inner.enter(Verb::Update, &r.name)?;
        let stored = inner.objects.get(&r).cloned().ok_or_else(|| ClusterError::NotFound(r.to_string()))?;
        Inner::check_rv(&stored, &obj, &r)?;
        obj.metadata.uid = stored.metadata.uid.clone();
        if let Some(map) = obj.data.as_object_mut() {
            match stored.data.get("status") {
                Some(s) => { map.insert("status".into(), s.clone()); }
                None => { map.remove("status"); }
            }
        }
        obj.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(r, obj.clone());
        // owner references may have been rewritten
        inner.collect_garbage();
        Ok(obj)
    }

    async fn update_status(&self, obj: DynamicObject) -> ClusterResult<DynamicObject> {
        let r = object_ref(&obj)?;
        let mut inner = self.lock();
        inner.enter(Verb::UpdateStatus, &r.name)?;
        let mut stored = inner.objects.get(&r).cloned().ok_or_else(|| ClusterError::NotFound(r.to_string()))?;
        Inner::check_rv(&stored, &obj, &r)?;
        let status = obj.data.get("status").cloned().unwrap_or(Json::Null);
        if let Some(map) = stored.data.as_object_mut() {
            map.insert("status".into(), status);
        }
        stored.metadata.resource_version = Some(inner.bump());
        inner.objects.insert(r, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, r: &ResourceRef) -> ClusterResult<()> {
        let mut inner = self.lock();
        inner.enter(Verb::Delete, &r.name)?;
        if inner.objects.remove(r).is_none() {
            return Err(ClusterError::NotFound(r.to_string()));
        }
        inner.collect_garbage();
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<DynamicObject>> {
        let mut inner = self.lock();
        inner.enter(Verb::List, kind)?;
        Ok(inner
            .objects
            .iter()
            .filter(|(r, _)| r.api_version == api_version && r.kind == kind)
            .filter(|(r, _)| namespace.map_or(true, |ns| r.namespace == ns))
            .filter(|(_, o)| labels_match(o.metadata.labels.as_ref(), selector))
            .map(|(_, o)| o.clone())
            .collect())
    }
}
