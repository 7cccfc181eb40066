//! Explicit kind registry: `(apiVersion, kind)` to scope and scale metadata.
//! Passed by value into the renderer, dispatcher and rollout handles.

use std::collections::BTreeMap;

use serde_json::Value as Json;

/// Dotted paths to the replica fields of a scalable workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalePaths {
    pub replicas: String,
    pub ready_replicas: String,
}

impl ScalePaths {
    fn standard() -> Self {
        Self { replicas: "spec.replicas".into(), ready_replicas: "status.readyReplicas".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindInfo {
    pub namespaced: bool,
    pub scale: Option<ScalePaths>,
}

#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<(String, String), KindInfo>,
}

impl KindRegistry {
    pub fn empty() -> Self { Self::default() }

    /// Registry preloaded with the core workload kinds and the engine's own kinds.
    pub fn builtin() -> Self {
        let mut r = Self::empty();
        for (av, kind) in [
            ("v1", "ConfigMap"),
            ("v1", "Secret"),
            ("v1", "Service"),
            ("v1", "ServiceAccount"),
            ("v1", "PersistentVolumeClaim"),
            ("apps/v1", "DaemonSet"),
            ("batch/v1", "Job"),
            ("batch/v1", "CronJob"),
            ("networking.k8s.io/v1", "Ingress"),
            ("autoscaling/v2", "HorizontalPodAutoscaler"),
            (crate::API_VERSION, crate::KIND_APPLICATION),
            (crate::API_VERSION, crate::KIND_APP_REVISION),
            (crate::API_VERSION, crate::KIND_APP_ROLLOUT),
            (crate::API_VERSION, crate::KIND_WORKLOAD_DEFINITION),
            (crate::API_VERSION, crate::KIND_TRAIT_DEFINITION),
        ] {
            r.register(av, kind, KindInfo { namespaced: true, scale: None });
        }
        for (av, kind) in [
            ("apps/v1", "Deployment"),
            ("apps/v1", "StatefulSet"),
            ("apps/v1", "ReplicaSet"),
            ("apps.kruise.io/v1alpha1", "CloneSet"),
        ] {
            r.register(av, kind, KindInfo { namespaced: true, scale: Some(ScalePaths::standard()) });
        }
        for (av, kind) in [
            ("v1", "Namespace"),
            ("rbac.authorization.k8s.io/v1", "ClusterRole"),
            ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
            (crate::API_VERSION, crate::KIND_RESOURCE_TRACKER),
        ] {
            r.register(av, kind, KindInfo { namespaced: false, scale: None });
        }
        r
    }

    pub fn register(&mut self, api_version: &str, kind: &str, info: KindInfo) {
        self.kinds.insert((api_version.to_string(), kind.to_string()), info);
    }

    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<&KindInfo> {
        self.kinds.get(&(api_version.to_string(), kind.to_string()))
    }

    /// Unknown kinds are treated as namespaced.
    pub fn is_namespaced(&self, api_version: &str, kind: &str) -> bool {
        self.lookup(api_version, kind).map(|k| k.namespaced).unwrap_or(true)
    }

    pub fn scale_paths(&self, api_version: &str, kind: &str) -> Option<&ScalePaths> {
        self.lookup(api_version, kind).and_then(|k| k.scale.as_ref())
    }
}

/// Follow a dotted path like `status.readyReplicas`.
pub fn get_path<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() { return None; }
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

/// Set a dotted path, creating intermediate objects. Returns `false` when a
/// non-object value sits in the way.
pub fn set_path(root: &mut Json, path: &str, value: Json) -> bool {
    let segs: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segs.split_last() else { return false };
    let mut cur = root;
    for seg in parents {
        let Some(obj) = cur.as_object_mut() else { return false };
        cur = obj.entry(seg.to_string()).or_insert_with(|| Json::Object(serde_json::Map::new()));
    }
    match cur.as_object_mut() {
        Some(obj) => { obj.insert(last.to_string(), value); true }
        None => false,
    }
}
