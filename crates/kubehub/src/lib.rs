//! Keel kubehub: the cluster collaborator the engine calls outward through.
//!
//! [`ClusterClient`] is the narrow get/create/update/delete/list surface the
//! dispatcher, revision store and rollout handles are written against.
//! [`KubeCluster`] talks to a real API server via kube-rs; [`MemoryCluster`]
//! is a faithful in-process stand-in used by tests and offline tooling.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use keel_core::{ResourceRef, Retryable};
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use serde_json::Value as Json;

mod cluster;
pub mod memory;
pub mod watch;

pub use cluster::KubeCluster;
pub use memory::MemoryCluster;
pub use watch::{watch_keys, ObjectKey};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("kind not served: {0}")]
    UnknownKind(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("api: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }

    /// Conflicts and transport failures are worth retrying; everything else is not.
    pub fn is_transient(&self) -> bool { matches!(self, ClusterError::Conflict(_) | ClusterError::Api(_)) }
}

impl Retryable for ClusterError {
    fn is_conflict(&self) -> bool { matches!(self, ClusterError::Conflict(_)) }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Outward cluster interface. `update` is optimistic: it fails with
/// [`ClusterError::Conflict`] when `metadata.resourceVersion` is stale.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(&self, r: &ResourceRef) -> ClusterResult<Option<DynamicObject>>;
    async fn create(&self, obj: DynamicObject) -> ClusterResult<DynamicObject>;
    async fn update(&self, obj: DynamicObject) -> ClusterResult<DynamicObject>;
    /// Write only the `status` stanza of `obj`.
    async fn update_status(&self, obj: DynamicObject) -> ClusterResult<DynamicObject>;
    async fn delete(&self, r: &ResourceRef) -> ClusterResult<()>;
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<DynamicObject>>;
}

/// Empty object of the given kind.
pub fn new_object(api_version: &str, kind: &str, namespace: &str, name: &str) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: if namespace.is_empty() { None } else { Some(namespace.to_string()) },
            ..Default::default()
        },
        data: Json::Object(serde_json::Map::new()),
    }
}

/// Decode a full object document (`apiVersion`, `kind`, `metadata`, ...).
pub fn from_json(v: Json) -> ClusterResult<DynamicObject> {
    let obj: DynamicObject = serde_json::from_value(v).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    if obj.types.is_none() { return Err(ClusterError::Invalid("missing apiVersion/kind".into())); }
    if obj.metadata.name.as_deref().unwrap_or("").is_empty() { return Err(ClusterError::Invalid("missing metadata.name".into())); }
    Ok(obj)
}

pub fn to_json(obj: &DynamicObject) -> ClusterResult<Json> {
    serde_json::to_value(obj).map_err(|e| ClusterError::Invalid(e.to_string()))
}

pub fn object_ref(obj: &DynamicObject) -> ClusterResult<ResourceRef> {
    let types = obj.types.as_ref().ok_or_else(|| ClusterError::Invalid("missing apiVersion/kind".into()))?;
    let name = obj.metadata.name.clone().ok_or_else(|| ClusterError::Invalid("missing metadata.name".into()))?;
    Ok(ResourceRef {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name,
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
    })
}

pub fn label_selector(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// `true` when every selector pair is present in `labels`.
pub fn labels_match(labels: Option<&BTreeMap<String, String>>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}
