//! Keel core types shared by the render, dispatch and rollout crates.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};

pub mod meta;
pub mod registry;
pub mod retry;

pub use meta::{Condition, ConditionStatus};
pub use registry::{KindInfo, KindRegistry, ScalePaths};
pub use retry::{with_optimistic_retry, Backoff, Retryable};

/// API group/version of every object kind owned by the engine.
pub const API_VERSION: &str = "core.oam.dev/v1beta1";

pub const KIND_APPLICATION: &str = "Application";
pub const KIND_APP_REVISION: &str = "ApplicationRevision";
pub const KIND_RESOURCE_TRACKER: &str = "ResourceTracker";
pub const KIND_APP_ROLLOUT: &str = "AppRollout";
pub const KIND_WORKLOAD_DEFINITION: &str = "WorkloadDefinition";
pub const KIND_TRAIT_DEFINITION: &str = "TraitDefinition";

/// Well-known label and annotation keys.
pub mod labels {
    pub const APP_NAME: &str = "app.oam.dev/name";
    pub const APP_NAMESPACE: &str = "app.oam.dev/namespace";
    pub const APP_COMPONENT: &str = "app.oam.dev/component";
    pub const APP_REVISION: &str = "app.oam.dev/appRevision";
    pub const WORKLOAD_TYPE: &str = "workload.oam.dev/type";
    pub const TRAIT_TYPE: &str = "trait.oam.dev/type";
    pub const TRAIT_RESOURCE: &str = "trait.oam.dev/resource";
    /// Annotation switching an application into rollout mode.
    pub const ROLLOUT_TEMPLATE: &str = "app.oam.dev/rollout-template";
}

/// Structural reference to a cluster object. Equality covers all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    /// Empty for cluster-scoped objects.
    #[serde(default)]
    pub namespace: String,
}

impl ResourceRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), name: name.into(), namespace: namespace.into() }
    }

    /// Split `apiVersion` into `(group, version)`; the core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    pub fn namespace_opt(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(self.namespace.as_str()) }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} {}", self.api_version, self.kind, self.name)
        } else {
            write!(f, "{}/{} {}/{}", self.api_version, self.kind, self.namespace, self.name)
        }
    }
}

/// Where a rendered manifest came from inside its component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum ManifestRole {
    Workload,
    Trait {
        #[serde(rename = "traitType")]
        trait_type: String,
    },
    Auxiliary {
        #[serde(rename = "ownerType")]
        owner_type: String,
        output: String,
    },
}

/// One concrete object produced by a render pass. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedManifest {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Full object document including `apiVersion`, `kind` and `metadata`.
    pub body: serde_json::Value,
    /// Labels identifying the owning application/component.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub component: String,
    #[serde(flatten)]
    pub role: ManifestRole,
}

impl RenderedManifest {
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(&self.api_version, &self.kind, &self.namespace, &self.name)
    }

    pub fn is_workload(&self) -> bool { matches!(self.role, ManifestRole::Workload) }
}

/// Immutable, hashed snapshot of one rendering of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRevision {
    pub name: String,
    pub namespace: String,
    pub app_name: String,
    pub revision: u64,
    pub content_hash: String,
    pub manifests: Vec<RenderedManifest>,
    pub source_appfile: serde_json::Value,
}

impl ApplicationRevision {
    pub fn workload_for(&self, component: &str) -> Option<&RenderedManifest> {
        self.manifests.iter().find(|m| m.component == component && m.is_workload())
    }
}

/// `<app>-v<N>`
pub fn revision_name(app: &str, revision: u64) -> String {
    format!("{}-v{}", app, revision)
}

/// Numeric suffix of a revision name produced by [`revision_name`].
pub fn parse_revision_num(name: &str) -> Option<u64> {
    let (_, tail) = name.rsplit_once("-v")?;
    tail.parse().ok()
}

/// Tracker names are derived from the revision name and namespace so they can
/// always be recomputed without a side table.
pub fn tracker_name(revision: &str, namespace: &str) -> String {
    format!("{}-{}", revision, namespace)
}

/// Recover the application name from a tracker name built by [`tracker_name`].
pub fn app_name_from_tracker(tracker: &str, namespace: &str) -> Option<String> {
    let rev = tracker.strip_suffix(namespace)?.strip_suffix('-')?;
    let (app, tail) = rev.rsplit_once("-v")?;
    if tail.is_empty() || !tail.bytes().all(|b| b.is_ascii_digit()) { return None; }
    Some(app.to_string())
}

/// Record of the cluster resources dispatched for one revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTracker {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Insertion ordered, deduplicated by [`ResourceRef`] equality.
    #[serde(default)]
    pub tracked: Vec<ResourceRef>,
}

impl ResourceTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn tracks(&self, r: &ResourceRef) -> bool { self.tracked.iter().any(|t| t == r) }

    /// Returns `true` when the reference was not tracked before.
    pub fn track(&mut self, r: ResourceRef) -> bool {
        if self.tracks(&r) { return false; }
        self.tracked.push(r);
        true
    }

    /// Resources tracked here but not by `current`.
    pub fn orphans(&self, current: &ResourceTracker) -> Vec<ResourceRef> {
        self.tracked.iter().filter(|r| !current.tracks(r)).cloned().collect()
    }

    /// Controller owner reference pointing at this tracker.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND_RESOURCE_TRACKER.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

pub mod prelude {
    pub use super::{
        labels, ApplicationRevision, Condition, ConditionStatus, KindRegistry, ManifestRole, RenderedManifest,
        ResourceRef, ResourceTracker,
    };
}
