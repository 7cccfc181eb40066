//! Typed views over the Application and AppRollout objects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::{labels, Condition, API_VERSION, KIND_APP_ROLLOUT};
use keel_kubehub::ObjectKey;
use keel_rollout::{RolloutPlan, RolloutStatus};
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::ReconcileError;

pub const CONDITION_PARSED: &str = "Parsed";
pub const CONDITION_BUILT: &str = "Built";
pub const CONDITION_APPLIED: &str = "Applied";
pub const CONDITION_HEALTHY: &str = "HealthCheck";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppPhase {
    #[default]
    Rendering,
    Parsed,
    Built,
    Applied,
    HealthCheck,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestRevision {
    pub name: String,
    pub revision: u64,
    pub revision_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub phase: AppPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_revision: Option<LatestRevision>,
    #[serde(default)]
    pub services: Vec<ServiceHealth>,
}

#[derive(Debug, Clone)]
pub struct Application {
    pub key: ObjectKey,
    pub deleting: bool,
    /// Annotated as a rollout template: workloads are revision suffixed and
    /// their replicas belong to an AppRollout.
    pub rollout_template: bool,
    pub spec: Json,
    pub status: AppStatus,
}

impl Application {
    pub fn from_object(obj: &DynamicObject) -> Result<Self, ReconcileError> {
        let key = key_of(obj);
        let rollout_template = obj
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(labels::ROLLOUT_TEMPLATE))
            .map_or(false, |v| v == "true");
        Ok(Self {
            deleting: obj.metadata.deletion_timestamp.is_some(),
            rollout_template,
            spec: obj.data.get("spec").cloned().unwrap_or(Json::Null),
            status: field(obj, "status", &key)?,
            key,
        })
    }

    /// The document handed to the appfile parser: the spec plus the
    /// application name.
    pub fn appfile_source(&self) -> Json {
        match &self.spec {
            Json::Object(m) => {
                let mut doc = m.clone();
                doc.insert("name".into(), Json::from(self.key.name.clone()));
                Json::Object(doc)
            }
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRolloutSpec {
    #[serde(default)]
    pub source_app_revision_name: Option<String>,
    pub target_app_revision_name: String,
    #[serde(default)]
    pub component_list: Vec<String>,
    #[serde(default)]
    pub rollout_plan: RolloutPlan,
}

#[derive(Debug, Clone)]
pub struct AppRollout {
    pub key: ObjectKey,
    pub uid: String,
    pub deleting: bool,
    pub spec: AppRolloutSpec,
    pub status: RolloutStatus,
}

impl AppRollout {
    pub fn from_object(obj: &DynamicObject) -> Result<Self, ReconcileError> {
        let key = key_of(obj);
        let mut spec: AppRolloutSpec = field(obj, "spec", &key)?;
        if spec.source_app_revision_name.as_deref() == Some("") {
            spec.source_app_revision_name = None;
        }
        Ok(Self {
            uid: obj.metadata.uid.clone().unwrap_or_default(),
            deleting: obj.metadata.deletion_timestamp.is_some(),
            status: field(obj, "status", &key)?,
            spec,
            key,
        })
    }

    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: API_VERSION.to_string(),
            kind: KIND_APP_ROLLOUT.to_string(),
            name: self.key.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

fn key_of(obj: &DynamicObject) -> ObjectKey {
    ObjectKey::new(obj.metadata.namespace.clone().unwrap_or_default(), obj.metadata.name.clone().unwrap_or_default())
}

/// Decode a top-level stanza, defaulting when it is absent.
fn field<T: DeserializeOwned + Default>(obj: &DynamicObject, name: &str, key: &ObjectKey) -> Result<T, ReconcileError> {
    match obj.data.get(name) {
        None | Some(Json::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| ReconcileError::Decode { key: key.clone(), message: format!("{}: {}", name, e) }),
    }
}

/// Replace the `status` stanza of `obj`.
pub fn set_status<T: Serialize>(obj: &mut DynamicObject, status: &T) -> Result<(), ReconcileError> {
    let v = serde_json::to_value(status).map_err(|e| ReconcileError::Decode { key: key_of(obj), message: e.to_string() })?;
    if let Some(map) = obj.data.as_object_mut() {
        map.insert("status".into(), v);
    } else {
        obj.data = serde_json::json!({ "status": v });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kubehub::from_json;
    use serde_json::json;

    #[test]
    fn application_view() {
        let obj = from_json(json!({
            "apiVersion": API_VERSION,
            "kind": "Application",
            "metadata": { "name": "shop", "namespace": "default", "annotations": { labels::ROLLOUT_TEMPLATE: "true" } },
            "spec": { "services": { "web": { "type": "worker", "image": "x" } } },
            "status": { "phase": "running", "latestRevision": { "name": "shop-v2", "revision": 2, "revisionHash": "h" } }
        }))
        .unwrap();
        let app = Application::from_object(&obj).unwrap();
        assert!(app.rollout_template);
        assert_eq!(app.status.phase, AppPhase::Running);
        assert_eq!(app.status.latest_revision.as_ref().map(|r| r.revision), Some(2));
        assert_eq!(app.appfile_source()["name"], "shop");
        assert_eq!(app.appfile_source()["services"]["web"]["type"], "worker");
    }

    #[test]
    fn rollout_view() {
        let obj = from_json(json!({
            "apiVersion": API_VERSION,
            "kind": KIND_APP_ROLLOUT,
            "metadata": { "name": "ro", "namespace": "default", "uid": "u1" },
            "spec": {
                "sourceAppRevisionName": "",
                "targetAppRevisionName": "shop-v2",
                "componentList": ["web"],
                "rolloutPlan": { "numBatches": 2 }
            }
        }))
        .unwrap();
        let ro = AppRollout::from_object(&obj).unwrap();
        assert_eq!(ro.spec.source_app_revision_name, None);
        assert_eq!(ro.spec.rollout_plan.num_batches, Some(2));
        assert_eq!(ro.status, RolloutStatus::default());
        assert_eq!(ro.owner_reference().uid, "u1");

        let bad = from_json(json!({
            "apiVersion": API_VERSION,
            "kind": KIND_APP_ROLLOUT,
            "metadata": { "name": "ro", "namespace": "default" },
            "spec": { "componentList": "web" }
        }))
        .unwrap();
        assert!(matches!(AppRollout::from_object(&bad), Err(ReconcileError::Decode { .. })));
    }
}
