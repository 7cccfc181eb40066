//! kube-rs backed [`ClusterClient`].

use std::collections::BTreeMap;

use anyhow::Result;
use keel_core::ResourceRef;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{DynamicObject, GroupVersionKind, TypeMeta},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{label_selector, ClusterClient, ClusterError, ClusterResult};

pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Discovery>,
}

impl KubeCluster {
    /// Connect with the default kubeconfig/in-cluster config and run discovery once.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Self::with_client(client).await
    }

    pub async fn with_client(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;
        info!(groups = discovery.groups().count(), "discovery complete");
        Ok(Self { client, discovery: RwLock::new(discovery) })
    }

    pub fn client(&self) -> Client { self.client.clone() }

    fn gvk(api_version: &str, kind: &str) -> GroupVersionKind {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        GroupVersionKind { group, version, kind: kind.to_string() }
    }

    pub(crate) async fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> ClusterResult<Api<DynamicObject>> {
        let gvk = Self::gvk(api_version, kind);
        let mut found = self.discovery.read().await.resolve_gvk(&gvk);
        if found.is_none() {
            // CRDs installed after startup show up only after a fresh discovery run
            debug!(api_version, kind, "gvk not in discovery cache; refreshing");
            let fresh = Discovery::new(self.client.clone()).run().await.map_err(map_err)?;
            found = fresh.resolve_gvk(&gvk);
            *self.discovery.write().await = fresh;
        }
        let (ar, caps) = found.ok_or_else(|| ClusterError::UnknownKind(format!("{}/{}", api_version, kind)))?;
        let api = if matches!(caps.scope, Scope::Namespaced) {
            match namespace {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        Ok(api)
    }

    async fn api_for_ref(&self, r: &ResourceRef) -> ClusterResult<Api<DynamicObject>> {
        self.api(&r.api_version, &r.kind, r.namespace_opt()).await
    }
}

fn map_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => ClusterError::AlreadyExists(ae.message),
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message),
        kube::Error::Api(ae) if ae.code == 422 || ae.code == 400 => ClusterError::Invalid(ae.message),
        other => ClusterError::Api(other.to_string()),
    }
}

fn name_of(obj: &DynamicObject) -> ClusterResult<String> {
    obj.metadata.name.clone().ok_or_else(|| ClusterError::Invalid("missing metadata.name".into()))
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, r: &ResourceRef) -> ClusterResult<Option<DynamicObject>> {
        let api = self.api_for_ref(r).await?;
        let mut obj = api.get_opt(&r.name).await.map_err(map_err)?;
        if let Some(o) = obj.as_mut() {
            o.types.get_or_insert_with(|| TypeMeta { api_version: r.api_version.clone(), kind: r.kind.clone() });
        }
        Ok(obj)
    }

    async fn create(&self, obj: DynamicObject) -> ClusterResult<DynamicObject> {
        let r = crate::object_ref(&obj)?;
        let api = self.api_for_ref(&r).await?;
        counter!("cluster_create_total", 1u64);
        api.create(&PostParams::default(), &obj).await.map_err(map_err)
    }

    async fn update(&self, obj: DynamicObject) -> ClusterResult<DynamicObject> {
        let r = crate::object_ref(&obj)?;
        let api = self.api_for_ref(&r).await?;
        counter!("cluster_update_total", 1u64);
        api.replace(&name_of(&obj)?, &PostParams::default(), &obj).await.map_err(map_err)
    }

    async fn update_status(&self, obj: DynamicObject) -> ClusterResult<DynamicObject> {
        let r = crate::object_ref(&obj)?;
        let api = self.api_for_ref(&r).await?;
        // resourceVersion in a merge patch makes the write optimistic
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": obj.data.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        counter!("cluster_update_status_total", 1u64);
        api.patch_status(&r.name, &PatchParams::default(), &Patch::Merge(&patch)).await.map_err(map_err)
    }

    async fn delete(&self, r: &ResourceRef) -> ClusterResult<()> {
        let api = self.api_for_ref(r).await?;
        counter!("cluster_delete_total", 1u64);
        api.delete(&r.name, &DeleteParams::background()).await.map_err(map_err)?;
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        selector: &BTreeMap<String, String>,
    ) -> ClusterResult<Vec<DynamicObject>> {
        let api = self.api(api_version, kind, namespace).await?;
        let mut lp = ListParams::default();
        if !selector.is_empty() { lp = lp.labels(&label_selector(selector)); }
        let list = api.list(&lp).await.map_err(map_err)?;
        // list items frequently come back without apiVersion/kind
        Ok(list
            .items
            .into_iter()
            .map(|mut o| {
                o.types.get_or_insert_with(|| TypeMeta { api_version: api_version.to_string(), kind: kind.to_string() });
                o
            })
            .collect())
    }
}
