//! Scalable workloads the rollout moves replicas between.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use keel_core::meta::set_controller_owner;
use keel_core::registry::{get_path, set_path};
use keel_core::{with_optimistic_retry, Backoff, KindRegistry, ResourceRef, ScalePaths};
use keel_kubehub::{to_json, ClusterClient, ClusterError};
use serde_json::Value as Json;
use tracing::debug;

use crate::RolloutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkloadSize {
    pub desired: i32,
    pub ready: i32,
}

#[async_trait::async_trait]
pub trait WorkloadHandle: Send + Sync {
    fn resource(&self) -> &ResourceRef;
    /// `None` when the workload does not exist.
    async fn size(&self) -> Result<Option<WorkloadSize>, RolloutError>;
    async fn scale(&self, replicas: i32) -> Result<(), RolloutError>;
    /// Make `owner` the single controller of the workload.
    async fn claim(&self, owner: OwnerReference) -> Result<(), RolloutError>;
}

/// A workload living in the cluster, scaled through its registry scale paths.
pub struct ClusterWorkload {
    client: Arc<dyn ClusterClient>,
    resource: ResourceRef,
    paths: ScalePaths,
    backoff: Backoff,
}

impl ClusterWorkload {
    pub fn new(client: Arc<dyn ClusterClient>, registry: &KindRegistry, resource: ResourceRef) -> Result<Self, RolloutError> {
        let paths = registry
            .scale_paths(&resource.api_version, &resource.kind)
            .cloned()
            .ok_or_else(|| RolloutError::NotScalable(resource.clone()))?;
        Ok(Self { client, resource, paths, backoff: Backoff::default() })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn scale_once(&self, replicas: i32) -> Result<(), RolloutError> {
        let Some(mut obj) = self.client.get(&self.resource).await? else {
            return Err(ClusterError::NotFound(self.resource.to_string()).into());
        };
        let current = get_path(&obj.data, &self.paths.replicas).and_then(Json::as_i64);
        if current == Some(replicas as i64) {
            return Ok(());
        }
        set_path(&mut obj.data, &self.paths.replicas, Json::from(replicas));
        self.client.update(obj).await?;
        debug!(workload = %self.resource, replicas, "scaled");
        Ok(())
    }

    async fn claim_once(&self, owner: &OwnerReference) -> Result<(), RolloutError> {
        let Some(mut obj) = self.client.get(&self.resource).await? else {
            return Err(ClusterError::NotFound(self.resource.to_string()).into());
        };
        let existing = obj.metadata.owner_references.clone().unwrap_or_default();
        let owners = set_controller_owner(&existing, owner.clone());
        if owners == existing {
            return Ok(());
        }
        obj.metadata.owner_references = Some(owners);
        self.client.update(obj).await?;
        debug!(workload = %self.resource, owner = %owner.name, "controller reassigned");
        Ok(())
    }
}

#[async_trait::async_trait]
impl WorkloadHandle for ClusterWorkload {
    fn resource(&self) -> &ResourceRef { &self.resource }

    async fn size(&self) -> Result<Option<WorkloadSize>, RolloutError> {
        let Some(obj) = self.client.get(&self.resource).await? else { return Ok(None) };
        let doc = to_json(&obj)?;
        let read = |path: &str| get_path(&doc, path).and_then(Json::as_i64).unwrap_or(0) as i32;
        Ok(Some(WorkloadSize { desired: read(&self.paths.replicas), ready: read(&self.paths.ready_replicas) }))
    }

    async fn scale(&self, replicas: i32) -> Result<(), RolloutError> {
        with_optimistic_retry(&self.backoff, || self.scale_once(replicas)).await
    }

    async fn claim(&self, owner: OwnerReference) -> Result<(), RolloutError> {
        with_optimistic_retry(&self.backoff, || self.claim_once(&owner)).await
    }
}
