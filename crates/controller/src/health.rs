//! Workload health of a dispatched revision.

use keel_core::registry::get_path;
use keel_core::{ApplicationRevision, KindRegistry};
use keel_kubehub::{to_json, ClusterClient};
use serde_json::Value as Json;
use tracing::debug;

use crate::model::ServiceHealth;
use crate::ReconcileError;

/// One entry per component, in render order. A workload is healthy when it
/// exists and, for scalable kinds, all desired replicas are ready.
pub async fn check_health(
    client: &dyn ClusterClient,
    registry: &KindRegistry,
    revision: &ApplicationRevision,
) -> Result<Vec<ServiceHealth>, ReconcileError> {
    let mut out = Vec::new();
    for m in revision.manifests.iter().filter(|m| m.is_workload()) {
        let r = m.resource_ref();
        let Some(live) = client.get(&r).await? else {
            out.push(ServiceHealth { name: m.component.clone(), healthy: false, message: format!("{} not found", r) });
            continue;
        };
        let health = match registry.scale_paths(&m.api_version, &m.kind) {
            Some(paths) => {
                let doc = to_json(&live)?;
                let read = |p: &str| get_path(&doc, p).and_then(Json::as_i64).unwrap_or(0);
                let (desired, ready) = (read(&paths.replicas), read(&paths.ready_replicas));
                if ready >= desired {
                    ServiceHealth { name: m.component.clone(), healthy: true, message: String::new() }
                } else {
                    ServiceHealth {
                        name: m.component.clone(),
                        healthy: false,
                        message: format!("{}/{} replicas ready", ready, desired),
                    }
                }
            }
            None => ServiceHealth { name: m.component.clone(), healthy: true, message: String::new() },
        };
        debug!(component = %health.name, healthy = health.healthy, "health checked");
        out.push(health);
    }
    Ok(out)
}
