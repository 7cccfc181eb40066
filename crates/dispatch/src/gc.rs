//! Garbage collection of resources a newer tracker no longer tracks.

use std::collections::BTreeSet;

use keel_core::meta::controller_of;
use keel_core::{ResourceTracker, ResourceRef};
use keel_kubehub::{ClusterClient, ClusterError};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::tracker::TrackerStore;
use crate::DispatchError;

/// Delete everything `previous` tracks that `current` does not. Objects that
/// are gone already count as collected; objects now controlled by an owner
/// other than `previous` are left alone. Returns the deleted refs.
pub async fn collect(
    client: &dyn ClusterClient,
    previous: &ResourceTracker,
    current: &ResourceTracker,
) -> Result<Vec<ResourceRef>, DispatchError> {
    let mut deleted = Vec::new();
    for r in previous.orphans(current) {
        let Some(live) = client.get(&r).await? else { continue };
        let refs = live.metadata.owner_references.as_deref().unwrap_or(&[]);
        if let Some(c) = controller_of(refs) {
            if c.uid != previous.uid {
                debug!(resource = %r, owner = %c.name, "skipping orphan adopted by another owner");
                continue;
            }
        }
        match client.delete(&r).await {
            Ok(()) | Err(ClusterError::NotFound(_)) => {
                counter!("gc_deleted_total", 1u64);
                deleted.push(r);
            }
            Err(e) => return Err(DispatchError::Gc { resource: r, cause: e.to_string() }),
        }
    }
    if !deleted.is_empty() {
        info!(previous = %previous.name, current = %current.name, deleted = deleted.len(), "garbage collected");
    }
    Ok(deleted)
}

/// Collect and delete every tracker of the application other than `current`
/// and those named in `keep`. Returns the names of the trackers removed.
pub async fn sweep_stale_trackers(
    client: &dyn ClusterClient,
    trackers: &TrackerStore,
    app: &str,
    namespace: &str,
    current: &ResourceTracker,
    keep: &BTreeSet<String>,
) -> Result<Vec<String>, DispatchError> {
    let mut swept = Vec::new();
    for stale in trackers.list_for_app(app, namespace).await? {
        if stale.name == current.name || keep.contains(&stale.name) { continue; }
        if let Err(e) = collect(client, &stale, current).await {
            warn!(tracker = %stale.name, error = %e, "stale tracker collection failed");
            return Err(e);
        }
        trackers.delete(&stale.name).await?;
        counter!("tracker_swept_total", 1u64);
        swept.push(stale.name);
    }
    Ok(swept)
}
