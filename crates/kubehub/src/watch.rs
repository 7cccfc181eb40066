//! List+watch wiring that turns object events into reconcile keys.

use anyhow::Result;
use futures::TryStreamExt;
use kube::{
    core::DynamicObject,
    runtime::watcher::{self, Event},
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::KubeCluster;

/// Namespace/name of an object to reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn key_of(obj: &DynamicObject) -> Option<ObjectKey> {
    let name = obj.metadata.name.clone()?;
    Some(ObjectKey { namespace: obj.metadata.namespace.clone().unwrap_or_default(), name })
}

/// Watch one kind and push the key of every applied or deleted object into `tx`.
/// Deletions are forwarded too so the reconciler can observe the absence.
/// Returns when the receiver is dropped or the stream fails.
pub async fn watch_keys(
    cluster: &KubeCluster,
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    tx: mpsc::Sender<ObjectKey>,
) -> Result<()> {
    let api = cluster.api(api_version, kind, namespace).await?;
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(api_version, kind, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let keys: Vec<ObjectKey> = match ev {
            Event::Applied(o) | Event::Deleted(o) => key_of(&o).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(kind, count = list.len(), "watch restart");
                list.iter().filter_map(key_of).collect()
            }
        };
        for k in keys {
            if tx.send(k).await.is_err() {
                debug!(kind, "key receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind, "watcher stream ended");
    Ok(())
}
