//! Template sources for the reconciler.

use std::collections::BTreeMap;
use std::sync::Arc;

use keel_core::{API_VERSION, KIND_TRAIT_DEFINITION, KIND_WORKLOAD_DEFINITION};
use keel_kubehub::{to_json, ClusterClient};
use keel_template::TemplateSet;
use tracing::debug;

use crate::ReconcileError;

#[derive(Clone)]
pub enum Definitions {
    /// WorkloadDefinition/TraitDefinition objects read on every pass from the
    /// shared namespace and then the application's namespace. Later ones
    /// replace earlier ones of the same name.
    Cluster { shared_namespace: String },
    /// A fixed set, for offline runs and tests.
    Static(Arc<TemplateSet>),
}

impl Definitions {
    pub async fn load(&self, client: &dyn ClusterClient, namespace: &str) -> Result<Arc<TemplateSet>, ReconcileError> {
        let shared = match self {
            Definitions::Static(set) => return Ok(set.clone()),
            Definitions::Cluster { shared_namespace } => shared_namespace,
        };
        let mut namespaces = vec![shared.as_str()];
        if namespace != shared {
            namespaces.push(namespace);
        }
        let mut docs = Vec::new();
        for ns in namespaces {
            for kind in [KIND_WORKLOAD_DEFINITION, KIND_TRAIT_DEFINITION] {
                for obj in client.list(API_VERSION, kind, Some(ns), &BTreeMap::new()).await? {
                    docs.push(to_json(&obj)?);
                }
            }
        }
        let set = TemplateSet::from_definitions(docs.iter())?;
        debug!(namespace, templates = set.len(), "definitions loaded");
        Ok(Arc::new(set))
    }
}
