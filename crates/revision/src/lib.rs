//! Keel revision builder.
//!
//! A revision is an immutable, content-hashed snapshot of one rendering of an
//! application. Building is pure: the hash is compared against the latest
//! stored revision and a new revision is only minted when it differs.
//! [`RevisionStore`] persists and lists revisions through the cluster client.

#![forbid(unsafe_code)]

use keel_appfile::Appfile;
use keel_core::{revision_name, ApplicationRevision, RenderedManifest, Retryable};
use keel_kubehub::ClusterError;
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

mod store;

pub use store::RevisionStore;

#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    /// Another writer persisted the same revision name first.
    #[error("revision {0} was created concurrently")]
    Conflict(String),
    #[error("revision {name}: {message}")]
    Decode { name: String, message: String },
}

impl Retryable for RevisionError {
    fn is_conflict(&self) -> bool {
        match self {
            RevisionError::Conflict(_) => true,
            RevisionError::Cluster(e) => e.is_conflict(),
            RevisionError::Decode { .. } => false,
        }
    }
}

/// Outcome of [`build_revision`].
#[derive(Debug, Clone, PartialEq)]
pub enum Built {
    /// Content matches the latest revision; nothing to persist.
    Existing(ApplicationRevision),
    /// A fresh revision that still has to be persisted.
    New(ApplicationRevision),
}

impl Built {
    pub fn revision(&self) -> &ApplicationRevision {
        match self {
            Built::Existing(r) | Built::New(r) => r,
        }
    }

    pub fn into_revision(self) -> ApplicationRevision {
        match self {
            Built::Existing(r) | Built::New(r) => r,
        }
    }

    pub fn is_new(&self) -> bool { matches!(self, Built::New(_)) }
}

/// Latest revision by number.
pub fn latest(history: &[ApplicationRevision]) -> Option<&ApplicationRevision> {
    history.iter().max_by_key(|r| r.revision)
}

/// Name the next revision of `app` would get.
pub fn next_revision_name(app: &str, history: &[ApplicationRevision]) -> String {
    revision_name(app, latest(history).map_or(0, |r| r.revision) + 1)
}

/// Name renders should use: the latest revision's, or the first one when
/// there is no history yet.
pub fn current_revision_name(app: &str, history: &[ApplicationRevision]) -> String {
    latest(history).map(|r| r.name.clone()).unwrap_or_else(|| revision_name(app, 1))
}

/// SHA-256 over the key-sorted JSON of the source document and the manifests
/// sorted by kind, name, namespace and apiVersion.
pub fn content_hash(source: &Json, manifests: &[RenderedManifest]) -> String {
    let mut sorted: Vec<&RenderedManifest> = manifests.iter().collect();
    sorted.sort_by(|a, b| {
        (&a.kind, &a.name, &a.namespace, &a.api_version).cmp(&(&b.kind, &b.name, &b.namespace, &b.api_version))
    });
    let mut h = Sha256::new();
    h.update(canonical(source).to_string().as_bytes());
    for m in sorted {
        h.update(b"\n");
        // RenderedManifest only holds strings, maps and JSON, so this cannot fail.
        let v = serde_json::to_value(m).unwrap_or(Json::Null);
        h.update(canonical(&v).to_string().as_bytes());
    }
    format!("{:x}", h.finalize())
}

/// Copy of `v` with every object's keys in sorted order.
fn canonical(v: &Json) -> Json {
    match v {
        Json::Object(m) => {
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonical(&m[k.as_str()]));
            }
            Json::Object(out)
        }
        Json::Array(a) => Json::Array(a.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Compare the rendered content against the latest revision in `history` and
/// either reuse it or mint revision `max + 1`.
pub fn build_revision(
    af: &Appfile,
    manifests: Vec<RenderedManifest>,
    namespace: &str,
    history: &[ApplicationRevision],
) -> Built {
    let hash = content_hash(&af.source, &manifests);
    let latest = latest(history);
    if let Some(l) = latest {
        if l.content_hash == hash {
            return Built::Existing(l.clone());
        }
    }
    let revision = latest.map_or(0, |r| r.revision) + 1;
    Built::New(ApplicationRevision {
        name: revision_name(&af.name, revision),
        namespace: namespace.to_string(),
        app_name: af.name.clone(),
        revision,
        content_hash: hash,
        manifests,
        source_appfile: af.source.clone(),
    })
}
