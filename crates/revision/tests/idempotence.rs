#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_appfile::{parse, RenderContext, Renderer};
use keel_core::{labels, KindRegistry};
use keel_kubehub::MemoryCluster;
use keel_revision::{build_revision, current_revision_name, next_revision_name, Built, RevisionStore};
use keel_template::TemplateSet;
use serde_json::{json, Value as Json};

const DEFINITIONS: &str = include_str!("../../../demos/definitions.yaml");
const APP: &str = include_str!("../../../demos/app.yaml");

/// One loop pass: render under the latest name, re-render under the next
/// name when content changed, persist when new.
async fn pass(store: &RevisionStore, raw: &Json) -> Built {
    let templates = TemplateSet::from_yaml(DEFINITIONS).unwrap();
    let renderer = Renderer::new(KindRegistry::builtin());
    let af = parse(raw, &templates).unwrap();
    let history = store.list(&af.name, "default").await.unwrap();
    let ctx = RenderContext::new(&af.name, "default", current_revision_name(&af.name, &history));
    let manifests = renderer.render_appfile(&af, &ctx).unwrap();
    let mut built = build_revision(&af, manifests, "default", &history);
    if built.is_new() && built.revision().name != ctx.app_revision {
        let ctx = RenderContext::new(&af.name, "default", next_revision_name(&af.name, &history));
        built = build_revision(&af, renderer.render_appfile(&af, &ctx).unwrap(), "default", &history);
    }
    if let Built::New(rev) = &built {
        store.persist(rev).await.unwrap();
    }
    built
}

#[tokio::test]
async fn unchanged_spec_never_mints_a_revision() {
    let cluster = Arc::new(MemoryCluster::new());
    let store = RevisionStore::new(cluster.clone());
    let raw: Json = serde_yaml::from_str(APP).unwrap();

    let first = pass(&store, &raw).await;
    assert!(first.is_new());
    assert_eq!(first.revision().name, "shop-v1");
    for _ in 0..3 {
        let again = pass(&store, &raw).await;
        assert_eq!(again, Built::Existing(first.revision().clone()));
    }
    assert_eq!(store.list("shop", "default").await.unwrap().len(), 1);
}

#[tokio::test]
async fn changed_spec_mints_one_revision_rendered_under_its_own_name() {
    let cluster = Arc::new(MemoryCluster::new());
    let store = RevisionStore::new(cluster.clone());
    let mut raw: Json = serde_yaml::from_str(APP).unwrap();
    pass(&store, &raw).await;

    raw["services"]["frontend"]["image"] = json!("oamdev/testapp:v2");
    let second = pass(&store, &raw).await;
    assert!(second.is_new());
    let rev = second.revision();
    assert_eq!(rev.name, "shop-v2");
    assert!(rev.manifests.iter().all(|m| m.labels[labels::APP_REVISION] == "shop-v2"));

    assert_eq!(pass(&store, &raw).await, Built::Existing(rev.clone()));
    assert_eq!(store.list("shop", "default").await.unwrap().len(), 2);
}
