#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_controller::{ControllerConfig, Definitions, ErrorClass, Reconciler, Requeue};
use keel_core::meta::controller_of;
use keel_core::{labels, KindRegistry, ResourceRef, API_VERSION, KIND_APPLICATION, KIND_APP_REVISION, KIND_RESOURCE_TRACKER};
use keel_kubehub::memory::Verb;
use keel_kubehub::{from_json, new_object, ClusterClient, MemoryCluster, ObjectKey};
use keel_template::TemplateSet;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

const DEFINITIONS: &str = include_str!("../../../demos/definitions.yaml");
const APP: &str = include_str!("../../../demos/app.yaml");

fn config() -> ControllerConfig { ControllerConfig { retry_steps: 3, ..ControllerConfig::default() } }

fn reconciler(cluster: &Arc<MemoryCluster>, config: ControllerConfig) -> Reconciler {
    let templates = TemplateSet::from_yaml(DEFINITIONS).unwrap();
    Reconciler::new(cluster.clone(), KindRegistry::builtin(), Definitions::Static(Arc::new(templates)), config)
}

fn services() -> Json {
    let raw: Json = serde_yaml::from_str(APP).unwrap();
    raw["services"].clone()
}

fn app_ref() -> ResourceRef { ResourceRef::new(API_VERSION, KIND_APPLICATION, "default", "shop") }

fn key() -> ObjectKey { ObjectKey::new("default", "shop") }

fn deployment(name: &str) -> ResourceRef { ResourceRef::new("apps/v1", "Deployment", "default", name) }

fn tracker(name: &str) -> ResourceRef { ResourceRef::new(API_VERSION, KIND_RESOURCE_TRACKER, "", name) }

fn revision(name: &str) -> ResourceRef { ResourceRef::new(API_VERSION, KIND_APP_REVISION, "default", name) }

async fn create_app(cluster: &MemoryCluster, services: Json) {
    let obj = from_json(json!({
        "apiVersion": API_VERSION,
        "kind": KIND_APPLICATION,
        "metadata": { "name": "shop", "namespace": "default" },
        "spec": { "services": services }
    }))
    .unwrap();
    cluster.create(obj).await.unwrap();
}

async fn update_services(cluster: &MemoryCluster, edit: impl FnOnce(&mut Json)) {
    let mut obj = cluster.object(&app_ref()).unwrap();
    edit(&mut obj.data["spec"]["services"]);
    cluster.update(obj).await.unwrap();
}

fn status(cluster: &MemoryCluster) -> Json { cluster.json(&app_ref()).unwrap()["status"].clone() }

fn condition(status: &Json, type_: &str) -> Json {
    status["conditions"].as_array().unwrap().iter().find(|c| c["type"] == type_).cloned().unwrap_or(Json::Null)
}

/// Report every replica the workload asks for as ready.
fn settle(cluster: &MemoryCluster, r: &ResourceRef) {
    let want = cluster.json(r).unwrap()["spec"]["replicas"].clone();
    assert!(cluster.patch_data(r, "status.readyReplicas", want));
}

fn controller_name(cluster: &MemoryCluster, r: &ResourceRef) -> Option<String> {
    let obj = cluster.object(r)?;
    controller_of(obj.metadata.owner_references.as_deref().unwrap_or_default()).map(|o| o.name.clone())
}

async fn running(cluster: &Arc<MemoryCluster>, rec: &Reconciler) {
    let cancel = CancellationToken::new();
    rec.reconcile(&key(), &cancel).await.unwrap();
    settle(cluster, &deployment("frontend"));
    settle(cluster, &deployment("backend"));
    assert_eq!(rec.reconcile(&key(), &cancel).await.unwrap(), Requeue::Done);
}

#[tokio::test]
async fn first_pass_dispatches_then_waits_for_health() {
    let cluster = Arc::new(MemoryCluster::new());
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, config());
    let cancel = CancellationToken::new();

    assert_eq!(rec.reconcile(&key(), &cancel).await.unwrap(), Requeue::After(Duration::from_secs(10)));
    let st = status(&cluster);
    assert_eq!(st["phase"], "healthCheck");
    assert_eq!(st["latestRevision"]["name"], "shop-v1");
    assert_eq!(st["latestRevision"]["revision"], 1);
    assert_eq!(condition(&st, "Parsed")["status"], "True");
    assert_eq!(condition(&st, "Applied")["status"], "True");
    assert_eq!(condition(&st, "HealthCheck")["status"], "False");
    let frontend = st["services"].as_array().unwrap().iter().find(|s| s["name"] == "frontend").unwrap().clone();
    assert_eq!(frontend["healthy"], false);
    assert_eq!(frontend["message"], "0/3 replicas ready");

    assert!(cluster.contains(&revision("shop-v1")));
    assert!(cluster.contains(&tracker("shop-v1-default")));
    assert!(cluster.contains(&ResourceRef::new("networking.k8s.io/v1", "Ingress", "default", "frontend-ingress")));
    assert_eq!(controller_name(&cluster, &deployment("frontend")).as_deref(), Some("shop-v1-default"));
    let web = cluster.json(&deployment("frontend")).unwrap();
    assert_eq!(web["metadata"]["labels"][labels::APP_REVISION], "shop-v1");

    settle(&cluster, &deployment("frontend"));
    settle(&cluster, &deployment("backend"));
    assert_eq!(rec.reconcile(&key(), &cancel).await.unwrap(), Requeue::Done);
    let st = status(&cluster);
    assert_eq!(st["phase"], "running");
    assert_eq!(condition(&st, "HealthCheck")["status"], "True");

    // a converged application is left untouched
    let (updates, status_writes, creates) =
        (cluster.calls(Verb::Update), cluster.calls(Verb::UpdateStatus), cluster.calls(Verb::Create));
    assert_eq!(rec.reconcile(&key(), &cancel).await.unwrap(), Requeue::Done);
    assert_eq!(cluster.calls(Verb::Update), updates);
    assert_eq!(cluster.calls(Verb::UpdateStatus), status_writes);
    assert_eq!(cluster.calls(Verb::Create), creates);
}

#[tokio::test]
async fn spec_change_mints_a_revision_and_collects_leftovers() {
    let cluster = Arc::new(MemoryCluster::new());
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, config());
    running(&cluster, &rec).await;

    update_services(&cluster, |s| {
        s["frontend"].as_object_mut().unwrap().remove("route");
    })
    .await;
    assert_eq!(rec.reconcile(&key(), &CancellationToken::new()).await.unwrap(), Requeue::Done);

    let st = status(&cluster);
    assert_eq!(st["phase"], "running");
    assert_eq!(st["latestRevision"]["name"], "shop-v2");
    assert!(cluster.contains(&revision("shop-v1")));
    assert!(cluster.contains(&revision("shop-v2")));
    assert!(!cluster.contains(&tracker("shop-v1-default")));
    assert!(cluster.contains(&tracker("shop-v2-default")));
    assert!(!cluster.contains(&ResourceRef::new("networking.k8s.io/v1", "Ingress", "default", "frontend-ingress")));
    assert!(!cluster.contains(&ResourceRef::new("v1", "Service", "default", "frontend-service")));
    assert!(cluster.contains(&ResourceRef::new("v1", "Service", "default", "frontend-expose")));
    assert_eq!(controller_name(&cluster, &deployment("frontend")).as_deref(), Some("shop-v2-default"));
}

#[tokio::test]
async fn revision_history_is_pruned() {
    let cluster = Arc::new(MemoryCluster::new());
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, ControllerConfig { revision_history: 2, ..config() });
    running(&cluster, &rec).await;

    for tag in ["v2", "v3"] {
        update_services(&cluster, |s| s["backend"]["image"] = json!(format!("bitnami/mongodb:{}", tag))).await;
        assert_eq!(rec.reconcile(&key(), &CancellationToken::new()).await.unwrap(), Requeue::Done);
    }
    assert_eq!(status(&cluster)["latestRevision"]["name"], "shop-v3");
    assert!(!cluster.contains(&revision("shop-v1")));
    assert!(cluster.contains(&revision("shop-v2")));
    assert!(cluster.contains(&revision("shop-v3")));
}

#[tokio::test]
async fn unchanged_spec_reuses_the_revision() {
    let cluster = Arc::new(MemoryCluster::new());
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, config());
    running(&cluster, &rec).await;
    let revisions_before = cluster.refs_of_kind(KIND_APP_REVISION).len();

    // same content again is not a new revision
    update_services(&cluster, |_| {}).await;
    assert_eq!(rec.reconcile(&key(), &CancellationToken::new()).await.unwrap(), Requeue::Done);
    assert_eq!(cluster.refs_of_kind(KIND_APP_REVISION).len(), revisions_before);
    assert_eq!(status(&cluster)["latestRevision"]["name"], "shop-v1");
}

#[tokio::test]
async fn bad_parameters_fail_the_application() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut svc = services();
    svc["frontend"]["bogus"] = json!(1);
    create_app(&cluster, svc).await;
    let rec = reconciler(&cluster, config());

    let err = rec.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::UserSpec);
    let st = status(&cluster);
    assert_eq!(st["phase"], "failed");
    let parsed = condition(&st, "Parsed");
    assert_eq!(parsed["status"], "False");
    assert_eq!(parsed["reason"], "ParseError");
    assert!(parsed["message"].as_str().unwrap().contains("bogus"));
    assert!(cluster.refs_of_kind(KIND_APP_REVISION).is_empty());
    assert!(!cluster.contains(&deployment("frontend")));
}

#[tokio::test]
async fn foreign_owner_blocks_apply() {
    let cluster = Arc::new(MemoryCluster::new());
    let other = cluster.create(new_object(API_VERSION, KIND_RESOURCE_TRACKER, "", "other-v1-default")).await.unwrap();
    let mut svc = new_object("v1", "Service", "default", "frontend-expose");
    svc.metadata.owner_references = Some(vec![k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
        api_version: API_VERSION.into(),
        kind: KIND_RESOURCE_TRACKER.into(),
        name: "other-v1-default".into(),
        uid: other.metadata.uid.clone().unwrap(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    cluster.create(svc).await.unwrap();
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, config());

    let err = rec.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Apply);
    let st = status(&cluster);
    assert_eq!(condition(&st, "Applied")["status"], "False");
    assert_eq!(condition(&st, "Applied")["reason"], "ApplyFailed");
    assert_ne!(st["phase"], "failed");
    assert!(st.get("latestRevision").map_or(true, Json::is_null));
    assert_eq!(controller_name(&cluster, &ResourceRef::new("v1", "Service", "default", "frontend-expose")).as_deref(), Some("other-v1-default"));
}

#[tokio::test]
async fn status_write_failure_is_reported() {
    let cluster = Arc::new(MemoryCluster::new());
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, config());
    cluster.fail_on(Verb::UpdateStatus, "shop");

    let err = rec.reconcile(&key(), &CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::StatusPersist);
    // the dispatch itself went through
    assert!(cluster.contains(&deployment("frontend")));

    cluster.clear_failures();
    assert_eq!(rec.reconcile(&key(), &CancellationToken::new()).await.unwrap(), Requeue::After(Duration::from_secs(10)));
    assert_eq!(status(&cluster)["latestRevision"]["name"], "shop-v1");
}

#[tokio::test]
async fn definitions_come_from_the_cluster() {
    let cluster = Arc::new(MemoryCluster::new());
    for doc in serde_yaml::Deserializer::from_str(DEFINITIONS) {
        let mut def = Json::deserialize(doc).unwrap();
        def["metadata"]["namespace"] = json!("keel-system");
        cluster.create(from_json(def).unwrap()).await.unwrap();
    }
    create_app(&cluster, services()).await;
    let rec = Reconciler::new(
        cluster.clone(),
        KindRegistry::builtin(),
        Definitions::Cluster { shared_namespace: "keel-system".into() },
        config(),
    );

    assert_eq!(rec.reconcile(&key(), &CancellationToken::new()).await.unwrap(), Requeue::After(Duration::from_secs(10)));
    assert!(cluster.contains(&deployment("frontend")));
    assert!(cluster.contains(&ResourceRef::new("core.oam.dev/v1alpha2", "ManualScalerTrait", "default", "backend-scaler")));
}

#[tokio::test]
async fn missing_application_is_done() {
    let cluster = Arc::new(MemoryCluster::new());
    let rec = reconciler(&cluster, config());
    assert_eq!(rec.reconcile(&key(), &CancellationToken::new()).await.unwrap(), Requeue::Done);
    assert_eq!(cluster.calls(Verb::Create), 0);
}

#[tokio::test]
async fn cancelled_pass_stops_early() {
    let cluster = Arc::new(MemoryCluster::new());
    create_app(&cluster, services()).await;
    let rec = reconciler(&cluster, config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = rec.reconcile(&key(), &cancel).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(!cluster.contains(&deployment("frontend")));
}
