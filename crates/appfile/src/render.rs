//! Appfile to concrete manifests.
//!
//! Rendering is pure: the same Appfile, context and templates always produce
//! the same manifests in the same order. Evaluation goes through
//! [`TemplateEvaluator`] so the pipeline does not depend on the DSL.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use keel_core::{labels, parse_revision_num, KindRegistry, ManifestRole, RenderedManifest, ResourceRef};
use keel_template::{DslEvaluator, EvalError, Evaluated, SchemaError, TemplateEvaluator};
use serde_json::{json, Map, Value as Json};
use tracing::{debug, warn};

use crate::{Appfile, ComponentNode, TraitNode};

/// Identity of the node a render error belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeId {
    Component(String),
    Trait { component: String, trait_type: String },
}

impl NodeId {
    pub fn component(&self) -> &str {
        match self {
            NodeId::Component(c) | NodeId::Trait { component: c, .. } => c,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Component(c) => write!(f, "component {}", c),
            NodeId::Trait { component, trait_type } => write!(f, "component {} trait {}", component, trait_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    #[error("{node}: {source}")]
    Parameter { node: NodeId, source: SchemaError },
    #[error("{node}: {source}")]
    Eval { node: NodeId, source: EvalError },
    #[error("{node}: {message}")]
    Invalid { node: NodeId, message: String },
    #[error("{node}: resource {resource} is rendered more than once")]
    Duplicate { node: NodeId, resource: ResourceRef },
}

impl RenderError {
    pub fn node(&self) -> &NodeId {
        match self {
            RenderError::Parameter { node, .. }
            | RenderError::Eval { node, .. }
            | RenderError::Invalid { node, .. }
            | RenderError::Duplicate { node, .. } => node,
        }
    }
}

/// Every failure of one render pass.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", summarize(.0))]
pub struct RenderErrors(pub Vec<RenderError>);

fn summarize(errs: &[RenderError]) -> String {
    let parts: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("{} render error(s): {}", errs.len(), parts.join("; "))
}

/// Values injected into every template as `context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub app_name: String,
    pub namespace: String,
    pub app_revision: String,
    pub app_revision_num: u64,
    /// Workloads are named `<component>-<revision>` so two revisions can run
    /// side by side.
    pub rollout: bool,
}

impl RenderContext {
    pub fn new(app_name: impl Into<String>, namespace: impl Into<String>, app_revision: impl Into<String>) -> Self {
        let app_revision = app_revision.into();
        let app_revision_num = parse_revision_num(&app_revision).unwrap_or(0);
        Self { app_name: app_name.into(), namespace: namespace.into(), app_revision, app_revision_num, rollout: false }
    }

    pub fn with_rollout(mut self, rollout: bool) -> Self {
        self.rollout = rollout;
        self
    }

    fn scope(&self, component: &str) -> Json {
        json!({
            "name": component,
            "appName": self.app_name,
            "namespace": self.namespace,
            "appRevision": self.app_revision,
            "appRevisionNum": self.app_revision_num,
        })
    }

    fn workload_name(&self, component: &str) -> String {
        if self.rollout { format!("{}-{}", component, self.app_revision) } else { component.to_string() }
    }
}

/// Manifests produced by one node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderOutput {
    pub main: Option<RenderedManifest>,
    pub auxiliaries: Vec<RenderedManifest>,
}

impl RenderOutput {
    pub fn into_manifests(self) -> impl Iterator<Item = RenderedManifest> {
        self.main.into_iter().chain(self.auxiliaries)
    }

    fn outputs_scope(&self) -> Json {
        let mut m = Map::new();
        for a in &self.auxiliaries {
            if let ManifestRole::Auxiliary { output, .. } = &a.role {
                m.insert(output.clone(), a.body.clone());
            }
        }
        Json::Object(m)
    }
}

pub struct Renderer<E: TemplateEvaluator = DslEvaluator> {
    evaluator: E,
    registry: KindRegistry,
}

impl Renderer<DslEvaluator> {
    pub fn new(registry: KindRegistry) -> Self { Self { evaluator: DslEvaluator, registry } }
}

impl<E: TemplateEvaluator> Renderer<E> {
    pub fn with_evaluator(evaluator: E, registry: KindRegistry) -> Self { Self { evaluator, registry } }

    pub fn registry(&self) -> &KindRegistry { &self.registry }

    /// Render a component's workload: its main manifest plus auxiliaries.
    pub fn render(&self, node: &ComponentNode, ctx: &RenderContext) -> Result<RenderOutput, RenderError> {
        let id = NodeId::Component(node.name.clone());
        let ev = self.evaluate(&id, node.template.as_ref(), &node.parameters, ctx.scope(&node.name))?;
        let Some(body) = ev.output else {
            return Err(RenderError::Invalid { node: id, message: "workload template produced no output".into() });
        };
        let stamp = Stamp { node: &node.name, ctx, type_label: (labels::WORKLOAD_TYPE, node.workload_type.as_str()) };
        let main = self.finish(&id, body, ctx.workload_name(&node.name), ManifestRole::Workload, &stamp)?;
        let auxiliaries = self.finish_outputs(&id, ev.outputs, &node.workload_type, &stamp)?;
        Ok(RenderOutput { main: Some(main), auxiliaries })
    }

    /// Render one trait of a component. The trait sees the finished workload
    /// as `context.output` and its auxiliaries as `context.outputs`.
    pub fn render_trait(
        &self,
        node: &ComponentNode,
        t: &TraitNode,
        workload: &RenderOutput,
        ctx: &RenderContext,
    ) -> Result<RenderOutput, RenderError> {
        let id = NodeId::Trait { component: node.name.clone(), trait_type: t.type_name.clone() };
        let mut scope = ctx.scope(&node.name);
        if let Some(obj) = scope.as_object_mut() {
            obj.insert("output".into(), workload.main.as_ref().map(|m| m.body.clone()).unwrap_or(Json::Null));
            obj.insert("outputs".into(), workload.outputs_scope());
        }
        let ev = self.evaluate(&id, t.template.as_ref(), &t.parameters, scope)?;
        let stamp = Stamp { node: &node.name, ctx, type_label: (labels::TRAIT_TYPE, t.type_name.as_str()) };
        let main = match ev.output {
            Some(body) => {
                let role = ManifestRole::Trait { trait_type: t.type_name.clone() };
                Some(self.finish(&id, body, format!("{}-{}", node.name, t.type_name), role, &stamp)?)
            }
            None => None,
        };
        let auxiliaries = self.finish_outputs(&id, ev.outputs, &t.type_name, &stamp)?;
        Ok(RenderOutput { main, auxiliaries })
    }

    /// Render every component and trait. Failures are collected rather than
    /// returned at the first one; traits of a component whose workload failed
    /// are skipped.
    pub fn render_appfile(&self, af: &Appfile, ctx: &RenderContext) -> Result<Vec<RenderedManifest>, RenderErrors> {
        let mut manifests = Vec::new();
        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        let mut emit = |id: &NodeId, out: RenderOutput, manifests: &mut Vec<RenderedManifest>, errors: &mut Vec<RenderError>| {
            for m in out.into_manifests() {
                let r = m.resource_ref();
                if !seen.insert(r.clone()) {
                    errors.push(RenderError::Duplicate { node: id.clone(), resource: r });
                    continue;
                }
                manifests.push(m);
            }
        };
        for node in &af.services {
            let workload = match self.render(node, ctx) {
                Ok(w) => w,
                Err(e) => {
                    warn!(app = %af.name, error = %e, "component render failed");
                    errors.push(e);
                    continue;
                }
            };
            let mut traits = Vec::with_capacity(node.traits.len());
            for t in &node.traits {
                match self.render_trait(node, t, &workload, ctx) {
                    Ok(out) => traits.push((NodeId::Trait { component: node.name.clone(), trait_type: t.type_name.clone() }, out)),
                    Err(e) => {
                        warn!(app = %af.name, error = %e, "trait render failed");
                        errors.push(e);
                    }
                }
            }
            emit(&NodeId::Component(node.name.clone()), workload, &mut manifests, &mut errors);
            for (id, out) in traits {
                emit(&id, out, &mut manifests, &mut errors);
            }
        }
        if !errors.is_empty() {
            return Err(RenderErrors(errors));
        }
        debug!(app = %af.name, revision = %ctx.app_revision, manifests = manifests.len(), "appfile rendered");
        Ok(manifests)
    }

    fn evaluate(&self, id: &NodeId, template: &keel_template::CompiledTemplate, raw: &Json, scope: Json) -> Result<Evaluated, RenderError> {
        let parameter = template
            .parameter
            .resolve(Some(raw), "")
            .map_err(|source| RenderError::Parameter { node: id.clone(), source })?
            .unwrap_or(Json::Null);
        self.evaluator
            .evaluate(template, &parameter, &scope)
            .map_err(|source| RenderError::Eval { node: id.clone(), source })
    }

    fn finish_outputs(
        &self,
        id: &NodeId,
        outputs: Vec<(String, Json)>,
        owner_type: &str,
        stamp: &Stamp<'_>,
    ) -> Result<Vec<RenderedManifest>, RenderError> {
        outputs
            .into_iter()
            .map(|(output, body)| {
                let name = format!("{}-{}", stamp.node, output);
                let role = ManifestRole::Auxiliary { owner_type: owner_type.to_string(), output };
                self.finish(id, body, name, role, stamp)
            })
            .collect()
    }

    /// Fill in identity, scope and labels of one template output.
    fn finish(
        &self,
        id: &NodeId,
        mut body: Json,
        default_name: String,
        role: ManifestRole,
        stamp: &Stamp<'_>,
    ) -> Result<RenderedManifest, RenderError> {
        let invalid = |message: String| RenderError::Invalid { node: id.clone(), message };
        let what = match &role {
            ManifestRole::Auxiliary { output, .. } => format!("output {}", output),
            _ => "output".to_string(),
        };
        let obj = body.as_object_mut().ok_or_else(|| invalid(format!("{} must be an object", what)))?;
        let field = |obj: &Map<String, Json>, key: &str| {
            obj.get(key).and_then(Json::as_str).filter(|s| !s.is_empty()).map(str::to_string)
        };
        let api_version = field(obj, "apiVersion").ok_or_else(|| invalid(format!("{} has no apiVersion", what)))?;
        let kind = field(obj, "kind").ok_or_else(|| invalid(format!("{} has no kind", what)))?;

        let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
        let meta = meta.as_object_mut().ok_or_else(|| invalid(format!("{} metadata must be an object", what)))?;
        let name = match field(meta, "name") {
            Some(n) => n,
            None => {
                meta.insert("name".into(), Json::String(default_name.clone()));
                default_name
            }
        };
        let namespace = if self.registry.is_namespaced(&api_version, &kind) {
            match field(meta, "namespace") {
                Some(ns) => ns,
                None => {
                    meta.insert("namespace".into(), Json::String(stamp.ctx.namespace.clone()));
                    stamp.ctx.namespace.clone()
                }
            }
        } else {
            meta.remove("namespace");
            String::new()
        };

        let owned = stamp.labels(&role);
        let merged = meta.entry("labels").or_insert_with(|| Json::Object(Map::new()));
        let merged = merged.as_object_mut().ok_or_else(|| invalid(format!("{} labels must be an object", what)))?;
        for (k, v) in &owned {
            merged.insert(k.clone(), Json::String(v.clone()));
        }

        Ok(RenderedManifest { api_version, kind, name, namespace, body, labels: owned, component: stamp.node.to_string(), role })
    }
}

/// Per-node label context.
struct Stamp<'a> {
    node: &'a str,
    ctx: &'a RenderContext,
    type_label: (&'static str, &'a str),
}

impl Stamp<'_> {
    fn labels(&self, role: &ManifestRole) -> BTreeMap<String, String> {
        let mut l = BTreeMap::new();
        l.insert(labels::APP_NAME.to_string(), self.ctx.app_name.clone());
        l.insert(labels::APP_NAMESPACE.to_string(), self.ctx.namespace.clone());
        l.insert(labels::APP_COMPONENT.to_string(), self.node.to_string());
        l.insert(labels::APP_REVISION.to_string(), self.ctx.app_revision.clone());
        l.insert(self.type_label.0.to_string(), self.type_label.1.to_string());
        if let ManifestRole::Auxiliary { output, .. } = role {
            l.insert(labels::TRAIT_RESOURCE.to_string(), output.clone());
        }
        l
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_template::{TemplateKind, TemplateSet};

    fn store() -> TemplateSet {
        let mut s = TemplateSet::new();
        s.add(
            "cm",
            TemplateKind::Workload,
            &[],
            "parameter: { v: *\"x\" | string }\noutput: {\n  apiVersion: \"v1\"\n  kind: \"ConfigMap\"\n  data: { v: parameter.v, rev: context.appRevision, num: \"\\(context.appRevisionNum)\" }\n}\noutputs: extra: { apiVersion: \"v1\", kind: \"Secret\" }",
        )
        .unwrap();
        s.add("broken", TemplateKind::Workload, &[], "parameter: {}\noutput: { apiVersion: \"v1\", kind: nope.x }").unwrap();
        s.add("nokind", TemplateKind::Workload, &[], "parameter: {}\noutput: { apiVersion: \"v1\" }").unwrap();
        s.add(
            "echo",
            TemplateKind::Trait,
            &[],
            "parameter: {}\noutput: { apiVersion: \"v1\", kind: \"ConfigMap\", data: { of: context.output.metadata.name, aux: context.outputs.extra.kind } }",
        )
        .unwrap();
        s.add("ns", TemplateKind::Trait, &[], "parameter: {}\noutput: { apiVersion: \"v1\", kind: \"Namespace\", metadata: { name: context.appName, namespace: \"zzz\" } }").unwrap();
        s
    }

    fn appfile(raw: Json) -> Appfile { crate::parse(&raw, &store()).unwrap() }

    #[test]
    fn context_is_injected_and_names_defaulted() {
        let af = appfile(json!({ "name": "app", "services": { "web": { "type": "cm", "echo": {} } } }));
        let r = Renderer::new(KindRegistry::builtin());
        let out = r.render_appfile(&af, &RenderContext::new("app", "prod", "app-v3")).unwrap();
        let names: Vec<_> = out.iter().map(|m| (m.kind.as_str(), m.name.as_str())).collect();
        assert_eq!(names, vec![("ConfigMap", "web"), ("Secret", "web-extra"), ("ConfigMap", "web-echo")]);
        assert_eq!(out[0].body["data"], json!({ "v": "x", "rev": "app-v3", "num": "3" }));
        assert_eq!(out[0].namespace, "prod");
        assert_eq!(out[0].labels[labels::WORKLOAD_TYPE], "cm");
        assert_eq!(out[1].labels[labels::TRAIT_RESOURCE], "extra");
        assert_eq!(out[1].role, ManifestRole::Auxiliary { owner_type: "cm".into(), output: "extra".into() });
        assert_eq!(out[2].body["data"], json!({ "of": "web", "aux": "Secret" }));
        assert_eq!(out[2].labels[labels::TRAIT_TYPE], "echo");
        assert_eq!(out[2].body["metadata"]["labels"][labels::APP_REVISION], "app-v3");
    }

    #[test]
    fn rollout_mode_suffixes_workload_names() {
        let af = appfile(json!({ "name": "app", "services": { "web": { "type": "cm", "echo": {} } } }));
        let r = Renderer::new(KindRegistry::builtin());
        let ctx = RenderContext::new("app", "prod", "app-v2").with_rollout(true);
        let out = r.render_appfile(&af, &ctx).unwrap();
        assert_eq!(out[0].name, "web-app-v2");
        assert_eq!(out[1].name, "web-extra");
        assert_eq!(out[2].body["data"]["of"], "web-app-v2");
    }

    #[test]
    fn cluster_scoped_outputs_have_no_namespace() {
        let af = appfile(json!({ "name": "app", "services": { "web": { "type": "cm", "ns": {} } } }));
        let out = Renderer::new(KindRegistry::builtin()).render_appfile(&af, &RenderContext::new("app", "prod", "app-v1")).unwrap();
        let ns = out.iter().find(|m| m.kind == "Namespace").unwrap();
        assert_eq!(ns.namespace, "");
        assert!(ns.body["metadata"].get("namespace").is_none());
        assert_eq!(ns.name, "app");
    }

    #[test]
    fn errors_are_aggregated_across_components() {
        let af = appfile(json!({
            "name": "app",
            "services": {
                "a": { "type": "broken" },
                "b": { "type": "cm", "v": 1 },
                "c": { "type": "nokind" },
                "d": { "type": "cm" }
            }
        }));
        let errs = Renderer::new(KindRegistry::builtin())
            .render_appfile(&af, &RenderContext::new("app", "prod", "app-v1"))
            .unwrap_err();
        let nodes: Vec<_> = errs.0.iter().map(|e| e.node().component().to_string()).collect();
        assert_eq!(nodes, vec!["a", "b", "c"]);
        assert!(matches!(errs.0[0], RenderError::Eval { .. }));
        assert!(matches!(errs.0[1], RenderError::Parameter { .. }));
        assert!(matches!(errs.0[2], RenderError::Invalid { ref message, .. } if message.contains("kind")));
        assert!(errs.to_string().starts_with("3 render error(s)"));
    }

    #[test]
    fn duplicate_resources_are_reported() {
        let mut s = store();
        s.add("fixed", TemplateKind::Workload, &[], "parameter: {}\noutput: { apiVersion: \"v1\", kind: \"ConfigMap\", metadata: name: \"same\" }").unwrap();
        let af = crate::parse(&json!({ "name": "app", "services": { "a": { "type": "fixed" }, "b": { "type": "fixed" } } }), &s).unwrap();
        let errs = Renderer::new(KindRegistry::builtin())
            .render_appfile(&af, &RenderContext::new("app", "prod", "app-v1"))
            .unwrap_err();
        assert_eq!(errs.0.len(), 1);
        assert_eq!(errs.0[0].node(), &NodeId::Component("b".into()));
    }
}
