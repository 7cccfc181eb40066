//! Keel template store: compiled workload/trait templates keyed by type name.
//!
//! Templates are written in a small declarative DSL. Each declares a
//! `parameter` schema, an `output` document and optionally named `outputs`.
//! [`TemplateProvider`] is the lookup the appfile parser resolves type names
//! against; [`TemplateEvaluator`] is the seam the renderer evaluates through.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod ast;
mod definition;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod schema;

pub use definition::TemplateDefinition;
pub use eval::{DslEvaluator, EvalError, Evaluated, TemplateEvaluator};
pub use schema::{ParamMeta, ParameterInfo, Schema, SchemaError};

use ast::{Expr, StructItem};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template {0} not found")]
    NotFound(String),
    #[error("syntax error at {line}:{col}: {message}")]
    Syntax { line: u32, col: u32, message: String },
    #[error("template {name}: {message}")]
    Invalid { name: String, message: String },
    #[error("definition object: {0}")]
    Definition(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Workload,
    Trait,
}

/// Evaluation-ready form of the non-schema parts of a template.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Program {
    pub(crate) output: Option<Expr>,
    pub(crate) outputs: Vec<Expr>,
    /// Other top-level fields, referable by name from `output`/`outputs`.
    pub(crate) helpers: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledTemplate {
    pub name: String,
    pub kind: TemplateKind,
    /// Workload types a trait may attach to; empty or `*` means any.
    pub applies_to: Vec<String>,
    pub parameter: Schema,
    pub(crate) program: Program,
}

impl CompiledTemplate {
    pub fn compile(name: &str, kind: TemplateKind, applies_to: Vec<String>, source: &str) -> Result<Self, TemplateError> {
        let invalid = |message: String| TemplateError::Invalid { name: name.to_string(), message };
        let file = parser::parse_file(source).map_err(|e| invalid(e.to_string()))?;
        let mut parameter = None;
        let mut output = None;
        let mut outputs = Vec::new();
        let mut helpers = Vec::new();
        for item in file.items {
            let StructItem::Field(f) = item else {
                return Err(invalid("comprehensions are not allowed at the top level".into()));
            };
            let Some(label) = f.name().map(str::to_string) else {
                return Err(invalid("interpolated labels are not allowed at the top level".into()));
            };
            match label.as_str() {
                "parameter" if parameter.is_some() => return Err(invalid("more than one parameter section".into())),
                "parameter" => parameter = Some(f.value),
                "output" if output.is_some() => return Err(invalid("more than one output".into())),
                "output" => output = Some(f.value),
                "outputs" => outputs.push(f.value),
                _ => helpers.push((label, f.value)),
            }
        }
        let parameter = parameter.ok_or_else(|| invalid("missing parameter section".into()))?;
        let schema = {
            let defs: schema::Definitions<'_> =
                helpers.iter().filter(|(n, _)| n.starts_with('#')).map(|(n, e)| (n.as_str(), e)).collect();
            Schema::compile(&parameter, &defs).map_err(|e| invalid(e.to_string()))?
        };
        match kind {
            TemplateKind::Workload if output.is_none() => return Err(invalid("workload template has no output".into())),
            TemplateKind::Trait if output.is_none() && outputs.is_empty() => {
                return Err(invalid("trait template has neither output nor outputs".into()))
            }
            _ => {}
        }
        debug!(template = name, ?kind, helpers = helpers.len(), "template compiled");
        Ok(Self { name: name.to_string(), kind, applies_to, parameter: schema, program: Program { output, outputs, helpers } })
    }

    /// `true` when this trait may attach to `workload_type`.
    pub fn applies_to_workload(&self, workload_type: &str) -> bool {
        self.applies_to.is_empty() || self.applies_to.iter().any(|w| w == "*" || w == workload_type)
    }

    pub fn parameter_info(&self) -> Vec<ParameterInfo> { self.parameter.parameters() }
}

/// Read-only lookup of templates by type name.
pub trait TemplateProvider: Send + Sync {
    fn get_template(&self, name: &str) -> Result<Arc<CompiledTemplate>, TemplateError>;
}

/// In-memory template store.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    templates: BTreeMap<String, Arc<CompiledTemplate>>,
}

impl TemplateSet {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&mut self, t: CompiledTemplate) { self.templates.insert(t.name.clone(), Arc::new(t)); }

    pub fn add(&mut self, name: &str, kind: TemplateKind, applies_to: &[&str], source: &str) -> Result<(), TemplateError> {
        let t = CompiledTemplate::compile(name, kind, applies_to.iter().map(|s| s.to_string()).collect(), source)?;
        self.insert(t);
        Ok(())
    }

    pub fn len(&self) -> usize { self.templates.len() }
    pub fn is_empty(&self) -> bool { self.templates.is_empty() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.templates.keys().map(|s| s.as_str()) }
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CompiledTemplate>> { self.templates.values() }

    /// Compile WorkloadDefinition/TraitDefinition objects.
    pub fn from_definitions<'a>(objs: impl IntoIterator<Item = &'a serde_json::Value>) -> Result<Self, TemplateError> {
        let mut set = Self::new();
        for obj in objs {
            set.insert(TemplateDefinition::from_object(obj)?.compile()?);
        }
        Ok(set)
    }

    /// Compile every definition in a multi-document YAML stream. Documents of
    /// other kinds are skipped.
    pub fn from_yaml(text: &str) -> Result<Self, TemplateError> {
        let mut docs = Vec::new();
        for de in serde_yaml::Deserializer::from_str(text) {
            let v = serde_json::Value::deserialize(de).map_err(|e| TemplateError::Definition(e.to_string()))?;
            if TemplateDefinition::is_definition(&v) { docs.push(v); }
        }
        Self::from_definitions(docs.iter())
    }
}

impl TemplateProvider for TemplateSet {
    fn get_template(&self, name: &str) -> Result<Arc<CompiledTemplate>, TemplateError> {
        self.templates.get(name).cloned().ok_or_else(|| TemplateError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_checks_sections() {
        let err = CompiledTemplate::compile("w", TemplateKind::Workload, vec![], "output: {}").unwrap_err();
        assert!(err.to_string().contains("missing parameter"));
        let err = CompiledTemplate::compile("w", TemplateKind::Workload, vec![], "parameter: {}").unwrap_err();
        assert!(err.to_string().contains("no output"));
        let err = CompiledTemplate::compile("t", TemplateKind::Trait, vec![], "parameter: {}\nparameter: {}\noutput: {}").unwrap_err();
        assert!(err.to_string().contains("more than one parameter"));
        let err = CompiledTemplate::compile("w", TemplateKind::Workload, vec![], "parameter: {\noutput: {}").unwrap_err();
        assert!(matches!(err, TemplateError::Invalid { ref message, .. } if message.starts_with("syntax error")));
        assert!(CompiledTemplate::compile("t", TemplateKind::Trait, vec![], "parameter: {}\noutputs: a: {}").is_ok());
    }

    #[test]
    fn definition_references_in_parameter() {
        let src = "parameter: #webservice\n#webservice: {\n  cmd?: [...string]\n  image: string\n}\noutput: { image: parameter.image }";
        let t = CompiledTemplate::compile("webservice", TemplateKind::Workload, vec![], src).unwrap();
        assert_eq!(t.parameter.unknown_fields(&serde_json::json!({ "image": "x", "bogus": 1 }), ""), vec!["bogus".to_string()]);
        let names: Vec<String> = t.parameter_info().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["cmd", "image"]);
    }

    #[test]
    fn applies_to_and_lookup() {
        let mut set = TemplateSet::new();
        set.add("route", TemplateKind::Trait, &["webservice"], "parameter: { domain: string }\noutputs: svc: { host: parameter.domain }").unwrap();
        set.add("scaler", TemplateKind::Trait, &["*"], "parameter: { replicas: *1 | int }\noutput: { replicas: parameter.replicas }").unwrap();
        let route = set.get_template("route").unwrap();
        assert!(route.applies_to_workload("webservice"));
        assert!(!route.applies_to_workload("worker"));
        assert!(set.get_template("scaler").unwrap().applies_to_workload("worker"));
        assert_eq!(set.get_template("nope").unwrap_err(), TemplateError::NotFound("nope".into()));
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["route", "scaler"]);
    }
}
