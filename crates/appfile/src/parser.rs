//! Raw application spec to [`Appfile`].

use std::sync::Arc;

use keel_template::{CompiledTemplate, TemplateError, TemplateKind, TemplateProvider};
use serde_json::{Map, Value as Json};
use tracing::debug;

use crate::{Appfile, ComponentNode, TraitNode};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed application: {0}")]
    Malformed(String),
    #[error("component {component}: missing type")]
    MissingType { component: String },
    #[error("component {component}: template {name} not found")]
    UnknownTemplate { component: String, name: String },
    #[error("component {component}: {name} is not a {expected:?} template")]
    KindMismatch { component: String, name: String, expected: TemplateKind },
    #[error("component {component}: unknown parameter {parameter}{}", trait_suffix(.trait_type))]
    UnknownParameter { component: String, trait_type: Option<String>, parameter: String },
    #[error("component {component}: trait {trait_type} does not apply to workload type {workload_type}")]
    TraitNotApplicable { component: String, trait_type: String, workload_type: String },
    #[error("component {component}: {source}")]
    Template { component: String, source: TemplateError },
}

fn trait_suffix(t: &Option<String>) -> String {
    t.as_ref().map(|t| format!(" of trait {}", t)).unwrap_or_default()
}

/// Parse a raw application document (`name` plus a `services` or `components`
/// mapping) against the template store. Pure: the same input and templates
/// yield the same Appfile.
pub fn parse(raw: &Json, templates: &dyn TemplateProvider) -> Result<Appfile, ParseError> {
    let doc = raw.as_object().ok_or_else(|| ParseError::Malformed("application must be a mapping".into()))?;
    let name = doc
        .get("name")
        .and_then(Json::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ParseError::Malformed("missing name".into()))?;
    let components = match (doc.get("services"), doc.get("components")) {
        (Some(_), Some(_)) => return Err(ParseError::Malformed("both services and components are set".into())),
        (Some(c), None) | (None, Some(c)) => c,
        (None, None) => return Err(ParseError::Malformed("missing services".into())),
    };
    let components = match components {
        Json::Object(m) => m,
        Json::Null => return Ok(Appfile { name: name.to_string(), services: Vec::new(), source: raw.clone() }),
        _ => return Err(ParseError::Malformed("services must be a mapping of name to component".into())),
    };
    let mut services = Vec::with_capacity(components.len());
    for (comp_name, body) in components {
        services.push(parse_component(comp_name, body, templates)?);
    }
    debug!(app = name, components = services.len(), "appfile parsed");
    Ok(Appfile { name: name.to_string(), services, source: raw.clone() })
}

fn lookup(component: &str, name: &str, templates: &dyn TemplateProvider) -> Result<Option<Arc<CompiledTemplate>>, ParseError> {
    match templates.get_template(name) {
        Ok(t) => Ok(Some(t)),
        Err(TemplateError::NotFound(_)) => Ok(None),
        Err(source) => Err(ParseError::Template { component: component.to_string(), source }),
    }
}

fn parse_component(name: &str, body: &Json, templates: &dyn TemplateProvider) -> Result<ComponentNode, ParseError> {
    let body = body
        .as_object()
        .ok_or_else(|| ParseError::Malformed(format!("component {} must be a mapping", name)))?;
    let workload_type = body
        .get("type")
        .and_then(Json::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ParseError::MissingType { component: name.to_string() })?;
    let template = lookup(name, workload_type, templates)?
        .ok_or_else(|| ParseError::UnknownTemplate { component: name.to_string(), name: workload_type.to_string() })?;
    if template.kind != TemplateKind::Workload {
        return Err(ParseError::KindMismatch {
            component: name.to_string(),
            name: workload_type.to_string(),
            expected: TemplateKind::Workload,
        });
    }

    let mut parameters = Map::new();
    let mut traits = Vec::new();
    for (key, value) in body {
        if key == "type" { continue; }
        match lookup(name, key, templates)? {
            Some(t) if t.kind == TemplateKind::Trait => traits.push(parse_trait(name, workload_type, key, value, t)?),
            _ => { parameters.insert(key.clone(), value.clone()); }
        }
    }
    let parameters = Json::Object(parameters);
    if let Some(parameter) = first_unknown(&template, &parameters) {
        return Err(ParseError::UnknownParameter { component: name.to_string(), trait_type: None, parameter });
    }
    Ok(ComponentNode { name: name.to_string(), workload_type: workload_type.to_string(), parameters, traits, template })
}

fn parse_trait(
    component: &str,
    workload_type: &str,
    trait_type: &str,
    value: &Json,
    template: Arc<CompiledTemplate>,
) -> Result<TraitNode, ParseError> {
    if !template.applies_to_workload(workload_type) {
        return Err(ParseError::TraitNotApplicable {
            component: component.to_string(),
            trait_type: trait_type.to_string(),
            workload_type: workload_type.to_string(),
        });
    }
    let parameters = match value {
        Json::Object(_) => value.clone(),
        Json::Null => Json::Object(Map::new()),
        scalar if template.parameter.is_scalar() => scalar.clone(),
        _ => {
            return Err(ParseError::Malformed(format!(
                "trait {} of component {} expects a mapping of parameters",
                trait_type, component
            )))
        }
    };
    if let Some(parameter) = first_unknown(&template, &parameters) {
        return Err(ParseError::UnknownParameter {
            component: component.to_string(),
            trait_type: Some(trait_type.to_string()),
            parameter,
        });
    }
    Ok(TraitNode { type_name: trait_type.to_string(), parameters, template })
}

fn first_unknown(template: &CompiledTemplate, parameters: &Json) -> Option<String> {
    if template.parameter.is_open() { return None; }
    template.parameter.unknown_fields(parameters, "").into_iter().next()
}
