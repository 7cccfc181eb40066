//! WorkloadDefinition / TraitDefinition objects as template sources.

use keel_core::{KIND_TRAIT_DEFINITION, KIND_WORKLOAD_DEFINITION};
use serde_json::Value as Json;

use crate::{CompiledTemplate, TemplateError, TemplateKind};

const DESCRIPTION_ANNOTATION: &str = "definition.oam.dev/description";

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateDefinition {
    pub name: String,
    pub kind: TemplateKind,
    pub applies_to: Vec<String>,
    pub description: Option<String>,
    pub template: String,
}

impl TemplateDefinition {
    pub fn is_definition(obj: &Json) -> bool {
        matches!(obj.get("kind").and_then(Json::as_str), Some(KIND_WORKLOAD_DEFINITION | KIND_TRAIT_DEFINITION))
    }

    /// Read name, kind, template text and `appliesToWorkloads` from a definition
    /// object. The template is taken from `spec.schematic.cue.template`, else
    /// `spec.extension.template`.
    pub fn from_object(obj: &Json) -> Result<Self, TemplateError> {
        let kind = match obj.get("kind").and_then(Json::as_str) {
            Some(KIND_WORKLOAD_DEFINITION) => TemplateKind::Workload,
            Some(KIND_TRAIT_DEFINITION) => TemplateKind::Trait,
            other => return Err(TemplateError::Definition(format!("unexpected kind {:?}", other))),
        };
        let meta = obj.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(Json::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TemplateError::Definition("missing metadata.name".into()))?
            .to_string();
        let spec = obj.get("spec");
        let template = spec
            .and_then(|s| s.pointer("/schematic/cue/template").or_else(|| s.pointer("/extension/template")))
            .and_then(Json::as_str)
            .ok_or_else(|| TemplateError::Definition(format!("{} has no template", name)))?
            .to_string();
        let applies_to = spec
            .and_then(|s| s.get("appliesToWorkloads"))
            .and_then(Json::as_array)
            .map(|a| a.iter().filter_map(Json::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let description = meta
            .and_then(|m| m.pointer(&format!("/annotations/{}", DESCRIPTION_ANNOTATION.replace('/', "~1"))))
            .and_then(Json::as_str)
            .map(str::to_string);
        Ok(Self { name, kind, applies_to, description, template })
    }

    pub fn compile(&self) -> Result<CompiledTemplate, TemplateError> {
        CompiledTemplate::compile(&self.name, self.kind, self.applies_to.clone(), &self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_trait_definition() {
        let obj = json!({
            "apiVersion": "core.oam.dev/v1beta1",
            "kind": "TraitDefinition",
            "metadata": { "name": "scaler", "annotations": { "definition.oam.dev/description": "Manually scale" } },
            "spec": {
                "appliesToWorkloads": ["webservice", "worker"],
                "extension": { "template": "parameter: {\n\t//+short=r\n\treplicas: *1 | int\n}\noutput: { spec: replicaCount: parameter.replicas }" }
            }
        });
        let def = TemplateDefinition::from_object(&obj).unwrap();
        assert_eq!(def.kind, TemplateKind::Trait);
        assert_eq!(def.applies_to, vec!["webservice", "worker"]);
        assert_eq!(def.description.as_deref(), Some("Manually scale"));
        let t = def.compile().unwrap();
        assert_eq!(t.parameter_info()[0].meta.short.as_deref(), Some("r"));
    }

    #[test]
    fn rejects_incomplete_objects() {
        assert!(TemplateDefinition::from_object(&json!({ "kind": "ConfigMap" })).is_err());
        assert!(TemplateDefinition::from_object(&json!({ "kind": "WorkloadDefinition", "metadata": { "name": "w" } })).is_err());
        let schematic = json!({
            "kind": "WorkloadDefinition",
            "metadata": { "name": "w" },
            "spec": { "schematic": { "cue": { "template": "parameter: {}\noutput: {}" } } }
        });
        assert!(TemplateDefinition::from_object(&schematic).unwrap().compile().is_ok());
    }
}
