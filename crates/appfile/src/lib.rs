//! Keel appfile: parse an application spec against the template store and
//! render it into concrete manifests.

#![forbid(unsafe_code)]

use std::sync::Arc;

use keel_template::CompiledTemplate;
use serde_json::Value as Json;

mod parser;
mod render;

pub use parser::{parse, ParseError};
pub use render::{NodeId, RenderContext, RenderError, RenderErrors, RenderOutput, Renderer};

/// Parsed application, valid for one reconcile pass.
#[derive(Debug, Clone)]
pub struct Appfile {
    pub name: String,
    pub services: Vec<ComponentNode>,
    /// The raw document this was parsed from; hashed into revisions.
    pub source: Json,
}

#[derive(Debug, Clone)]
pub struct ComponentNode {
    pub name: String,
    pub workload_type: String,
    /// Parameters as written by the user, before schema defaults.
    pub parameters: Json,
    pub traits: Vec<TraitNode>,
    pub template: Arc<CompiledTemplate>,
}

#[derive(Debug, Clone)]
pub struct TraitNode {
    pub type_name: String,
    pub parameters: Json,
    pub template: Arc<CompiledTemplate>,
}

impl Appfile {
    pub fn component(&self, name: &str) -> Option<&ComponentNode> { self.services.iter().find(|c| c.name == name) }
}
