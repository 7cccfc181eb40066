//! Parameter schemas compiled from a template's `parameter` section.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value as Json};

use crate::ast::{Expr, ListItem, StructItem, StructLit};
use crate::eval::constant;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("missing required parameter {0}")]
    Required(String),
    #[error("parameter {path}: expected {expected}, found {found}")]
    TypeMismatch { path: String, expected: String, found: String },
    #[error("unknown parameter {0}")]
    UnknownField(String),
    #[error("unsupported schema: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    /// `_`
    Any,
    String,
    Int,
    Float,
    Number,
    Bool,
    /// A concrete value; acts as its own default.
    Literal(Json),
    Disj { alts: Vec<Schema>, default: Option<Json> },
    /// `[...T]`
    List(Box<Schema>),
    Struct(StructSchema),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructSchema {
    pub fields: Vec<FieldSchema>,
    pub open: bool,
    /// `[string]: T`
    pub pattern: Option<Box<Schema>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub optional: bool,
    pub schema: Schema,
    pub meta: ParamMeta,
}

/// Metadata taken from `// +usage=`, `// +short=` and `// +alias=` comments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParamMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ParamMeta {
    pub fn from_doc(doc: &[String]) -> Self {
        let mut m = ParamMeta::default();
        for line in doc {
            let line = line.trim();
            if let Some(v) = line.strip_prefix("+usage=") { m.usage = Some(v.trim().to_string()); }
            if let Some(v) = line.strip_prefix("+short=") { m.short = Some(v.trim().to_string()); }
            if let Some(v) = line.strip_prefix("+alias=") { m.alias = Some(v.trim().to_string()); }
        }
        m
    }
}

/// Flattened description of one top-level parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Json>,
    #[serde(flatten)]
    pub meta: ParamMeta,
}

/// Named `#Definition` structs a schema may refer to.
pub(crate) type Definitions<'a> = BTreeMap<&'a str, &'a Expr>;

const MAX_DEPTH: usize = 32;

fn path_join(path: &str, name: &str) -> String {
    if path.is_empty() { name.to_string() } else { format!("{}.{}", path, name) }
}

fn kind_of(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(n) if n.is_f64() => "float",
        Json::Number(_) => "int",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "struct",
    }
}

impl Schema {
    pub(crate) fn compile(expr: &Expr, defs: &Definitions<'_>) -> Result<Schema, SchemaError> {
        Self::compile_at(expr, defs, 0)
    }

    fn compile_at(expr: &Expr, defs: &Definitions<'_>, depth: usize) -> Result<Schema, SchemaError> {
        if depth > MAX_DEPTH { return Err(SchemaError::Unsupported("definitions nest too deeply".into())); }
        Ok(match expr {
            Expr::Ident(n) => match n.as_str() {
                "_" => Schema::Any,
                "string" => Schema::String,
                "int" => Schema::Int,
                "float" => Schema::Float,
                "number" => Schema::Number,
                "bool" => Schema::Bool,
                d if d.starts_with('#') => {
                    let def = defs.get(d).ok_or_else(|| SchemaError::Unsupported(format!("undefined definition {}", d)))?;
                    Self::compile_at(def, defs, depth + 1)?
                }
                other => return Err(SchemaError::Unsupported(format!("reference {} in parameter schema", other))),
            },
            Expr::Disj(alts) => {
                let mut default = None;
                let mut out = Vec::with_capacity(alts.len());
                for (is_default, alt) in alts {
                    if *is_default {
                        if default.is_some() { return Err(SchemaError::Unsupported("more than one default".into())); }
                        default = Some(constant(alt).ok_or_else(|| SchemaError::Unsupported("default must be a constant".into()))?);
                    }
                    out.push(Self::compile_at(alt, defs, depth + 1)?);
                }
                Schema::Disj { alts: out, default }
            }
            Expr::Struct(lit) => Schema::Struct(Self::compile_struct(lit, defs, depth)?),
            Expr::List(l) if l.items.is_empty() && l.ellipsis.is_some() => {
                let elem = l.ellipsis.as_deref().map(|e| Self::compile_at(e, defs, depth + 1)).transpose()?;
                Schema::List(Box::new(elem.unwrap_or(Schema::Any)))
            }
            Expr::List(l) if l.items.iter().any(|i| !matches!(i, ListItem::Elem(_))) => {
                return Err(SchemaError::Unsupported("comprehension in parameter schema".into()))
            }
            other => Schema::Literal(constant(other).ok_or_else(|| SchemaError::Unsupported(other.describe()))?),
        })
    }

    fn compile_struct(lit: &StructLit, defs: &Definitions<'_>, depth: usize) -> Result<StructSchema, SchemaError> {
        let mut s = StructSchema { open: lit.open, ..Default::default() };
        for item in &lit.items {
            match item {
                StructItem::Field(f) => {
                    let name = f.name().ok_or_else(|| SchemaError::Unsupported("interpolated label in parameter schema".into()))?;
                    if s.fields.iter().any(|x| x.name == name) {
                        return Err(SchemaError::Unsupported(format!("duplicate parameter {}", name)));
                    }
                    s.fields.push(FieldSchema {
                        name: name.to_string(),
                        optional: f.optional,
                        schema: Self::compile_at(&f.value, defs, depth + 1)?,
                        meta: ParamMeta::from_doc(&f.doc),
                    });
                }
                StructItem::Pattern { key, value } => {
                    if !matches!(key, Expr::Ident(k) if k == "string") {
                        return Err(SchemaError::Unsupported("pattern keys must be string".into()));
                    }
                    s.pattern = Some(Box::new(Self::compile_at(value, defs, depth + 1)?));
                }
                StructItem::If { .. } | StructItem::For { .. } => {
                    return Err(SchemaError::Unsupported("comprehension in parameter schema".into()))
                }
            }
        }
        Ok(s)
    }

    /// Struct schemas that accept arbitrary keys, and `_`.
    pub fn is_open(&self) -> bool {
        match self {
            Schema::Any => true,
            Schema::Struct(s) => s.open || s.pattern.is_some(),
            _ => false,
        }
    }

    /// Whether the schema accepts a non-struct value at the top level.
    pub fn is_scalar(&self) -> bool {
        match self {
            Schema::Struct(_) => false,
            Schema::Disj { alts, .. } => alts.iter().any(|a| a.is_scalar()),
            _ => true,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Schema::Any => "_".into(),
            Schema::String => "string".into(),
            Schema::Int => "int".into(),
            Schema::Float => "float".into(),
            Schema::Number => "number".into(),
            Schema::Bool => "bool".into(),
            Schema::Literal(v) => v.to_string(),
            Schema::Disj { alts, .. } => alts.iter().map(|a| a.describe()).collect::<Vec<_>>().join(" | "),
            Schema::List(e) => format!("[...{}]", e.describe()),
            Schema::Struct(_) => "struct".into(),
        }
    }

    fn default_value(&self) -> Option<Json> {
        match self {
            Schema::Literal(v) => Some(v.clone()),
            Schema::Disj { default, .. } => default.clone(),
            _ => None,
        }
    }

    /// Apply defaults and check types. `None` in, `None` out only for
    /// schemas that accept absence (`_`).
    pub fn resolve(&self, value: Option<&Json>, path: &str) -> Result<Option<Json>, SchemaError> {
        let mismatch = |v: &Json| SchemaError::TypeMismatch {
            path: if path.is_empty() { "parameter".into() } else { path.to_string() },
            expected: self.describe(),
            found: kind_of(v).to_string(),
        };
        let Some(v) = value else {
            return match self {
                Schema::Any => Ok(None),
                Schema::Struct(_) => self.resolve(Some(&Json::Object(Map::new())), path),
                other => other.default_value().map(Some).ok_or_else(|| SchemaError::Required(path.to_string())),
            };
        };
        match self {
            Schema::Any => Ok(Some(v.clone())),
            Schema::String if v.is_string() => Ok(Some(v.clone())),
            Schema::Int if v.is_i64() || v.is_u64() => Ok(Some(v.clone())),
            Schema::Float | Schema::Number if v.is_number() => Ok(Some(v.clone())),
            Schema::Bool if v.is_boolean() => Ok(Some(v.clone())),
            Schema::Literal(l) if crate::eval::json_eq(l, v) => Ok(Some(v.clone())),
            Schema::Disj { alts, .. } => {
                for a in alts {
                    if let Ok(r) = a.resolve(Some(v), path) { return Ok(r); }
                }
                Err(mismatch(v))
            }
            Schema::List(elem) => {
                let items = v.as_array().ok_or_else(|| mismatch(v))?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    if let Some(r) = elem.resolve(Some(item), &format!("{}[{}]", path, i))? { out.push(r); }
                }
                Ok(Some(Json::Array(out)))
            }
            Schema::Struct(s) => {
                let obj = v.as_object().ok_or_else(|| mismatch(v))?;
                let mut out = Map::new();
                for f in &s.fields {
                    let sub = obj.get(&f.name);
                    if sub.is_none() && f.optional { continue; }
                    if let Some(r) = f.schema.resolve(sub, &path_join(path, &f.name))? { out.insert(f.name.clone(), r); }
                }
                for (k, sub) in obj {
                    if s.fields.iter().any(|f| &f.name == k) { continue; }
                    let p = path_join(path, k);
                    match (&s.pattern, s.open) {
                        (Some(pat), _) => {
                            if let Some(r) = pat.resolve(Some(sub), &p)? { out.insert(k.clone(), r); }
                        }
                        (None, true) => { out.insert(k.clone(), sub.clone()); }
                        (None, false) => return Err(SchemaError::UnknownField(p)),
                    }
                }
                Ok(Some(Json::Object(out)))
            }
            _ => Err(mismatch(v)),
        }
    }

    /// Dotted paths of fields in `value` that a closed struct does not declare.
    pub fn unknown_fields(&self, value: &Json, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_unknown(value, path, &mut out);
        out
    }

    fn collect_unknown(&self, value: &Json, path: &str, out: &mut Vec<String>) {
        match (self, value) {
            (Schema::Struct(s), Json::Object(obj)) => {
                for (k, sub) in obj {
                    let p = path_join(path, k);
                    match s.fields.iter().find(|f| &f.name == k) {
                        Some(f) => f.schema.collect_unknown(sub, &p, out),
                        None => match &s.pattern {
                            Some(pat) => pat.collect_unknown(sub, &p, out),
                            None if !s.open => out.push(p),
                            None => {}
                        },
                    }
                }
            }
            (Schema::List(elem), Json::Array(items)) => {
                for (i, item) in items.iter().enumerate() {
                    elem.collect_unknown(item, &format!("{}[{}]", path, i), out);
                }
            }
            (Schema::Disj { alts, .. }, v) => {
                let mut best: Option<Vec<String>> = None;
                for a in alts.iter().filter(|a| matches!(a, Schema::Struct(_) | Schema::List(_))) {
                    let found = a.unknown_fields(v, path);
                    if found.is_empty() { return; }
                    best.get_or_insert(found);
                }
                out.extend(best.unwrap_or_default());
            }
            _ => {}
        }
    }

    /// Top-level parameters with their metadata, in declaration order.
    pub fn parameters(&self) -> Vec<ParameterInfo> {
        match self {
            Schema::Struct(s) => s
                .fields
                .iter()
                .map(|f| ParameterInfo {
                    name: f.name.clone(),
                    type_name: f.schema.describe(),
                    required: !f.optional && f.schema.default_value().is_none() && !matches!(f.schema, Schema::Any | Schema::Struct(_)),
                    default: f.schema.default_value(),
                    meta: f.meta.clone(),
                })
                .collect(),
            other => vec![ParameterInfo {
                name: "parameter".into(),
                type_name: other.describe(),
                required: other.default_value().is_none(),
                default: other.default_value(),
                meta: ParamMeta::default(),
            }],
        }
    }
}
