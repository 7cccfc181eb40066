//! Evaluation of a compiled template against resolved parameters and a
//! render context.
//!
//! Values are plain JSON. An undefined reference (a missing field, `_|_`)
//! is `None` while it flows through selectors and `!= _|_` checks, and
//! becomes an error only where a concrete value is required.

use std::cell::RefCell;
use std::collections::BTreeSet;

use serde_json::{Map, Number, Value as Json};

use crate::ast::{BinOp, Expr, Label, ListItem, ListLit, StrPart, StructItem, StructLit, UnOp};
use crate::{CompiledTemplate, Program};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("{path}: reference {reference} is undefined")]
    Undefined { path: String, reference: String },
    #[error("{path}: {what} is not a concrete value")]
    Incomplete { path: String, what: String },
    #[error("{path}: {message}")]
    Type { path: String, message: String },
    #[error("{path}: conflicting values {left} and {right}")]
    Conflict { path: String, left: String, right: String },
    #[error("{path}: unknown function {name}")]
    UnknownFunction { path: String, name: String },
    #[error("{path}: reference cycle through {name}")]
    Cycle { path: String, name: String },
}

/// What a template produced: the main document and named auxiliaries in
/// declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluated {
    pub output: Option<Json>,
    pub outputs: Vec<(String, Json)>,
}

/// Seam between the rendering pipeline and the template language.
pub trait TemplateEvaluator: Send + Sync {
    fn evaluate(&self, template: &CompiledTemplate, parameter: &Json, context: &Json) -> Result<Evaluated, EvalError>;
}

/// Evaluator for the built-in definition DSL.
#[derive(Debug, Clone, Copy, Default)]
pub struct DslEvaluator;

impl TemplateEvaluator for DslEvaluator {
    fn evaluate(&self, template: &CompiledTemplate, parameter: &Json, context: &Json) -> Result<Evaluated, EvalError> {
        let m = Machine::new(&template.program, parameter, context);
        let root = Env::root();
        let output = template.program.output.as_ref().map(|e| m.concrete(e, &root, "output")).transpose()?;
        let mut outputs = Map::new();
        for e in &template.program.outputs {
            match m.concrete(e, &root, "outputs")? {
                Json::Object(obj) => {
                    for (k, v) in obj {
                        let p = format!("outputs.{}", k);
                        insert_unify(&mut outputs, k, v, &p)?;
                    }
                }
                other => return Err(type_err("outputs", format!("must be a struct, found {}", kind_name(&other)))),
            }
        }
        Ok(Evaluated { output, outputs: outputs.into_iter().collect() })
    }
}

struct Env<'p> {
    vars: Vec<(String, Json)>,
    parent: Option<&'p Env<'p>>,
}

impl<'p> Env<'p> {
    fn root() -> Self { Env { vars: Vec::new(), parent: None } }

    fn get(&self, name: &str) -> Option<&Json> {
        self.vars.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v).or_else(|| self.parent.and_then(|p| p.get(name)))
    }
}

struct Machine<'t> {
    program: &'t Program,
    parameter: &'t Json,
    context: &'t Json,
    memo: RefCell<Map<String, Json>>,
    active: RefCell<BTreeSet<String>>,
}

fn type_err(path: &str, message: impl Into<String>) -> EvalError {
    EvalError::Type { path: path.to_string(), message: message.into() }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_string() } else { format!("{}.{}", path, key) }
}

fn kind_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "list",
        Json::Object(_) => "struct",
    }
}

const TYPE_NAMES: [&str; 6] = ["_", "string", "int", "float", "number", "bool"];

impl<'t> Machine<'t> {
    fn new(program: &'t Program, parameter: &'t Json, context: &'t Json) -> Self {
        Self { program, parameter, context, memo: RefCell::new(Map::new()), active: RefCell::new(BTreeSet::new()) }
    }

    fn concrete(&self, e: &Expr, env: &Env<'_>, path: &str) -> Result<Json, EvalError> {
        self.value(e, env, path)?
            .ok_or_else(|| EvalError::Undefined { path: path.to_string(), reference: e.describe() })
    }

    fn value(&self, e: &Expr, env: &Env<'_>, path: &str) -> Result<Option<Json>, EvalError> {
        Ok(Some(match e {
            Expr::Null => Json::Null,
            Expr::Bool(b) => Json::Bool(*b),
            Expr::Int(i) => Json::from(*i),
            Expr::Float(f) => float(*f, path)?,
            Expr::Str(parts) => Json::String(self.interpolate(parts, env, path)?),
            Expr::Bottom => return Ok(None),
            Expr::Ident(n) => return self.lookup(n, env, path),
            Expr::Select(base, field) => {
                return match self.value(base, env, path)? {
                    None => Ok(None),
                    Some(Json::Object(m)) => Ok(m.get(field).cloned()),
                    Some(other) => Err(type_err(path, format!("cannot select {} from {}", field, kind_name(&other)))),
                }
            }
            Expr::Index(base, idx) => {
                let Some(b) = self.value(base, env, path)? else { return Ok(None) };
                let i = self.concrete(idx, env, path)?;
                return match (&b, &i) {
                    (Json::Object(m), Json::String(k)) => Ok(m.get(k).cloned()),
                    (Json::Array(a), Json::Number(n)) => Ok(n.as_u64().and_then(|n| a.get(n as usize)).cloned()),
                    _ => Err(type_err(path, format!("cannot index {} with {}", kind_name(&b), kind_name(&i)))),
                };
            }
            Expr::Call(name, args) => self.call(name, args, env, path)?,
            Expr::Unary(op, inner) => {
                let v = self.concrete(inner, env, path)?;
                match (op, &v) {
                    (UnOp::Not, Json::Bool(b)) => Json::Bool(!b),
                    (UnOp::Neg, Json::Number(_)) => num_json(Num::of(&v).neg(), path)?,
                    _ => return Err(type_err(path, format!("invalid operand {} for unary operator", kind_name(&v)))),
                }
            }
            Expr::Binary(op, l, r) => self.binary(*op, l, r, env, path)?,
            Expr::Disj(alts) => {
                if let Some((_, d)) = alts.iter().find(|(is_default, _)| *is_default) {
                    return self.value(d, env, path);
                }
                for (_, alt) in alts {
                    if let Ok(Some(v)) = self.value(alt, env, path) { return Ok(Some(v)); }
                }
                return Err(EvalError::Incomplete { path: path.to_string(), what: "disjunction".into() });
            }
            Expr::Struct(lit) => Json::Object(self.struct_value(lit, env, path)?),
            Expr::List(lit) => Json::Array(self.list_value(lit, env, path)?),
        }))
    }

    fn lookup(&self, name: &str, env: &Env<'_>, path: &str) -> Result<Option<Json>, EvalError> {
        if let Some(v) = env.get(name) { return Ok(Some(v.clone())); }
        match name {
            "parameter" => return Ok(Some(self.parameter.clone())),
            "context" => return Ok(Some(self.context.clone())),
            _ => {}
        }
        if let Some(v) = self.memo.borrow().get(name) { return Ok(Some(v.clone())); }
        if let Some((_, e)) = self.program.helpers.iter().find(|(n, _)| n == name) {
            if !self.active.borrow_mut().insert(name.to_string()) {
                return Err(EvalError::Cycle { path: path.to_string(), name: name.to_string() });
            }
            let v = self.value(e, &Env::root(), name);
            self.active.borrow_mut().remove(name);
            let v = v?;
            if let Some(v) = &v { self.memo.borrow_mut().insert(name.to_string(), v.clone()); }
            return Ok(v);
        }
        if TYPE_NAMES.contains(&name) {
            return Err(EvalError::Incomplete { path: path.to_string(), what: name.to_string() });
        }
        Err(EvalError::Undefined { path: path.to_string(), reference: name.to_string() })
    }

    fn interpolate(&self, parts: &[StrPart], env: &Env<'_>, path: &str) -> Result<String, EvalError> {
        let mut s = String::new();
        for p in parts {
            match p {
                StrPart::Lit(l) => s.push_str(l),
                StrPart::Expr(e) => match self.concrete(e, env, path)? {
                    Json::String(v) => s.push_str(&v),
                    v @ (Json::Number(_) | Json::Bool(_)) => s.push_str(&v.to_string()),
                    other => return Err(type_err(path, format!("cannot interpolate {}", kind_name(&other)))),
                },
            }
        }
        Ok(s)
    }

    fn label(&self, label: &Label, env: &Env<'_>, path: &str) -> Result<String, EvalError> {
        match label {
            Label::Name(n) => Ok(n.clone()),
            Label::Interp(parts) => self.interpolate(parts, env, path),
        }
    }

    fn truthy(&self, cond: &Expr, env: &Env<'_>, path: &str) -> Result<bool, EvalError> {
        match self.value(cond, env, path)? {
            Some(Json::Bool(b)) => Ok(b),
            None => Ok(false),
            Some(other) => Err(type_err(path, format!("condition must be bool, found {}", kind_name(&other)))),
        }
    }

    fn iterate(&self, source: &Expr, env: &Env<'_>, path: &str) -> Result<Vec<(Json, Json)>, EvalError> {
        match self.concrete(source, env, path)? {
            Json::Object(m) => Ok(m.into_iter().map(|(k, v)| (Json::String(k), v)).collect()),
            Json::Array(a) => Ok(a.into_iter().enumerate().map(|(i, v)| (Json::from(i as u64), v)).collect()),
            other => Err(type_err(path, format!("cannot iterate over {}", kind_name(&other)))),
        }
    }

    fn bind<'p>(env: &'p Env<'p>, key: &Option<String>, value: &str, k: Json, v: Json) -> Env<'p> {
        let mut vars = vec![(value.to_string(), v)];
        if let Some(key) = key { vars.push((key.clone(), k)); }
        Env { vars, parent: Some(env) }
    }

    fn struct_value(&self, lit: &StructLit, env: &Env<'_>, path: &str) -> Result<Map<String, Json>, EvalError> {
        let mut out = Map::new();
        for item in &lit.items {
            match item {
                StructItem::Field(f) => {
                    let key = self.label(&f.label, env, path)?;
                    let p = join(path, &key);
                    match self.value(&f.value, env, &p)? {
                        Some(v) => insert_unify(&mut out, key, v, &p)?,
                        None if f.optional => {}
                        None => return Err(EvalError::Undefined { path: p, reference: f.value.describe() }),
                    }
                }
                StructItem::Pattern { .. } => {}
                StructItem::If { cond, body } => {
                    if self.truthy(cond, env, path)? {
                        for (k, v) in self.struct_value(body, env, path)? {
                            let p = join(path, &k);
                            insert_unify(&mut out, k, v, &p)?;
                        }
                    }
                }
                StructItem::For { key, value, source, body } => {
                    for (k, v) in self.iterate(source, env, path)? {
                        let child = Self::bind(env, key, value, k, v);
                        for (k, v) in self.struct_value(body, &child, path)? {
                            let p = join(path, &k);
                            insert_unify(&mut out, k, v, &p)?;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn list_value(&self, lit: &ListLit, env: &Env<'_>, path: &str) -> Result<Vec<Json>, EvalError> {
        let mut out = Vec::new();
        for item in &lit.items {
            match item {
                ListItem::Elem(e) => {
                    let p = format!("{}[{}]", path, out.len());
                    out.push(self.concrete(e, env, &p)?);
                }
                ListItem::If { cond, body } => {
                    if self.truthy(cond, env, path)? {
                        let p = format!("{}[{}]", path, out.len());
                        out.push(Json::Object(self.struct_value(body, env, &p)?));
                    }
                }
                ListItem::For { key, value, source, body } => {
                    for (k, v) in self.iterate(source, env, path)? {
                        let child = Self::bind(env, key, value, k, v);
                        let p = format!("{}[{}]", path, out.len());
                        out.push(Json::Object(self.struct_value(body, &child, &p)?));
                    }
                }
            }
        }
        Ok(out)
    }

    fn binary(&self, op: BinOp, l: &Expr, r: &Expr, env: &Env<'_>, path: &str) -> Result<Json, EvalError> {
        // `x == _|_` / `x != _|_` test definedness; evaluation errors count as undefined
        if matches!(op, BinOp::Eq | BinOp::Ne) && (*l == Expr::Bottom || *r == Expr::Bottom) {
            let other = if *l == Expr::Bottom { r } else { l };
            let defined = matches!(self.value(other, env, path), Ok(Some(_)));
            return Ok(Json::Bool(if op == BinOp::Eq { !defined } else { defined }));
        }
        if matches!(op, BinOp::And | BinOp::Or) {
            let lv = self.bool_of(l, env, path)?;
            if (op == BinOp::And && !lv) || (op == BinOp::Or && lv) { return Ok(Json::Bool(lv)); }
            return Ok(Json::Bool(self.bool_of(r, env, path)?));
        }
        let lv = self.concrete(l, env, path)?;
        let rv = self.concrete(r, env, path)?;
        let bad = || type_err(path, format!("invalid operands {} and {} for {:?}", kind_name(&lv), kind_name(&rv), op));
        Ok(match op {
            BinOp::Eq => Json::Bool(json_eq(&lv, &rv)),
            BinOp::Ne => Json::Bool(!json_eq(&lv, &rv)),
            BinOp::Add => match (&lv, &rv) {
                (Json::String(a), Json::String(b)) => Json::String(format!("{}{}", a, b)),
                (Json::Array(a), Json::Array(b)) => Json::Array(a.iter().chain(b.iter()).cloned().collect()),
                (Json::Number(_), Json::Number(_)) => num_json(Num::of(&lv).add(Num::of(&rv)), path)?,
                _ => return Err(bad()),
            },
            BinOp::Sub | BinOp::Mul | BinOp::Div => {
                if !(lv.is_number() && rv.is_number()) { return Err(bad()); }
                let (a, b) = (Num::of(&lv), Num::of(&rv));
                let n = match op {
                    BinOp::Sub => a.sub(b),
                    BinOp::Mul => a.mul(b),
                    _ => a.div(b).ok_or_else(|| type_err(path, "division by zero"))?,
                };
                num_json(n, path)?
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let ord = match (&lv, &rv) {
                    (Json::Number(_), Json::Number(_)) => Num::of(&lv).as_f64().partial_cmp(&Num::of(&rv).as_f64()),
                    (Json::String(a), Json::String(b)) => Some(a.cmp(b)),
                    _ => None,
                };
                let ord = ord.ok_or_else(bad)?;
                Json::Bool(match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    _ => ord.is_ge(),
                })
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        })
    }

    fn bool_of(&self, e: &Expr, env: &Env<'_>, path: &str) -> Result<bool, EvalError> {
        match self.concrete(e, env, path)? {
            Json::Bool(b) => Ok(b),
            other => Err(type_err(path, format!("expected bool, found {}", kind_name(&other)))),
        }
    }

    fn call(&self, name: &str, args: &[Expr], env: &Env<'_>, path: &str) -> Result<Json, EvalError> {
        let vals = args.iter().map(|a| self.concrete(a, env, path)).collect::<Result<Vec<_>, _>>()?;
        let arity = |n: usize| {
            if vals.len() == n { Ok(()) } else { Err(type_err(path, format!("{} expects {} argument(s), got {}", name, n, vals.len()))) }
        };
        let string = |v: &Json| v.as_str().map(str::to_string).ok_or_else(|| type_err(path, format!("{} expects string arguments", name)));
        Ok(match name {
            "len" => {
                arity(1)?;
                let n = match &vals[0] {
                    Json::String(s) => s.chars().count(),
                    Json::Array(a) => a.len(),
                    Json::Object(m) => m.len(),
                    other => return Err(type_err(path, format!("len of {}", kind_name(other)))),
                };
                Json::from(n as u64)
            }
            "strings.Join" => {
                arity(2)?;
                let items = vals[0].as_array().ok_or_else(|| type_err(path, "strings.Join expects a list"))?;
                let parts = items.iter().map(string).collect::<Result<Vec<_>, _>>()?;
                Json::String(parts.join(&string(&vals[1])?))
            }
            "strings.ToLower" => { arity(1)?; Json::String(string(&vals[0])?.to_lowercase()) }
            "strings.ToUpper" => { arity(1)?; Json::String(string(&vals[0])?.to_uppercase()) }
            "strings.TrimSpace" => { arity(1)?; Json::String(string(&vals[0])?.trim().to_string()) }
            "strings.Contains" => { arity(2)?; Json::Bool(string(&vals[0])?.contains(&string(&vals[1])?)) }
            "strings.HasPrefix" => { arity(2)?; Json::Bool(string(&vals[0])?.starts_with(&string(&vals[1])?)) }
            "strconv.FormatInt" => {
                arity(2)?;
                let n = vals[0].as_i64().ok_or_else(|| type_err(path, "strconv.FormatInt expects an int"))?;
                if vals[1].as_i64() != Some(10) { return Err(type_err(path, "strconv.FormatInt supports base 10 only")); }
                Json::String(n.to_string())
            }
            _ => return Err(EvalError::UnknownFunction { path: path.to_string(), name: name.to_string() }),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn of(v: &Json) -> Num {
        match v.as_i64() {
            Some(i) => Num::I(i),
            None => Num::F(v.as_f64().unwrap_or(0.0)),
        }
    }
    fn as_f64(self) -> f64 {
        match self { Num::I(i) => i as f64, Num::F(f) => f }
    }
    fn neg(self) -> Num {
        match self { Num::I(i) => i.checked_neg().map(Num::I).unwrap_or(Num::F(-(i as f64))), Num::F(f) => Num::F(-f) }
    }
    fn add(self, o: Num) -> Num {
        match (self, o) {
            (Num::I(a), Num::I(b)) => a.checked_add(b).map(Num::I).unwrap_or(Num::F(a as f64 + b as f64)),
            _ => Num::F(self.as_f64() + o.as_f64()),
        }
    }
    fn sub(self, o: Num) -> Num {
        match (self, o) {
            (Num::I(a), Num::I(b)) => a.checked_sub(b).map(Num::I).unwrap_or(Num::F(a as f64 - b as f64)),
            _ => Num::F(self.as_f64() - o.as_f64()),
        }
    }
    fn mul(self, o: Num) -> Num {
        match (self, o) {
            (Num::I(a), Num::I(b)) => a.checked_mul(b).map(Num::I).unwrap_or(Num::F(a as f64 * b as f64)),
            _ => Num::F(self.as_f64() * o.as_f64()),
        }
    }
    /// Exact integer quotients stay integers.
    fn div(self, o: Num) -> Option<Num> {
        if o.as_f64() == 0.0 { return None; }
        Some(match (self, o) {
            (Num::I(a), Num::I(b)) if a.checked_rem(b) == Some(0) => {
                a.checked_div(b).map(Num::I).unwrap_or(Num::F(a as f64 / b as f64))
            }
            _ => Num::F(self.as_f64() / o.as_f64()),
        })
    }
}

fn float(f: f64, path: &str) -> Result<Json, EvalError> {
    Number::from_f64(f).map(Json::Number).ok_or_else(|| type_err(path, "non-finite number"))
}

fn num_json(n: Num, path: &str) -> Result<Json, EvalError> {
    match n {
        Num::I(i) => Ok(Json::from(i)),
        Num::F(f) => float(f, path),
    }
}

/// Structural equality with numbers compared by value (`1 == 1.0`).
pub fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(_), Json::Number(_)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => a.as_f64() == b.as_f64(),
        },
        (Json::Array(x), Json::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(p, q)| json_eq(p, q)),
        (Json::Object(x), Json::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Merge `value` into `map[key]`: structs merge field by field, equal values
/// collapse, anything else conflicts.
fn insert_unify(map: &mut Map<String, Json>, key: String, value: Json, path: &str) -> Result<(), EvalError> {
    match map.get_mut(&key) {
        None => {
            map.insert(key, value);
            Ok(())
        }
        Some(existing) => {
            let merged = unify(existing.take(), value, path)?;
            *existing = merged;
            Ok(())
        }
    }
}

fn unify(a: Json, b: Json, path: &str) -> Result<Json, EvalError> {
    match (a, b) {
        (Json::Object(mut x), Json::Object(y)) => {
            for (k, v) in y {
                let p = join(path, &k);
                insert_unify(&mut x, k, v, &p)?;
            }
            Ok(Json::Object(x))
        }
        (a, b) if json_eq(&a, &b) => Ok(a),
        (a, b) => Err(EvalError::Conflict { path: path.to_string(), left: a.to_string(), right: b.to_string() }),
    }
}

/// Value of an expression made only of literals.
pub(crate) fn constant(e: &Expr) -> Option<Json> {
    match e {
        Expr::Null => Some(Json::Null),
        Expr::Bool(b) => Some(Json::Bool(*b)),
        Expr::Int(i) => Some(Json::from(*i)),
        Expr::Float(f) => Number::from_f64(*f).map(Json::Number),
        Expr::Str(parts) => match parts.as_slice() {
            [StrPart::Lit(s)] => Some(Json::String(s.clone())),
            [] => Some(Json::String(String::new())),
            _ => None,
        },
        Expr::List(l) if l.ellipsis.is_none() => l
            .items
            .iter()
            .map(|i| match i { ListItem::Elem(e) => constant(e), _ => None })
            .collect::<Option<Vec<_>>>()
            .map(Json::Array),
        Expr::Struct(s) if !s.open => {
            let mut m = Map::new();
            for item in &s.items {
                let StructItem::Field(f) = item else { return None };
                if f.optional { return None; }
                m.insert(f.name()?.to_string(), constant(&f.value)?);
            }
            Some(Json::Object(m))
        }
        _ => None,
    }
}
