//! Syntax tree of a definition template.

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Vec<StrPart>),
    /// `_|_`
    Bottom,
    Ident(String),
    Select(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    /// Builtin call such as `len(x)` or `strings.Join(xs, ",")`.
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `a | *b | c`: every alternative with its default marker.
    Disj(Vec<(bool, Expr)>),
    Struct(StructLit),
    List(ListLit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrPart {
    Lit(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructLit {
    pub items: Vec<StructItem>,
    /// Declared with `...`: unknown fields are allowed.
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructItem {
    Field(Field),
    /// `[string]: T`
    Pattern { key: Expr, value: Expr },
    If { cond: Expr, body: StructLit },
    For { key: Option<String>, value: String, source: Expr, body: StructLit },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Name(String),
    Interp(Vec<StrPart>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub label: Label,
    pub optional: bool,
    pub value: Expr,
    pub doc: Vec<String>,
}

impl Field {
    /// Static name of the field, `None` for interpolated labels.
    pub fn name(&self) -> Option<&str> {
        match &self.label {
            Label::Name(n) => Some(n),
            Label::Interp(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListLit {
    pub items: Vec<ListItem>,
    /// `[...T]`: open list whose further elements must be `T`.
    pub ellipsis: Option<Box<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListItem {
    Elem(Expr),
    If { cond: Expr, body: StructLit },
    For { key: Option<String>, value: String, source: Expr, body: StructLit },
}

impl Expr {
    /// Dotted rendering of a reference chain, used in error messages.
    pub fn describe(&self) -> String {
        match self {
            Expr::Ident(n) => n.clone(),
            Expr::Select(base, f) => format!("{}.{}", base.describe(), f),
            Expr::Index(base, idx) => match idx.as_ref() {
                Expr::Int(i) => format!("{}[{}]", base.describe(), i),
                Expr::Str(parts) => match parts.as_slice() {
                    [StrPart::Lit(s)] => format!("{}[{:?}]", base.describe(), s),
                    _ => format!("{}[..]", base.describe()),
                },
                other => format!("{}[{}]", base.describe(), other.describe()),
            },
            Expr::Call(f, _) => format!("{}(..)", f),
            Expr::Int(i) => i.to_string(),
            _ => "<expr>".to_string(),
        }
    }
}
