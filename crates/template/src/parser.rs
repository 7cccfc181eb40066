//! Recursive-descent parser for the definition DSL.
//!
//! A template file is a struct body without braces. Fields are separated by
//! commas or newlines; `a: b: c` nests; `if`/`for` clauses may appear in
//! struct and list bodies.

use crate::ast::*;
use crate::lexer::{tokenize, tokenize_at, RawPart, Tok, Token};
use crate::TemplateError;

pub fn parse_file(src: &str) -> Result<StructLit, TemplateError> {
    let mut p = Parser { toks: tokenize(src)?, pos: 0 };
    let body = p.struct_body(true)?;
    p.expect(&Tok::Eof, "end of file")?;
    Ok(body)
}

pub fn parse_expr(src: &str) -> Result<Expr, TemplateError> {
    parse_expr_at(src, 1, 1)
}

fn parse_expr_at(src: &str, line: u32, col: u32) -> Result<Expr, TemplateError> {
    let mut p = Parser { toks: tokenize_at(src, line, col)?, pos: 0 };
    let e = p.expr()?;
    p.expect(&Tok::Eof, "end of expression")?;
    Ok(e)
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

fn is_keyword(tok: &Tok, kw: &str) -> bool { matches!(tok, Tok::Ident(n) if n == kw) }

impl Parser {
    fn token_at(&self, n: usize) -> &Token {
        let i = (self.pos + n).min(self.toks.len() - 1);
        &self.toks[i]
    }
    fn token(&self) -> &Token { self.token_at(0) }
    fn peek(&self) -> &Tok { &self.token().tok }
    fn peek_at(&self, n: usize) -> &Tok { &self.token_at(n).tok }

    fn advance(&mut self) -> Token {
        let t = self.token().clone();
        if self.pos < self.toks.len() - 1 { self.pos += 1; }
        t
    }

    fn err(&self, message: impl Into<String>) -> TemplateError {
        let t = self.token();
        TemplateError::Syntax { line: t.line, col: t.col, message: message.into() }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<(), TemplateError> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, TemplateError> {
        match self.peek().clone() {
            Tok::Ident(n) => { self.advance(); Ok(n) }
            other => Err(self.err(format!("expected {}, found {:?}", what, other))),
        }
    }

    /// After an item: a comma, a newline, or the closing token.
    fn separator(&self, close: &Tok) -> Result<(), TemplateError> {
        let t = self.token();
        if t.tok == Tok::Comma || &t.tok == close || t.tok == Tok::Eof || t.nl_before {
            Ok(())
        } else {
            Err(self.err(format!("expected ',' or newline, found {:?}", t.tok)))
        }
    }

    fn is_clause(&self, kw: &str) -> bool {
        is_keyword(self.peek(), kw) && !matches!(self.peek_at(1), Tok::Colon | Tok::Question)
    }

    fn struct_body(&mut self, top: bool) -> Result<StructLit, TemplateError> {
        let close = if top { Tok::Eof } else { Tok::RBrace };
        let mut lit = StructLit::default();
        loop {
            while self.peek() == &Tok::Comma { self.advance(); }
            if self.peek() == &close { break; }
            if self.peek() == &Tok::Eof { return Err(self.err("unclosed '{'")); }
            if top && self.is_clause("package") {
                self.advance();
                self.ident("package name")?;
            } else if top && self.is_clause("import") {
                self.advance();
                self.import_spec()?;
            } else if self.peek() == &Tok::Ellipsis {
                self.advance();
                lit.open = true;
            } else if self.is_clause("if") {
                self.advance();
                let cond = self.expr()?;
                let body = self.braced_struct()?;
                lit.items.push(StructItem::If { cond, body });
            } else if self.is_clause("for") {
                let (key, value, source, body) = self.for_clause()?;
                lit.items.push(StructItem::For { key, value, source, body });
            } else if self.peek() == &Tok::LBrack {
                lit.items.push(self.pattern()?);
            } else {
                lit.items.push(StructItem::Field(self.field()?));
            }
            self.separator(&close)?;
        }
        Ok(lit)
    }

    fn import_spec(&mut self) -> Result<(), TemplateError> {
        match self.peek() {
            Tok::Str(_) => { self.advance(); Ok(()) }
            Tok::LParen => {
                self.advance();
                while matches!(self.peek(), Tok::Str(_) | Tok::Comma) { self.advance(); }
                self.expect(&Tok::RParen, "')'")
            }
            other => Err(self.err(format!("expected import path, found {:?}", other))),
        }
    }

    fn braced_struct(&mut self) -> Result<StructLit, TemplateError> {
        self.expect(&Tok::LBrace, "'{'")?;
        let body = self.struct_body(false)?;
        self.expect(&Tok::RBrace, "'}'")?;
        Ok(body)
    }

    fn for_clause(&mut self) -> Result<(Option<String>, String, Expr, StructLit), TemplateError> {
        self.advance();
        let first = self.ident("loop variable")?;
        let (key, value) = if self.peek() == &Tok::Comma {
            self.advance();
            (Some(first), self.ident("loop variable")?)
        } else {
            (None, first)
        };
        if !is_keyword(self.peek(), "in") { return Err(self.err("expected 'in'")); }
        self.advance();
        let source = self.expr()?;
        let body = self.braced_struct()?;
        Ok((key, value, source, body))
    }

    fn pattern(&mut self) -> Result<StructItem, TemplateError> {
        self.expect(&Tok::LBrack, "'['")?;
        let key = self.expr()?;
        self.expect(&Tok::RBrack, "']'")?;
        self.expect(&Tok::Colon, "':'")?;
        let value = self.field_value()?;
        Ok(StructItem::Pattern { key, value })
    }

    fn field(&mut self) -> Result<Field, TemplateError> {
        let doc = self.token().doc.clone();
        let label = match self.peek().clone() {
            Tok::Ident(n) => { self.advance(); Label::Name(n) }
            Tok::Str(parts) => {
                self.advance();
                if parts.iter().all(|p| matches!(p, RawPart::Lit(_))) {
                    Label::Name(parts.into_iter().filter_map(|p| match p { RawPart::Lit(s) => Some(s), _ => None }).collect())
                } else {
                    Label::Interp(self.str_parts(parts)?)
                }
            }
            other => return Err(self.err(format!("expected field label, found {:?}", other))),
        };
        let optional = if self.peek() == &Tok::Question { self.advance(); true } else { false };
        self.expect(&Tok::Colon, "':'")?;
        let value = self.field_value()?;
        Ok(Field { label, optional, value, doc })
    }

    fn field_value(&mut self) -> Result<Expr, TemplateError> {
        let label_like = matches!(self.peek(), Tok::Ident(_) | Tok::Str(_));
        let nested = label_like
            && (self.peek_at(1) == &Tok::Colon || (self.peek_at(1) == &Tok::Question && self.peek_at(2) == &Tok::Colon));
        if nested {
            let f = self.field()?;
            return Ok(Expr::Struct(StructLit { items: vec![StructItem::Field(f)], open: false }));
        }
        if self.peek() == &Tok::LBrack && self.peek_at(2) == &Tok::RBrack && self.peek_at(3) == &Tok::Colon {
            let p = self.pattern()?;
            return Ok(Expr::Struct(StructLit { items: vec![p], open: false }));
        }
        self.expr()
    }

    fn str_parts(&self, parts: Vec<RawPart>) -> Result<Vec<StrPart>, TemplateError> {
        parts
            .into_iter()
            .map(|p| match p {
                RawPart::Lit(s) => Ok(StrPart::Lit(s)),
                RawPart::Interp { src, line, col } => parse_expr_at(&src, line, col).map(StrPart::Expr),
            })
            .collect()
    }

    pub fn expr(&mut self) -> Result<Expr, TemplateError> {
        let mut alts = vec![self.disjunct()?];
        while self.peek() == &Tok::Pipe {
            self.advance();
            alts.push(self.disjunct()?);
        }
        if alts.len() == 1 && !alts[0].0 {
            return Ok(alts.remove(0).1);
        }
        Ok(Expr::Disj(alts))
    }

    fn disjunct(&mut self) -> Result<(bool, Expr), TemplateError> {
        if self.peek() == &Tok::Star {
            self.advance();
            Ok((true, self.or_expr()?))
        } else {
            Ok((false, self.or_expr()?))
        }
    }

    fn or_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == &Tok::OrOr {
            self.advance();
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(self.and_expr()?));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.cmp_expr()?;
        while self.peek() == &Tok::AndAnd {
            self.advance();
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(self.cmp_expr()?));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.add_expr()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinOp::Eq,
                Tok::NotEq => BinOp::Ne,
                Tok::Lt => BinOp::Lt,
                Tok::Le => BinOp::Le,
                Tok::Gt => BinOp::Gt,
                Tok::Ge => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.advance();
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.add_expr()?));
        }
    }

    fn add_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.mul_expr()?));
        }
    }

    fn mul_expr(&mut self) -> Result<Expr, TemplateError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.unary()?));
        }
    }

    fn unary(&mut self) -> Result<Expr, TemplateError> {
        match self.peek() {
            Tok::Minus => {
                self.advance();
                Ok(match self.unary()? {
                    Expr::Int(i) => Expr::Int(-i),
                    Expr::Float(f) => Expr::Float(-f),
                    other => Expr::Unary(UnOp::Neg, Box::new(other)),
                })
            }
            Tok::Bang => {
                self.advance();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr, TemplateError> {
        let mut e = self.primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let name = self.ident("field name after '.'")?;
                    e = Expr::Select(Box::new(e), name);
                }
                // a '[' on a new line starts a pattern field, not an index
                Tok::LBrack if !self.token().nl_before => {
                    self.advance();
                    let idx = self.expr()?;
                    self.expect(&Tok::RBrack, "']'")?;
                    e = Expr::Index(Box::new(e), Box::new(idx));
                }
                Tok::LParen if !self.token().nl_before => {
                    let Some(name) = dotted(&e) else { return Err(self.err("only named builtins can be called")) };
                    self.advance();
                    let mut args = Vec::new();
                    while self.peek() != &Tok::RParen {
                        args.push(self.expr()?);
                        if self.peek() == &Tok::Comma { self.advance(); } else { break; }
                    }
                    self.expect(&Tok::RParen, "')'")?;
                    e = Expr::Call(name, args);
                }
                _ => return Ok(e),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        let t = self.advance();
        Ok(match t.tok {
            Tok::Int(i) => Expr::Int(i),
            Tok::Float(f) => Expr::Float(f),
            Tok::Str(parts) => Expr::Str(self.str_parts(parts)?),
            Tok::Bottom => Expr::Bottom,
            Tok::Ident(n) => match n.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "null" => Expr::Null,
                _ => Expr::Ident(n),
            },
            Tok::LParen => {
                let e = self.expr()?;
                self.expect(&Tok::RParen, "')'")?;
                e
            }
            Tok::LBrace => {
                let body = self.struct_body(false)?;
                self.expect(&Tok::RBrace, "'}'")?;
                Expr::Struct(body)
            }
            Tok::LBrack => Expr::List(self.list_body()?),
            other => {
                return Err(TemplateError::Syntax { line: t.line, col: t.col, message: format!("unexpected {:?}", other) })
            }
        })
    }

    /// Elements after the opening `[`, through the closing `]`.
    fn list_body(&mut self) -> Result<ListLit, TemplateError> {
        let mut lit = ListLit::default();
        loop {
            while self.peek() == &Tok::Comma { self.advance(); }
            if self.peek() == &Tok::RBrack { break; }
            if self.peek() == &Tok::Eof { return Err(self.err("unclosed '['")); }
            if self.peek() == &Tok::Ellipsis {
                self.advance();
                let ty = if matches!(self.peek(), Tok::RBrack | Tok::Comma) { Expr::Ident("_".into()) } else { self.expr()? };
                lit.ellipsis = Some(Box::new(ty));
            } else if is_keyword(self.peek(), "for") {
                let (key, value, source, body) = self.for_clause()?;
                lit.items.push(ListItem::For { key, value, source, body });
            } else if is_keyword(self.peek(), "if") {
                self.advance();
                let cond = self.expr()?;
                let body = self.braced_struct()?;
                lit.items.push(ListItem::If { cond, body });
            } else {
                lit.items.push(ListItem::Elem(self.expr()?));
            }
            self.separator(&Tok::RBrack)?;
        }
        self.expect(&Tok::RBrack, "']'")?;
        Ok(lit)
    }
}

fn dotted(e: &Expr) -> Option<String> {
    match e {
        Expr::Ident(n) => Some(n.clone()),
        Expr::Select(base, f) => Some(format!("{}.{}", dotted(base)?, f)),
        _ => None,
    }
}
