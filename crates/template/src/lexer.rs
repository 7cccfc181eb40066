//! Tokenizer for the definition DSL.
//!
//! Newlines are not tokens; each token records whether a newline preceded it
//! so the parser can treat line breaks as field separators. Line comments
//! directly above a token are kept as its doc lines.

use crate::TemplateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Str(Vec<RawPart>),
    Int(i64),
    Float(f64),
    LBrace,
    RBrace,
    LBrack,
    RBrack,
    LParen,
    RParen,
    Colon,
    Comma,
    Dot,
    Question,
    Star,
    Pipe,
    Ellipsis,
    Plus,
    Minus,
    Slash,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Bottom,
    Eof,
}

/// Piece of a string literal; interpolations keep their source text and are
/// parsed by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPart {
    Lit(String),
    Interp { src: String, line: u32, col: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub col: u32,
    pub nl_before: bool,
    pub doc: Vec<String>,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, TemplateError> {
    tokenize_at(src, 1, 1)
}

/// Tokenize a fragment that starts at `line:col` of the enclosing source.
pub fn tokenize_at(src: &str, line: u32, col: u32) -> Result<Vec<Token>, TemplateError> {
    let mut lx = Lexer { chars: src.chars().collect(), pos: 0, line, col };
    let mut out = Vec::new();
    let mut nl_before = true;
    let mut doc: Vec<String> = Vec::new();
    loop {
        // whitespace and comments
        loop {
            match lx.peek() {
                Some('\n') => {
                    lx.bump();
                    if nl_before && lx.peek_blank_line() { doc.clear(); }
                    nl_before = true;
                }
                Some(c) if c.is_whitespace() => { lx.bump(); }
                Some('/') if lx.peek_at(1) == Some('/') => {
                    lx.bump();
                    lx.bump();
                    let mut text = String::new();
                    while let Some(c) = lx.peek() {
                        if c == '\n' { break; }
                        text.push(c);
                        lx.bump();
                    }
                    if !nl_before { continue; }
                    doc.push(text.trim().to_string());
                }
                _ => break,
            }
        }
        let (line, col) = (lx.line, lx.col);
        let Some(c) = lx.peek() else {
            out.push(Token { tok: Tok::Eof, line, col, nl_before: true, doc: Vec::new() });
            return Ok(out);
        };
        let tok = lx.next_tok(c)?;
        out.push(Token { tok, line, col, nl_before, doc: std::mem::take(&mut doc) });
        nl_before = false;
    }
}

impl Lexer {
    fn peek(&self) -> Option<char> { self.chars.get(self.pos).copied() }
    fn peek_at(&self, n: usize) -> Option<char> { self.chars.get(self.pos + n).copied() }

    /// The line just entered is empty (only whitespace up to the next newline).
    fn peek_blank_line(&self) -> bool {
        let mut i = self.pos;
        while let Some(c) = self.chars.get(i) {
            if *c == '\n' { return true; }
            if !c.is_whitespace() { return false; }
            i += 1;
        }
        false
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' { self.line += 1; self.col = 1; } else { self.col += 1; }
        Some(c)
    }

    fn err(&self, message: impl Into<String>) -> TemplateError {
        TemplateError::Syntax { line: self.line, col: self.col, message: message.into() }
    }

    fn next_tok(&mut self, c: char) -> Result<Tok, TemplateError> {
        if c == '_' && self.peek_at(1) == Some('|') && self.peek_at(2) == Some('_') {
            self.pos += 3;
            self.col += 3;
            return Ok(Tok::Bottom);
        }
        if c.is_ascii_alphabetic() || c == '_' || c == '#' || c == '$' {
            let mut s = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '_' || c == '#' || c == '$' { s.push(c); self.bump(); } else { break; }
            }
            return Ok(Tok::Ident(s));
        }
        if c.is_ascii_digit() { return self.number(); }
        if c == '"' { return self.string(); }
        self.bump();
        let two = |lx: &mut Self, next: char, yes: Tok, no: Tok| {
            if lx.peek() == Some(next) { lx.bump(); yes } else { no }
        };
        let tok = match c {
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            '[' => Tok::LBrack,
            ']' => Tok::RBrack,
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            ':' => Tok::Colon,
            ',' => Tok::Comma,
            '?' => Tok::Question,
            '*' => Tok::Star,
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '/' => Tok::Slash,
            '.' => {
                if self.peek() == Some('.') && self.peek_at(1) == Some('.') {
                    self.bump();
                    self.bump();
                    Tok::Ellipsis
                } else {
                    Tok::Dot
                }
            }
            '=' => {
                if self.peek() == Some('=') { self.bump(); Tok::EqEq } else { return Err(self.err("unexpected '='")); }
            }
            '!' => two(self, '=', Tok::NotEq, Tok::Bang),
            '<' => two(self, '=', Tok::Le, Tok::Lt),
            '>' => two(self, '=', Tok::Ge, Tok::Gt),
            '&' => {
                if self.peek() == Some('&') { self.bump(); Tok::AndAnd } else { return Err(self.err("unification '&' is not supported")); }
            }
            '|' => two(self, '|', Tok::OrOr, Tok::Pipe),
            other => return Err(self.err(format!("unexpected character {:?}", other))),
        };
        Ok(tok)
    }

    fn number(&mut self) -> Result<Tok, TemplateError> {
        let mut s = String::new();
        let mut float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                if c != '_' { s.push(c); }
                self.bump();
            } else if c == '.' && !float && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) {
                float = true;
                s.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E') && !s.is_empty() {
                float = true;
                s.push(c);
                self.bump();
                if let Some(sign @ ('+' | '-')) = self.peek() { s.push(sign); self.bump(); }
            } else {
                break;
            }
        }
        if float {
            s.parse::<f64>().map(Tok::Float).map_err(|_| self.err(format!("invalid number {}", s)))
        } else {
            s.parse::<i64>().map(Tok::Int).map_err(|_| self.err(format!("invalid integer {}", s)))
        }
    }

    fn string(&mut self) -> Result<Tok, TemplateError> {
        self.bump();
        let mut parts = Vec::new();
        let mut lit = String::new();
        loop {
            let Some(c) = self.bump() else { return Err(self.err("unterminated string")) };
            match c {
                '"' => break,
                '\n' => return Err(self.err("newline in string literal")),
                '\\' => {
                    let Some(e) = self.bump() else { return Err(self.err("unterminated escape")) };
                    match e {
                        'n' => lit.push('\n'),
                        't' => lit.push('\t'),
                        'r' => lit.push('\r'),
                        '"' => lit.push('"'),
                        '\\' => lit.push('\\'),
                        '/' => lit.push('/'),
                        'u' => {
                            let mut hex = String::new();
                            for _ in 0..4 {
                                match self.bump() { Some(h) => hex.push(h), None => return Err(self.err("short \\u escape")) }
                            }
                            let ch = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32)
                                .ok_or_else(|| self.err(format!("invalid \\u escape {}", hex)))?;
                            lit.push(ch);
                        }
                        '(' => {
                            if !lit.is_empty() { parts.push(RawPart::Lit(std::mem::take(&mut lit))); }
                            let (line, col) = (self.line, self.col);
                            let src = self.interpolation()?;
                            parts.push(RawPart::Interp { src, line, col });
                        }
                        other => return Err(self.err(format!("unknown escape \\{}", other))),
                    }
                }
                other => lit.push(other),
            }
        }
        if !lit.is_empty() || parts.is_empty() { parts.push(RawPart::Lit(lit)); }
        Ok(Tok::Str(parts))
    }

    /// Source text up to the `)` closing a `\(`.
    fn interpolation(&mut self) -> Result<String, TemplateError> {
        let mut depth = 0u32;
        let mut in_str = false;
        let mut src = String::new();
        loop {
            let Some(c) = self.bump() else { return Err(self.err("unterminated interpolation")) };
            if in_str {
                src.push(c);
                if c == '\\' {
                    if let Some(n) = self.bump() { src.push(n); }
                } else if c == '"' {
                    in_str = false;
                }
                continue;
            }
            match c {
                '"' => { in_str = true; src.push(c); }
                '(' => { depth += 1; src.push(c); }
                ')' if depth == 0 => return Ok(src),
                ')' => { depth -= 1; src.push(c); }
                '\n' => return Err(self.err("newline in interpolation")),
                other => src.push(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Tok> { tokenize(src).unwrap().into_iter().map(|t| t.tok).collect() }

    #[test]
    fn punctuation_and_bottom() {
        assert_eq!(
            kinds("a: *1 | int\nb?: [...string] != _|_"),
            vec![
                Tok::Ident("a".into()), Tok::Colon, Tok::Star, Tok::Int(1), Tok::Pipe, Tok::Ident("int".into()),
                Tok::Ident("b".into()), Tok::Question, Tok::Colon, Tok::LBrack, Tok::Ellipsis, Tok::Ident("string".into()),
                Tok::RBrack, Tok::NotEq, Tok::Bottom, Tok::Eof,
            ]
        );
    }

    #[test]
    fn newline_flags_and_doc_comments() {
        let toks = tokenize("// +usage=Which image\n// +short=i\nimage: string\n\n// detached\n\nport: 80").unwrap();
        assert_eq!(toks[0].tok, Tok::Ident("image".into()));
        assert_eq!(toks[0].doc, vec!["+usage=Which image".to_string(), "+short=i".to_string()]);
        assert!(!toks[1].nl_before);
        let port = toks.iter().find(|t| t.tok == Tok::Ident("port".into())).unwrap();
        assert!(port.nl_before);
        assert!(port.doc.is_empty());
        assert_eq!(port.line, 7);
    }

    #[test]
    fn strings_with_interpolation() {
        let toks = kinds(r#""img:\(parameter.tag)-\(f("x"))" "a\"b""#);
        match &toks[0] {
            Tok::Str(parts) => {
                assert_eq!(parts.len(), 4);
                assert_eq!(parts[0], RawPart::Lit("img:".into()));
                assert!(matches!(&parts[1], RawPart::Interp { src, .. } if src == "parameter.tag"));
                assert!(matches!(&parts[3], RawPart::Interp { src, .. } if src == "f(\"x\")"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(toks[1], Tok::Str(vec![RawPart::Lit("a\"b".into())]));
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("1_000 2.5 1e3"), vec![Tok::Int(1000), Tok::Float(2.5), Tok::Float(1000.0), Tok::Eof]);
        assert!(matches!(tokenize("\"open"), Err(TemplateError::Syntax { .. })));
    }
}
