//! Two-layer template rendering: an outer `<% if %>`/`<%= %>` control-block
//! layer, and an inner `{{name}}` slot-substitution layer, applied in that
//! order against a read-only variable scope.
//!
//! The renderer is pure and deterministic: it never writes back into the
//! scope it reads from, and slots within one template resolve independently
//! of each other's order of appearance.

use std::collections::HashMap;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Renders `template` against `scope`, first expanding control blocks, then
/// substituting slots in the result.
pub fn render(template: &str, scope: &HashMap<String, Value>, strict: bool) -> Result<String> {
    let stripped = strip_comments(template);
    let tokens = tokenize_control(&stripped)?;
    let mut pos = 0;
    let nodes = parse_sequence(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(EngineError::UnterminatedBlock);
    }
    let scope_value = scope_to_value(scope);
    let control_rendered = render_nodes(&nodes, &scope_value)?;
    render_slots(&control_rendered, &scope_value, strict)
}

fn scope_to_value(scope: &HashMap<String, Value>) -> Value {
    Value::Object(scope.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn strip_comments(template: &str) -> String {
    let re = Regex::new(r"(?s)\{#.*?#\}").expect("static comment pattern is valid");
    re.replace_all(template, "").into_owned()
}

// ---------------------------------------------------------------------------
// Control blocks
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Token {
    Text(String),
    Echo(String),
    If(String),
    ElseIf(String),
    Else,
    End,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Echo(Expr),
    If(Vec<(Expr, Vec<Node>)>, Option<Vec<Node>>),
}

fn tokenize_control(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = input;
    loop {
        match rest.find("<%") {
            None => {
                if !rest.is_empty() {
                    tokens.push(Token::Text(rest.to_string()));
                }
                break;
            }
            Some(start) => {
                if start > 0 {
                    tokens.push(Token::Text(rest[..start].to_string()));
                }
                let after_open = &rest[start + 2..];
                let end = after_open
                    .find("%>")
                    .ok_or(EngineError::UnterminatedBlock)?;
                let raw = &after_open[..end];
                tokens.push(classify_directive(raw)?);
                rest = &after_open[end + 2..];
            }
        }
    }
    Ok(tokens)
}

fn classify_directive(raw: &str) -> Result<Token> {
    if let Some(expr) = raw.strip_prefix('=') {
        return Ok(Token::Echo(expr.trim().to_string()));
    }
    let trimmed = raw.trim();
    if let Some(expr) = trimmed.strip_prefix("if ") {
        return Ok(Token::If(expr.trim().to_string()));
    }
    if let Some(expr) = trimmed.strip_prefix("elseif ") {
        return Ok(Token::ElseIf(expr.trim().to_string()));
    }
    if trimmed == "else" {
        return Ok(Token::Else);
    }
    if trimmed == "end" {
        return Ok(Token::End);
    }
    Err(EngineError::BadExpression(raw.to_string()))
}

fn parse_sequence(tokens: &[Token], pos: &mut usize) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Text(s) => {
                nodes.push(Node::Text(s.clone()));
                *pos += 1;
            }
            Token::Echo(e) => {
                nodes.push(Node::Echo(parse_expr(e)?));
                *pos += 1;
            }
            Token::If(_) => nodes.push(parse_if(tokens, pos)?),
            Token::ElseIf(_) | Token::Else | Token::End => break,
        }
    }
    Ok(nodes)
}

fn parse_if(tokens: &[Token], pos: &mut usize) -> Result<Node> {
    let first_cond = match &tokens[*pos] {
        Token::If(e) => parse_expr(e)?,
        _ => unreachable!("parse_if called on non-if token"),
    };
    *pos += 1;
    let mut branches = vec![(first_cond, parse_sequence(tokens, pos)?)];
    let mut else_body = None;
    loop {
        match tokens.get(*pos) {
            None => return Err(EngineError::UnterminatedBlock),
            Some(Token::ElseIf(e)) => {
                let cond = parse_expr(e)?;
                *pos += 1;
                branches.push((cond, parse_sequence(tokens, pos)?));
            }
            Some(Token::Else) => {
                *pos += 1;
                else_body = Some(parse_sequence(tokens, pos)?);
            }
            Some(Token::End) => {
                *pos += 1;
                break;
            }
            Some(_) => return Err(EngineError::UnterminatedBlock),
        }
    }
    Ok(Node::If(branches, else_body))
}

fn render_nodes(nodes: &[Node], scope: &Value) -> Result<String> {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(s) => out.push_str(s),
            Node::Echo(expr) => out.push_str(&value_to_display(&eval_expr(expr, scope)?)),
            Node::If(branches, else_body) => {
                let mut matched = false;
                for (cond, body) in branches {
                    if truthy(&eval_expr(cond, scope)?) {
                        out.push_str(&render_nodes(body, scope)?);
                        matched = true;
                        break;
                    }
                }
                if !matched {
                    if let Some(body) = else_body {
                        out.push_str(&render_nodes(body, scope)?);
                    }
                }
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Expression language: arithmetic, comparisons, booleans, path references and
// the named function library (len, number, empty, notempty, contains, starts,
// ends).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, Copy)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Path(String),
    Call(String, Vec<Expr>),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    Comma,
    LBracket,
    RBracket,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Gt,
    Ge,
    Lt,
    Le,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Not,
}

fn lex_expr(src: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut toks = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::EqEq);
                    i += 2;
                } else {
                    return Err(EngineError::BadExpression(src.to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::NotEq);
                    i += 2;
                } else {
                    toks.push(Tok::Not);
                    i += 1;
                }
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                toks.push(Tok::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                toks.push(Tok::OrOr);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(EngineError::BadExpression(src.to_string()));
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num = num_str
                    .parse::<f64>()
                    .map_err(|_| EngineError::BadExpression(src.to_string()))?;
                toks.push(Tok::Num(num));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            _ => return Err(EngineError::BadExpression(src.to_string())),
        }
    }
    Ok(toks)
}

struct ExprParser {
    toks: Vec<Tok>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<()> {
        if self.peek() == Some(tok) {
            self.pos += 1;
            Ok(())
        } else {
            Err(EngineError::BadExpression(format!("expected {:?}", tok)))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.pos += 1;
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_additive()?;
        let op = match self.peek() {
            Some(Tok::Gt) => Some(BinOp::Gt),
            Some(Tok::Ge) => Some(BinOp::Ge),
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Le) => Some(BinOp::Le),
            Some(Tok::EqEq) => Some(BinOp::Eq),
            Some(Tok::NotEq) => Some(BinOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_additive()?;
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Tok::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            Some(Tok::Not) => {
                self.pos += 1;
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::LParen) => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            Some(Tok::Ident(name)) => {
                if name == "true" {
                    return Ok(Expr::Bool(true));
                }
                if name == "false" {
                    return Ok(Expr::Bool(false));
                }
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        args.push(self.parse_expr()?);
                        while self.peek() == Some(&Tok::Comma) {
                            self.pos += 1;
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    return Ok(Expr::Call(name, args));
                }
                let path = self.parse_path_suffix(name)?;
                Ok(Expr::Path(path))
            }
            other => Err(EngineError::BadExpression(format!("unexpected token: {:?}", other))),
        }
    }

    /// Accumulates the raw source text of a path expression (`a.b[0].c`)
    /// starting from an already-consumed leading identifier.
    fn parse_path_suffix(&mut self, mut path: String) -> Result<String> {
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Tok::Ident(seg)) => {
                            path.push('.');
                            path.push_str(&seg);
                        }
                        other => {
                            return Err(EngineError::BadExpression(format!(
                                "expected identifier after '.', found {:?}",
                                other
                            )))
                        }
                    }
                }
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Tok::Num(n)) => {
                            path.push('[');
                            path.push_str(&(n as i64).to_string());
                            path.push(']');
                        }
                        other => {
                            return Err(EngineError::BadExpression(format!(
                                "expected index after '[', found {:?}",
                                other
                            )))
                        }
                    }
                    self.expect(&Tok::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(path)
    }
}

fn parse_expr(src: &str) -> Result<Expr> {
    let toks = lex_expr(src)?;
    let mut parser = ExprParser { toks, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.toks.len() {
        return Err(EngineError::BadExpression(src.to_string()));
    }
    Ok(expr)
}

fn eval_expr(expr: &Expr, scope: &Value) -> Result<Value> {
    Ok(match expr {
        Expr::Num(n) => serde_json::json!(n),
        Expr::Str(s) => Value::String(s.clone()),
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Path(p) => {
            let segments = parse_path(p)?;
            get_by_segments(scope, &segments).unwrap_or(Value::Null)
        }
        Expr::Call(name, args) => {
            let values: Vec<Value> = args
                .iter()
                .map(|a| eval_expr(a, scope))
                .collect::<Result<_>>()?;
            call_function(name, &values)?
        }
        Expr::Unary(UnOp::Neg, inner) => {
            let v = eval_expr(inner, scope)?;
            serde_json::json!(-to_number(&v).unwrap_or(0.0))
        }
        Expr::Unary(UnOp::Not, inner) => Value::Bool(!truthy(&eval_expr(inner, scope)?)),
        Expr::Binary(op, lhs, rhs) => {
            let l = eval_expr(lhs, scope)?;
            match op {
                BinOp::And => {
                    if !truthy(&l) {
                        Value::Bool(false)
                    } else {
                        Value::Bool(truthy(&eval_expr(rhs, scope)?))
                    }
                }
                BinOp::Or => {
                    if truthy(&l) {
                        Value::Bool(true)
                    } else {
                        Value::Bool(truthy(&eval_expr(rhs, scope)?))
                    }
                }
                _ => {
                    let r = eval_expr(rhs, scope)?;
                    eval_binary(*op, &l, &r)
                }
            }
        }
    })
}

fn eval_binary(op: BinOp, l: &Value, r: &Value) -> Value {
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
            let (a, b) = match (to_number(l), to_number(r)) {
                (Some(a), Some(b)) => (a, b),
                _ => return Value::Null,
            };
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Value::Null;
                    }
                    a / b
                }
                _ => unreachable!(),
            };
            serde_json::json!(result)
        }
        BinOp::Eq => Value::Bool(values_equal(l, r)),
        BinOp::Ne => Value::Bool(!values_equal(l, r)),
        BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
            match (to_number(l), to_number(r)) {
                (Some(a), Some(b)) => Value::Bool(match op {
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    _ => unreachable!(),
                }),
                _ => Value::Bool(false),
            }
        }
        BinOp::And | BinOp::Or => unreachable!("short-circuited above"),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (to_number(l), to_number(r)) {
        return a == b;
    }
    value_to_display(l) == value_to_display(r)
}

fn call_function(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "len" => Ok(serde_json::json!(value_len(args.first().unwrap_or(&Value::Null)))),
        "number" => Ok(to_number(args.first().unwrap_or(&Value::Null))
            .map(|n| serde_json::json!(n))
            .unwrap_or(Value::Null)),
        "empty" => Ok(Value::Bool(is_empty_value(args.first().unwrap_or(&Value::Null)))),
        "notempty" => Ok(Value::Bool(!is_empty_value(args.first().unwrap_or(&Value::Null)))),
        "contains" => {
            let haystack = args.first().unwrap_or(&Value::Null);
            let needle = args.get(1).unwrap_or(&Value::Null);
            Ok(Value::Bool(contains_value(haystack, needle)))
        }
        "starts" => Ok(Value::Bool(
            value_to_display(args.first().unwrap_or(&Value::Null))
                .starts_with(&value_to_display(args.get(1).unwrap_or(&Value::Null))),
        )),
        "ends" => Ok(Value::Bool(
            value_to_display(args.first().unwrap_or(&Value::Null))
                .ends_with(&value_to_display(args.get(1).unwrap_or(&Value::Null))),
        )),
        other => Err(EngineError::BadExpression(format!("unknown function: {other}"))),
    }
}

fn value_len(v: &Value) -> usize {
    match v {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::Null => 0,
        _ => value_to_display(v).chars().count(),
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn contains_value(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|v| values_equal(v, needle)),
        _ => value_to_display(haystack).contains(&value_to_display(needle)),
    }
}

/// Coerces a value to a number; failure is represented as `None`, never an
/// error — callers decide whether that means "false" or "null".
pub(crate) fn to_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn value_to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Path expressions (shared by slot substitution and `Expr::Path`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum PathSegment {
    Key(String),
    Index(usize),
}

pub(crate) fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for dot_part in path.split('.') {
        if dot_part.is_empty() {
            return Err(EngineError::BadTemplateKey(path.to_string()));
        }
        match dot_part.find('[') {
            None => {
                validate_identifier(dot_part)?;
                segments.push(PathSegment::Key(dot_part.to_string()));
            }
            Some(bracket_pos) => {
                let key = &dot_part[..bracket_pos];
                if !key.is_empty() {
                    validate_identifier(key)?;
                    segments.push(PathSegment::Key(key.to_string()));
                }
                let mut rest = &dot_part[bracket_pos..];
                while !rest.is_empty() {
                    let after_open = rest
                        .strip_prefix('[')
                        .ok_or_else(|| EngineError::BadTemplateKey(path.to_string()))?;
                    let close = after_open
                        .find(']')
                        .ok_or_else(|| EngineError::BadTemplateKey(path.to_string()))?;
                    let idx: usize = after_open[..close]
                        .parse()
                        .map_err(|_| EngineError::BadTemplateKey(path.to_string()))?;
                    segments.push(PathSegment::Index(idx));
                    rest = &after_open[close + 1..];
                }
            }
        }
    }
    Ok(segments)
}

/// Only letters (Unicode-inclusive, e.g. Han), digits, and underscore are
/// permitted in a path segment.
fn validate_identifier(s: &str) -> Result<()> {
    if !s.is_empty() && s.chars().all(|c| c == '_' || c.is_alphanumeric()) {
        Ok(())
    } else {
        Err(EngineError::BadTemplateKey(s.to_string()))
    }
}

fn get_by_segments(root: &Value, segments: &[PathSegment]) -> Option<Value> {
    let mut current = root.clone();
    for seg in segments {
        current = match (seg, &current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k)?.clone(),
            (PathSegment::Index(i), Value::Array(arr)) => arr.get(*i)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves `name` against `root`, trying it first as a literal flat
/// top-level key before falling back to nested-segment traversal.
///
/// A graph node's exported fields (spec.md §4.5 step 2) are published into
/// the render scope as the flat key `"node.field"`, which sits alongside
/// `node`'s own (differently shaped) environment entry under the same
/// prefix — nested traversal through `node` would hit that entry instead
/// and miss the export entirely, so the literal key has to win when present.
fn resolve_path(root: &Value, name: &str, segments: &[PathSegment]) -> Option<Value> {
    if let Value::Object(map) = root {
        if let Some(v) = map.get(name) {
            return Some(v.clone());
        }
    }
    get_by_segments(root, segments)
}

/// Resolves a key that is *exactly* one `{{path}}` or `{{path:default}}` slot
/// to its typed value (not its string rendering), so the condition evaluator
/// can distinguish a genuinely missing path from one that resolves to an
/// empty or falsy value. Keys that aren't a single bare slot (literals, or
/// text mixed with slots) return `None` here; the condition evaluator treats
/// those as literals that trivially "exist".
pub(crate) fn slot_value(key: &str, scope: &HashMap<String, Value>) -> Option<Value> {
    let trimmed = key.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    let name = inner.splitn(2, ':').next().unwrap_or("").trim();
    let segments = parse_path(name).ok()?;
    let scope_value = scope_to_value(scope);
    resolve_path(&scope_value, name, &segments)
}

// ---------------------------------------------------------------------------
// Slot substitution
// ---------------------------------------------------------------------------

fn render_slots(text: &str, scope: &Value, strict: bool) -> Result<String> {
    let re = Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("static slot pattern is valid");
    let mut failure: Option<EngineError> = None;
    let rendered = re
        .replace_all(text, |caps: &Captures| {
            match render_single_slot(&caps[0], &caps[1], scope, strict) {
                Ok(s) => s,
                Err(e) => {
                    failure = Some(e);
                    String::new()
                }
            }
        })
        .into_owned();
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(rendered)
}

fn render_single_slot(raw_match: &str, inner: &str, scope: &Value, strict: bool) -> Result<String> {
    let mut parts = inner.splitn(2, ':');
    let name = parts.next().unwrap_or("").trim();
    let default = parts.next();

    let segments = parse_path(name)?;
    let resolved = resolve_path(scope, name, &segments);
    if let Some(value) = resolved {
        if !value.is_null() {
            return Ok(value_to_display(&value));
        }
    }
    if let Some(default) = default {
        return Ok(default.to_string());
    }
    if strict {
        return Ok(String::new());
    }
    Ok(raw_match.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scope(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn renders_plain_slot() {
        let env = scope(&[("name", serde_json::json!("world"))]);
        assert_eq!(render("hello {{name}}", &env, false).unwrap(), "hello world");
    }

    #[test]
    fn falls_back_to_default_when_missing() {
        let env = scope(&[]);
        assert_eq!(render("hi {{name:stranger}}", &env, false).unwrap(), "hi stranger");
    }

    #[test]
    fn strict_missing_without_default_becomes_empty() {
        let env = scope(&[]);
        assert_eq!(render("[{{missing}}]", &env, true).unwrap(), "[]");
    }

    #[test]
    fn non_strict_missing_without_default_is_left_untouched() {
        let env = scope(&[]);
        assert_eq!(render("[{{missing}}]", &env, false).unwrap(), "[{{missing}}]");
    }

    #[test]
    fn strips_comments_before_rendering() {
        let env = scope(&[("name", serde_json::json!("A"))]);
        assert_eq!(render("{# a comment #}{{name}}", &env, false).unwrap(), "A");
    }

    #[test]
    fn resolves_dotted_path_into_nested_output() {
        let env = scope(&[("A", serde_json::json!({"output": "hi"}))]);
        assert_eq!(render("{{A.output}}", &env, false).unwrap(), "hi");
    }

    #[test]
    fn resolves_bracket_index_into_array() {
        let env = scope(&[("A", serde_json::json!({"output": ["x", "y"]}))]);
        assert_eq!(render("{{A.output[1]}}", &env, false).unwrap(), "y");
    }

    #[test]
    fn supports_unicode_identifiers() {
        let env = scope(&[("姓名", serde_json::json!("张三"))]);
        assert_eq!(render("{{姓名}}", &env, false).unwrap(), "张三");
    }

    #[test]
    fn control_block_selects_branch_then_substitutes_slots() {
        let env = scope(&[("x", serde_json::json!("5")), ("name", serde_json::json!("A"))]);
        let tmpl = "<% if number(x) > 3 %>big{{name}}<% else %>small<% end %>";
        assert_eq!(render(tmpl, &env, false).unwrap(), "bigA");

        let env2 = scope(&[("x", serde_json::json!("2")), ("name", serde_json::json!("A"))]);
        assert_eq!(render(tmpl, &env2, false).unwrap(), "small");
    }

    #[test]
    fn control_block_elseif_chain() {
        let env = scope(&[("x", serde_json::json!(2.0))]);
        let tmpl = "<% if x > 10 %>big<% elseif x > 1 %>mid<% else %>small<% end %>";
        assert_eq!(render(tmpl, &env, false).unwrap(), "mid");
    }

    #[test]
    fn echo_block_evaluates_expression() {
        let env = scope(&[("x", serde_json::json!(2)), ("y", serde_json::json!(3))]);
        assert_eq!(render("sum=<%= x + y %>", &env, false).unwrap(), "sum=5");
    }

    #[test]
    fn unterminated_block_is_an_error() {
        let env = scope(&[]);
        assert!(matches!(
            render("<% if true %>oops", &env, false),
            Err(EngineError::UnterminatedBlock)
        ));
    }

    #[test]
    fn invalid_identifier_is_a_bad_template_key() {
        let env = scope(&[]);
        assert!(matches!(
            render("{{bad-key}}", &env, false),
            Err(EngineError::BadTemplateKey(_))
        ));
    }

    #[test]
    fn rendering_is_idempotent_once_all_slots_are_bound() {
        let env = scope(&[("name", serde_json::json!("world"))]);
        let once = render("hello {{name}}", &env, false).unwrap();
        let twice = render(&once, &env, false).unwrap();
        assert_eq!(once, twice);
    }

    proptest! {
        // Once a slot's value is substituted in, re-rendering the already-
        // rendered string against the same scope must be a no-op: the bound
        // value itself carries no further `{{...}}` markers to expand.
        #[test]
        fn idempotent_for_any_single_bound_slot(
            name in "[a-zA-Z][a-zA-Z0-9_]{0,15}",
            value in "[a-zA-Z0-9 ]{0,20}",
            prefix in "[a-zA-Z0-9 ]{0,10}",
            suffix in "[a-zA-Z0-9 ]{0,10}",
        ) {
            let env = scope(&[(name.as_str(), Value::String(value.clone()))]);
            let tmpl = format!("{prefix}{{{{{name}}}}}{suffix}");

            let once = render(&tmpl, &env, false).unwrap();
            prop_assert_eq!(&once, &format!("{prefix}{value}{suffix}"));

            let twice = render(&once, &env, false).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
