//! Parameter substitution: `${TASK_ID.PATH}` tokens inside a params tree are
//! replaced with values from completed dependency results at dispatch time.
//!
//! A string leaf that is exactly one token is replaced by the raw referenced
//! value, preserving its type. A string with surrounding text gets each token
//! stringified (compact JSON for mappings/sequences, lexical form for
//! scalars) and spliced in.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use crate::error::{ErrorCode, TaskError};

/// One step into a result tree: a mapping key or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(k) => write!(f, ".{k}"),
            Self::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// A parsed `${...}` token: the referenced task plus the path into its result.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub task: String,
    pub path: Vec<PathSegment>,
}

impl Token {
    fn path_display(&self) -> String {
        self.path.iter().map(|s| s.to_string()).collect()
    }
}

/// Errors raised while scanning or resolving substitution tokens.
#[derive(Debug, Error)]
pub enum SubstitutionError {
    #[error("malformed substitution token {token:?}: {reason}")]
    MalformedToken { token: String, reason: String },

    #[error("task {task:?} is not in the dependency closure of {referrer:?}")]
    UnresolvedReference { referrer: String, task: String },

    #[error("path {path:?} not found in result of {task:?}; available keys: [{}]", available.join(", "))]
    FieldNotFound {
        task: String,
        path: String,
        available: Vec<String>,
    },
}

impl SubstitutionError {
    /// The wire code this failure surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MalformedToken { .. } => ErrorCode::InvalidParams,
            Self::UnresolvedReference { .. } => ErrorCode::UnresolvedReference,
            Self::FieldNotFound { .. } => ErrorCode::FieldNotFound,
        }
    }

    pub fn into_task_error(self) -> TaskError {
        TaskError::new(self.code(), self.to_string())
    }
}

/// Dependency results visible to one task during substitution.
pub struct SubstitutionContext<'a> {
    /// The local id of the task whose params are being resolved.
    pub referrer: &'a str,
    /// Local ids in the referrer's transitive dependency closure.
    pub in_scope: &'a HashSet<String>,
    /// Result value per completed dependency, keyed by local id.
    pub results: &'a HashMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Token scanning
// ---------------------------------------------------------------------------

enum Piece<'a> {
    Literal(&'a str),
    Token(Token),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Parse the inside of a `${...}` token: a task id followed by an optional
/// dot-and-bracket path.
fn parse_token(raw: &str) -> Result<Token, String> {
    let mut chars = raw.char_indices().peekable();

    let mut task_end = 0;
    while let Some(&(i, c)) = chars.peek() {
        if is_ident_char(c) {
            task_end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }
    if task_end == 0 {
        return Err("expected a task id".to_owned());
    }
    let task = raw[..task_end].to_owned();

    let mut path = Vec::new();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            '.' => {
                chars.next();
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, c2)) = chars.peek() {
                    if is_ident_char(c2) {
                        end = j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if end == start {
                    return Err(format!("empty path segment at byte {i}"));
                }
                path.push(PathSegment::Key(raw[start..end].to_owned()));
            }
            '[' => {
                chars.next();
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, c2)) = chars.peek() {
                    if c2.is_ascii_digit() {
                        end = j + c2.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                if end == start {
                    return Err(format!("expected an index after '[' at byte {i}"));
                }
                match chars.next() {
                    Some((_, ']')) => {}
                    _ => return Err(format!("unterminated index bracket at byte {i}")),
                }
                let idx: usize = raw[start..end]
                    .parse()
                    .map_err(|_| format!("index out of range at byte {i}"))?;
                path.push(PathSegment::Index(idx));
            }
            _ => return Err(format!("unexpected character {c:?} at byte {i}")),
        }
    }

    Ok(Token { task, path })
}

/// Split a string leaf into literal and token pieces.
fn scan(s: &str) -> Result<Vec<Piece<'_>>, SubstitutionError> {
    let mut pieces = Vec::new();
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            return Err(SubstitutionError::MalformedToken {
                token: rest[start..].to_owned(),
                reason: "unterminated token".to_owned(),
            });
        };
        if start > 0 {
            pieces.push(Piece::Literal(&rest[..start]));
        }
        let raw = &rest[start + 2..start + end];
        let token = parse_token(raw).map_err(|reason| SubstitutionError::MalformedToken {
            token: format!("${{{raw}}}"),
            reason,
        })?;
        pieces.push(Piece::Token(token));
        rest = &rest[start + end + 1..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Literal(rest));
    }
    Ok(pieces)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

fn lookup<'v>(
    token: &Token,
    root: &'v Value,
) -> Result<&'v Value, SubstitutionError> {
    let mut current = root;
    for (i, seg) in token.path.iter().enumerate() {
        let next = match (seg, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k.as_str()),
            (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => {
                let available = match current {
                    Value::Object(map) => map.keys().cloned().collect(),
                    _ => vec![],
                };
                let failed_path: String = token.path[..=i]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
                return Err(SubstitutionError::FieldNotFound {
                    task: token.task.clone(),
                    path: failed_path,
                    available,
                });
            }
        }
    }
    Ok(current)
}

fn token_value<'v>(
    token: &Token,
    ctx: &'v SubstitutionContext<'_>,
) -> Result<&'v Value, SubstitutionError> {
    if !ctx.in_scope.contains(&token.task) {
        return Err(SubstitutionError::UnresolvedReference {
            referrer: ctx.referrer.to_owned(),
            task: token.task.clone(),
        });
    }
    let root = ctx.results.get(&token.task).ok_or_else(|| {
        // In scope but not completed -- the engine only dispatches ready
        // tasks, so this indicates a missing result record.
        SubstitutionError::UnresolvedReference {
            referrer: ctx.referrer.to_owned(),
            task: token.task.clone(),
        }
    })?;
    lookup(token, root)
}

/// Canonical string form used when a token is spliced into surrounding text.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_owned(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn resolve_string(s: &str, ctx: &SubstitutionContext<'_>) -> Result<Value, SubstitutionError> {
    let pieces = scan(s)?;

    // Exactly one token with no surrounding text: raw value, type preserved.
    if let [Piece::Token(token)] = pieces.as_slice() {
        return Ok(token_value(token, ctx)?.clone());
    }

    if pieces.iter().all(|p| matches!(p, Piece::Literal(_))) {
        return Ok(Value::String(s.to_owned()));
    }

    let mut out = String::with_capacity(s.len());
    for piece in &pieces {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Token(token) => out.push_str(&stringify(token_value(token, ctx)?)),
        }
    }
    Ok(Value::String(out))
}

/// Resolve every token in `params`, returning the substituted tree.
pub fn resolve_params(
    params: &Value,
    ctx: &SubstitutionContext<'_>,
) -> Result<Value, SubstitutionError> {
    match params {
        Value::String(s) => resolve_string(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_params(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_params(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Syntax-check every token in `params` without resolving references.
/// Used at ingestion, where dependency results do not exist yet.
pub fn validate_tokens(params: &Value) -> Result<(), SubstitutionError> {
    match params {
        Value::String(s) => {
            scan(s)?;
            Ok(())
        }
        Value::Array(items) => items.iter().try_for_each(validate_tokens),
        Value::Object(map) => map.values().try_for_each(validate_tokens),
        _ => Ok(()),
    }
}

/// Collect the task ids referenced by tokens in `params`.
pub fn referenced_tasks(params: &Value) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                if let Ok(pieces) = scan(s) {
                    for piece in pieces {
                        if let Piece::Token(token) = piece {
                            if !out.contains(&token.task) {
                                out.push(token.task);
                            }
                        }
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(params, &mut out);
    out
}
