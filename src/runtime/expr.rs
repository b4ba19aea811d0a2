//! Restricted expression interpreter
//!
//! Expressions appearing in `when` conditions, templates, and variable
//! addresses are deliberately small: dotted paths over exposed variables
//! (with numeric index segments), string/number/bool/null literals, and a
//! `len(expr)` builtin. Unresolvable variables evaluate to null rather than
//! erroring, so rule conditions can probe for absent state.

use async_trait::async_trait;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[$_A-Za-z][$\w]*$").unwrap());

/// Expression parse failures.
#[derive(Debug, Error)]
pub enum ExprError {
    /// The expression was empty after trimming
    #[error("empty expression")]
    Empty,

    /// The expression uses syntax outside the supported subset
    #[error("unsupported expression: {0}")]
    Unsupported(String),
}

/// One segment of a dotted path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object key or variable name
    Key(String),
    /// Array index
    Index(usize),
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// String, number, bool, or null literal
    Literal(Value),
    /// Dotted path; the first segment is always a variable name
    Path(Vec<PathSegment>),
    /// Length of an array, string, or object
    Len(Box<Expr>),
}

/// Name resolution for expressions. Implemented by the scope view during a
/// rule walk and by plain JSON objects in iteration merge keys.
#[async_trait]
pub trait ExprScope: Send + Sync {
    /// Look up a top-level variable. `None` evaluates to null.
    async fn get(&self, name: &str) -> Option<Value>;
}

/// An [`ExprScope`] over one JSON object.
pub struct JsonScope(pub Value);

#[async_trait]
impl ExprScope for JsonScope {
    async fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

impl Expr {
    /// Parse an expression from the supported subset.
    pub fn parse(input: &str) -> Result<Expr, ExprError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(ExprError::Empty);
        }

        if let Some(inner) = s.strip_prefix("len(").and_then(|r| r.strip_suffix(')')) {
            return Ok(Expr::Len(Box::new(Expr::parse(inner)?)));
        }

        if s.len() >= 2 {
            for quote in ['"', '\''] {
                if s.starts_with(quote) && s.ends_with(quote) {
                    return Ok(Expr::Literal(Value::String(s[1..s.len() - 1].to_string())));
                }
            }
        }

        match s {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        if s.starts_with(['-', '+']) || s.starts_with(|c: char| c.is_ascii_digit()) {
            if let Ok(int) = s.parse::<i64>() {
                return Ok(Expr::Literal(Value::from(int)));
            }
            if let Ok(float) = s.parse::<f64>() {
                if float.is_finite() {
                    return Ok(Expr::Literal(
                        serde_json::Number::from_f64(float)
                            .map(Value::Number)
                            .unwrap_or(Value::Null),
                    ));
                }
            }
            return Err(ExprError::Unsupported(s.to_string()));
        }

        let segments = parse_path(s)?;
        Ok(Expr::Path(segments))
    }

    /// Whether this expression is a plain dotted path (assignable).
    pub fn as_path(&self) -> Option<&[PathSegment]> {
        match self {
            Expr::Path(segments) => Some(segments),
            _ => None,
        }
    }

    /// Evaluate against a scope. Never fails: unresolved names and
    /// non-measurable `len` targets yield null.
    pub fn eval<'a>(&'a self, scope: &'a dyn ExprScope) -> BoxFuture<'a, Value> {
        Box::pin(async move {
            match self {
                Expr::Literal(value) => value.clone(),
                Expr::Path(segments) => {
                    let PathSegment::Key(name) = &segments[0] else {
                        return Value::Null;
                    };
                    let Some(root) = scope.get(name).await else {
                        return Value::Null;
                    };
                    json_get(&root, &segments[1..])
                        .cloned()
                        .unwrap_or(Value::Null)
                }
                Expr::Len(inner) => {
                    let value = inner.eval(scope).await;
                    let len = match &value {
                        Value::Array(items) => items.len(),
                        Value::String(text) => text.chars().count(),
                        Value::Object(map) => map.len(),
                        _ => return Value::Null,
                    };
                    Value::from(len)
                }
            }
        })
    }
}

/// Parse a dotted path. The leading segment must be an identifier; later
/// segments may be identifiers or numeric indexes.
pub fn parse_path(input: &str) -> Result<Vec<PathSegment>, ExprError> {
    let mut segments = Vec::new();
    for (i, part) in input.split('.').enumerate() {
        if let Ok(index) = part.parse::<usize>() {
            if i == 0 {
                return Err(ExprError::Unsupported(input.to_string()));
            }
            segments.push(PathSegment::Index(index));
        } else if IDENT_RE.is_match(part) {
            segments.push(PathSegment::Key(part.to_string()));
        } else {
            return Err(ExprError::Unsupported(input.to_string()));
        }
    }
    Ok(segments)
}

/// Navigate a path below a root value.
pub fn json_get<'a>(root: &'a Value, path: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in path {
        current = match segment {
            PathSegment::Key(key) => current.get(key)?,
            PathSegment::Index(index) => current.get(index)?,
        };
    }
    Some(current)
}

/// Assign below a root, creating intermediate objects for key segments and
/// null-padding arrays for index segments.
pub fn json_assign(root: &mut Value, path: &[PathSegment], value: Value) {
    let Some((last, prefix)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut current = root;
    for segment in prefix {
        current = match segment {
            PathSegment::Key(key) => {
                if !current.is_object() {
                    *current = Value::Object(serde_json::Map::new());
                }
                current
                    .as_object_mut()
                    .expect("just made an object")
                    .entry(key.clone())
                    .or_insert(Value::Null)
            }
            PathSegment::Index(index) => {
                if !current.is_array() {
                    *current = Value::Array(Vec::new());
                }
                let items = current.as_array_mut().expect("just made an array");
                if items.len() <= *index {
                    items.resize(*index + 1, Value::Null);
                }
                &mut items[*index]
            }
        };
    }
    match last {
        PathSegment::Key(key) => {
            if !current.is_object() {
                *current = Value::Object(serde_json::Map::new());
            }
            current
                .as_object_mut()
                .expect("just made an object")
                .insert(key.clone(), value);
        }
        PathSegment::Index(index) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let items = current.as_array_mut().expect("just made an array");
            if items.len() <= *index {
                items.resize(*index + 1, Value::Null);
            }
            items[*index] = value;
        }
    }
}

/// Delete the value at a path. Keys are removed from their parent object;
/// array elements are nulled in place to keep sibling indexes stable.
pub fn json_remove(root: &mut Value, path: &[PathSegment]) {
    let Some((last, prefix)) = path.split_last() else {
        return;
    };
    let mut current = root;
    for segment in prefix {
        let next = match segment {
            PathSegment::Key(key) => current.get_mut(key),
            PathSegment::Index(index) => current.get_mut(index),
        };
        match next {
            Some(value) => current = value,
            None => return,
        }
    }
    match last {
        PathSegment::Key(key) => {
            if let Some(map) = current.as_object_mut() {
                map.remove(key);
            }
        }
        PathSegment::Index(index) => {
            if let Some(slot) = current.get_mut(index) {
                *slot = Value::Null;
            }
        }
    }
}
