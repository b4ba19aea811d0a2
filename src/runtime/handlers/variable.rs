//! `var`: read, write, and move scope variables
//!
//! Address grammar: `var[:dest.path][#move]`. The prompt is evaluated as an
//! expression against the exposed variables, never template-interpolated; a
//! structured prompt is taken as a literal value. With a destination path
//! the value is assigned into the scope; `#move` additionally clears a bare
//! dotted source path. Builtins (`me`, `req`, `id`) are read-only.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::runtime::continuation::Continuation;
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::expr::{json_assign, json_remove, parse_path, Expr, PathSegment};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};
use crate::runtime::scope::ScopeView;
use crate::runtime::step::loose_json;

// tolerates a prompt wrapped in a single interpolation marker
static WRAPPED_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<[<?](.*?)[?>]>$").unwrap());

pub struct VariableHandler;

#[async_trait]
impl ProtocolHandler for VariableHandler {
    fn protocol(&self) -> &'static str {
        "var"
    }

    fn interpolates(&self) -> bool {
        false
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let Some(raw_prompt) = call.step.prompt.as_deref().filter(|p| !p.is_empty()) else {
            return Err(HandlerFailure::bad_request("var requires a prompt expression").into());
        };

        let (dest, move_source) = parse_params(
            call.step.address.as_ref().and_then(|a| a.params()),
        )?;

        let view = call
            .engine
            .scope_view(&call.caller, &call.request, &call.ctx, call.root_search)?;

        // structured prompts are literal values, string prompts expressions
        let (value, source_path) = if call.step.is_json {
            (loose_json(raw_prompt)?, None)
        } else {
            let source = WRAPPED_PATH_RE
                .captures(raw_prompt.trim())
                .map(|caps| caps[1].to_string())
                .unwrap_or_else(|| raw_prompt.trim().to_string());
            let expr = Expr::parse(&source)
                .map_err(|err| HandlerFailure::bad_request(err.to_string()))?;
            let value = expr.eval(&view).await;
            let path = expr.as_path().map(<[PathSegment]>::to_vec);
            (value, path)
        };

        if move_source {
            let Some(path) = &source_path else {
                return Err(
                    HandlerFailure::bad_request("move requires a bare variable path").into(),
                );
            };
            clear_source(&view, path)?;
        }

        let mut envelope = call.request;
        match dest {
            Some(dest_path) => {
                write_dest(&view, &dest_path, value)?;
            }
            None => match value {
                Value::String(text) => {
                    envelope.text = Some(text);
                    envelope.data = None;
                }
                other => {
                    envelope.data = Some(other);
                    envelope.text = None;
                }
            },
        }
        Ok(Continuation::Immediate(envelope))
    }
}

/// Split `dest.path#move` into the destination path and the move flag.
fn parse_params(params: Option<&str>) -> Result<(Option<Vec<PathSegment>>, bool)> {
    let Some(params) = params else {
        return Ok((None, false));
    };
    let (dest_raw, directive) = match params.split_once('#') {
        Some((d, directive)) => (d, Some(directive)),
        None => (params, None),
    };
    match directive {
        None | Some("move") => {}
        Some(other) => {
            return Err(
                HandlerFailure::bad_request(format!("unknown var directive '{other}'")).into(),
            );
        }
    }
    let dest = if dest_raw.is_empty() {
        None
    } else {
        let path = parse_path(dest_raw)
            .map_err(|err| HandlerFailure::bad_request(err.to_string()))?;
        let Some(PathSegment::Key(root)) = path.first() else {
            return Err(HandlerFailure::bad_request("destination must start with a name").into());
        };
        if ScopeView::is_builtin(root) {
            return Err(
                HandlerFailure::bad_request(format!("'{root}' is read-only")).into(),
            );
        }
        Some(path)
    };
    Ok((dest, directive == Some("move")))
}

fn root_key<'a>(path: &'a [PathSegment]) -> Result<&'a str> {
    match path.first() {
        Some(PathSegment::Key(root)) => Ok(root),
        _ => Err(HandlerFailure::bad_request("path must start with a name").into()),
    }
}

/// Null a single-segment source in place; delete deeper sources from their
/// parent and write the mutated root back.
fn clear_source(view: &ScopeView, path: &[PathSegment]) -> Result<()> {
    let root = root_key(path)?;
    if ScopeView::is_builtin(root) {
        return Err(HandlerFailure::bad_request(format!("'{root}' is read-only")).into());
    }
    if path.len() == 1 {
        view.set(root, Value::Null);
        return Ok(());
    }
    let mut root_value = view.get_sync(root).unwrap_or(Value::Null);
    json_remove(&mut root_value, &path[1..]);
    view.set(root, root_value);
    Ok(())
}

fn write_dest(view: &ScopeView, path: &[PathSegment], value: Value) -> Result<()> {
    let root = root_key(path)?;
    if path.len() == 1 {
        view.set(root, value);
        return Ok(());
    }
    let mut root_value = view.get_sync(root).unwrap_or(Value::Null);
    json_assign(&mut root_value, &path[1..], value);
    view.set(root, root_value);
    Ok(())
}
