//! `iterator`: run a rule list once per array element
//!
//! The prompt is an expression over the request's structured payload (never
//! interpolated) and must yield an array; the step's rules run per element
//! with the element as payload. Fail-fast: the first errored element becomes
//! the overall result and prior results are discarded. Address directives:
//! `flat` flattens one level, a marker template de-duplicates by rendered
//! key keeping the first occurrence.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::runtime::continuation::Continuation;
use crate::runtime::directory::ActorRecord;
use crate::runtime::engine::Engine;
use crate::runtime::envelope::Envelope;
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::expr::{Expr, JsonScope};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};
use crate::runtime::scope::TaskContext;
use crate::runtime::step::{request_data, ResponseRule};
use crate::runtime::template;

pub struct IterateHandler;

#[async_trait]
impl ProtocolHandler for IterateHandler {
    fn protocol(&self) -> &'static str {
        "iterator"
    }

    fn interpolates(&self) -> bool {
        false
    }

    fn consumes_rules(&self) -> bool {
        true
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let (flat, merge) = parse_params(call.step.address.as_ref().and_then(|a| a.params()));

        let payload = request_data(&call.request);
        let items = match call.step.prompt.as_deref().filter(|p| !p.is_empty()) {
            Some(source) => {
                let expr = Expr::parse(source)
                    .map_err(|err| HandlerFailure::bad_request(err.to_string()))?;
                expr.eval(&JsonScope(payload)).await
            }
            None => payload,
        };
        let Value::Array(items) = items else {
            return Err(HandlerFailure::bad_request("iterator expects an array").into());
        };

        let plan = Plan {
            engine: call.engine,
            caller: call.caller,
            rules: Arc::clone(&call.step.rules),
            items: Arc::new(items),
            base_options: call.request.options,
            ctx: call.ctx,
            root_search: call.root_search,
            flat,
            merge,
        };
        Ok(run_items(plan, 0, Vec::new()).await)
    }
}

fn parse_params(params: Option<&str>) -> (bool, Option<String>) {
    let mut flat = false;
    let mut merge = None;
    if let Some(params) = params {
        for part in params.split('#').filter(|p| !p.is_empty()) {
            if part == "flat" {
                flat = true;
            } else {
                merge = Some(part.to_string());
            }
        }
    }
    (flat, merge)
}

struct Plan {
    engine: Arc<Engine>,
    caller: ActorRecord,
    rules: Arc<Vec<ResponseRule>>,
    items: Arc<Vec<Value>>,
    base_options: Map<String, Value>,
    ctx: Arc<TaskContext>,
    root_search: bool,
    flat: bool,
    merge: Option<String>,
}

/// Walk the elements sequentially, chaining through `and_then` so a deferred
/// element keeps the whole iteration deferred with its interim.
fn run_items(plan: Plan, idx: usize, collected: Vec<Value>) -> BoxFuture<'static, Continuation> {
    Box::pin(async move {
        if idx >= plan.items.len() {
            return finalize(plan, collected).await;
        }

        let request = Envelope {
            data: Some(plan.items[idx].clone()),
            options: plan.base_options.clone(),
            ..Envelope::default()
        };
        let walked = plan
            .engine
            .run_rules(
                plan.caller.clone(),
                Arc::clone(&plan.rules),
                request,
                Arc::clone(&plan.ctx),
                plan.root_search,
            )
            .await;
        let cont = match walked {
            Ok(cont) => cont,
            Err(err) => {
                return Continuation::Immediate(Envelope::default().fail(
                    500,
                    err.to_string(),
                    None,
                ));
            }
        };
        cont.and_then(move |env| {
            Box::pin(async move {
                if env.is_error() {
                    // fail-fast: the element's error is the overall result
                    return Continuation::Immediate(env);
                }
                let mut collected = collected;
                collected.push(request_data(&env));
                run_items(plan, idx + 1, collected).await
            })
        })
        .await
    })
}

async fn finalize(plan: Plan, collected: Vec<Value>) -> Continuation {
    let mut results = if plan.flat {
        collected
            .into_iter()
            .flat_map(|value| match value {
                Value::Array(inner) => inner,
                other => vec![other],
            })
            .collect()
    } else {
        collected
    };

    if let Some(key_template) = &plan.merge {
        let mut seen = HashSet::new();
        let mut deduped = Vec::with_capacity(results.len());
        for value in results {
            let key = match template::render(key_template, &JsonScope(value.clone()), false).await
            {
                Ok(rendered) => rendered.as_str().map(str::to_string).unwrap_or_default(),
                Err(_) => String::new(),
            };
            if seen.insert(key) {
                deduped.push(value);
            }
        }
        results = deduped;
    }

    Continuation::Immediate(Envelope {
        data: Some(Value::Array(results)),
        options: plan.base_options,
        ..Envelope::default()
    })
}
