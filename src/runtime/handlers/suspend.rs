//! `pause`: the human-pause suspension protocol
//!
//! Three phases stitch two independent calls together. `pause:start` parks
//! the current walk on a session and hands back an interim "processing"
//! envelope. `pause:run` lets an external call mutate the captured envelope
//! of the innermost open session. `pause:end` resolves the parked walk with
//! the (possibly amended) envelope, then itself waits until that resumed
//! walk fully settles and returns the terminal value.
//!
//! Sessions are keyed by the caller's long-running chain root, so unrelated
//! actors' start/run/end triples can never complete each other. The end
//! phase's second rendezvous travels as a correlation token in the options
//! bag; whoever settles the resumed walk notifies it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::runtime::continuation::Continuation;
use crate::runtime::envelope::{STATUS_OK, STATUS_PENDING, STATUS_TERMINATED};
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};
use crate::runtime::session::FINISH_TOKEN_KEY;
use crate::runtime::step::{loose_json, PreparedStep, StepDescriptor};

pub struct SuspendHandler;

#[async_trait]
impl ProtocolHandler for SuspendHandler {
    fn protocol(&self) -> &'static str {
        "pause"
    }

    fn interpolates(&self) -> bool {
        false
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let phase = call
            .step
            .address
            .as_ref()
            .and_then(|a| a.params())
            .unwrap_or("");
        match phase {
            "start" => start(call).await,
            "run" => run(call).await,
            "end" => end(call).await,
            other => {
                Err(HandlerFailure::bad_request(format!("unknown pause phase '{other}'")).into())
            }
        }
    }
}

async fn start(call: HandlerCall) -> Result<Continuation> {
    let key = call.engine.long_running_root(&call.ctx)?;
    let sessions = call.engine.sessions();
    let request = call.request;

    let (_captured, resumed_rx) = sessions.open(key, request.clone());
    debug!(key, "suspended awaiting external input");

    let mut interim = request
        .clone()
        .fail(STATUS_PENDING, "waiting for external input", None);
    // nested suspension: a resumed walk pausing again reports its interim
    // to the end caller still waiting on the previous rendezvous
    sessions.notify_finish(&mut interim);

    let pending = Box::pin(async move {
        match resumed_rx.await {
            Ok(envelope) => envelope,
            Err(_) => request.fail(STATUS_TERMINATED, "suspension abandoned", None),
        }
    });
    Ok(Continuation::Deferred { pending, interim })
}

async fn run(call: HandlerCall) -> Result<Continuation> {
    let key = call.engine.long_running_root(&call.ctx)?;
    let captured = call
        .engine
        .sessions()
        .top_captured(key)
        .ok_or_else(|| HandlerFailure::not_allowed("no open suspension session"))?;

    let step = nested_step(&call.step)?;
    let target = captured.lock().clone();
    let cont = call
        .engine
        .process(
            call.caller.clone(),
            step,
            target,
            Arc::clone(&call.ctx),
            call.root_search,
        )
        .await?;
    let settled = cont.settle().await;
    if settled.status == STATUS_OK {
        *captured.lock() = settled.clone();
    }
    Ok(Continuation::Immediate(settled))
}

async fn end(call: HandlerCall) -> Result<Continuation> {
    let key = call.engine.long_running_root(&call.ctx)?;
    let sessions = call.engine.sessions();
    let session = sessions
        .close(key)
        .ok_or_else(|| HandlerFailure::not_found("no suspension session to end"))?;

    let mut resumed = session.captured.lock().clone();
    if let Some(data) = call.request.data {
        resumed.data = Some(data);
    }
    if let Some(text) = call.request.text {
        resumed.text = Some(text);
    }
    if call.request.status != STATUS_OK {
        resumed.status = call.request.status;
        resumed.message = call.request.message;
    }

    let (token, finished_rx) = sessions.register_finisher();
    resumed
        .options
        .insert(FINISH_TOKEN_KEY.into(), Value::String(token.to_string()));
    debug!(key, %token, "resuming suspended walk");

    session
        .resolve
        .send(resumed)
        .map_err(|_| HandlerFailure::internal("suspended walk is gone"))?;

    let settled = finished_rx
        .await
        .map_err(|_| HandlerFailure::internal("resumed walk dropped without settling"))?;
    Ok(Continuation::Immediate(settled))
}

/// The `run` prompt is a JSON step descriptor forwarded to the engine.
fn nested_step(step: &PreparedStep) -> Result<StepDescriptor> {
    let Some(prompt) = step.prompt.as_deref().filter(|p| !p.is_empty()) else {
        return Err(HandlerFailure::bad_request("pause:run requires a step descriptor").into());
    };
    let value = loose_json(prompt)?;
    serde_json::from_value(value).map_err(|err| {
        HandlerFailure::bad_request(format!("invalid step descriptor: {err}")).into()
    })
}
