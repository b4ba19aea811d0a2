//! `eval`: write the interpolated prompt into the envelope
//!
//! The default target of bare-string `when` conditions. `eval:data` parses
//! the prompt into the structured payload instead of the text.

use async_trait::async_trait;

use crate::runtime::continuation::Continuation;
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};
use crate::runtime::step::loose_json;

pub struct EvaluateHandler;

#[async_trait]
impl ProtocolHandler for EvaluateHandler {
    fn protocol(&self) -> &'static str {
        "eval"
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let prompt = call.step.prompt.clone().unwrap_or_default();
        let mut envelope = call.request;
        match call.step.address.as_ref().and_then(|a| a.params()) {
            None => {
                envelope.text = Some(prompt);
            }
            Some("data") => {
                envelope.data = Some(loose_json(&prompt)?);
            }
            Some(other) => {
                return Err(
                    HandlerFailure::bad_request(format!("unknown eval parameter '{other}'"))
                        .into(),
                );
            }
        }
        Ok(Continuation::Immediate(envelope))
    }
}
