//! `error`: declaratively fail the conversation from a rule tree
//!
//! `error:404` with a prompt marks the envelope failed with that code and
//! the interpolated prompt as the message. First failure wins: an envelope
//! that already carries a status or message keeps it, so a rule tree can
//! attach a fallback error without clobbering an earlier, more specific one.

use async_trait::async_trait;

use crate::runtime::continuation::Continuation;
use crate::runtime::envelope::STATUS_OK;
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};

pub struct ErrorHandler;

#[async_trait]
impl ProtocolHandler for ErrorHandler {
    fn protocol(&self) -> &'static str {
        "error"
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let code = match call.step.address.as_ref().and_then(|a| a.params()) {
            None => 500,
            Some(raw) => raw.parse::<i32>().map_err(|_| {
                HandlerFailure::bad_request(format!("error code '{raw}' must be an integer"))
            })?,
        };

        let mut envelope = call.request;
        if envelope.status == STATUS_OK {
            envelope.status = code;
        }
        if envelope.message.is_none() {
            if let Some(prompt) = call.step.prompt.clone().filter(|p| !p.is_empty()) {
                envelope.message = Some(prompt);
            }
        }
        Ok(Continuation::Immediate(envelope))
    }
}
