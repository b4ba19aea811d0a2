//! `llm`: language-model completion
//!
//! Thin adapter over the [`LanguageModel`] collaborator. Address parameters
//! express integer preferences (`llm:cost=0#quality=1`) passed through in
//! the options; provider selection and retries live behind the trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::runtime::continuation::Continuation;
use crate::runtime::directory::LanguageModel;
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};

pub struct ModelHandler {
    model: Arc<dyn LanguageModel>,
}

impl ModelHandler {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ProtocolHandler for ModelHandler {
    fn protocol(&self) -> &'static str {
        "llm"
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let Some(prompt) = call.step.prompt.as_deref().filter(|p| !p.is_empty()) else {
            // nothing to ask; pass the conversation through
            return Ok(Continuation::Immediate(call.request));
        };

        let mut options = call.request.options.clone();
        if let Some(params) = call.step.address.as_ref().and_then(|a| a.params()) {
            for part in params.split('#').filter(|p| !p.is_empty()) {
                let (key, raw) = part.split_once('=').ok_or_else(|| {
                    HandlerFailure::bad_request(format!("malformed llm parameter '{part}'"))
                })?;
                if !matches!(key, "cost" | "quality") {
                    return Err(HandlerFailure::bad_request(format!(
                        "unknown llm parameter '{key}'"
                    ))
                    .into());
                }
                let pref: i64 = raw.parse().map_err(|_| {
                    HandlerFailure::bad_request(format!("llm parameter '{key}' must be an integer"))
                })?;
                options.insert(key.to_string(), Value::from(pref));
            }
        }

        let reply = self.model.complete(prompt, &options).await?;
        Ok(Continuation::Immediate(reply))
    }
}
