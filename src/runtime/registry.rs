//! Protocol handler registry
//!
//! Step addresses dispatch on their protocol prefix (everything before the
//! first `:`). Delegation addresses dispatch under the fixed single-character
//! protocol `@`. The registry is assembled once at startup; registering the
//! same prefix twice is a configuration defect and fails construction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::continuation::Continuation;
use super::directory::ActorRecord;
use super::engine::Engine;
use super::envelope::Envelope;
use super::error::Result;
use super::scope::TaskContext;
use super::step::PreparedStep;

/// Everything a handler receives for one dispatch.
pub struct HandlerCall {
    /// The engine, for handlers that recurse (delegation, iteration, resume).
    pub engine: Arc<Engine>,
    /// Actor on whose behalf the step runs.
    pub caller: ActorRecord,
    /// The prepared step, prompt already interpolated unless the handler
    /// opted out.
    pub step: PreparedStep,
    /// Incoming envelope.
    pub request: Envelope,
    /// Per-call scope state.
    pub ctx: Arc<TaskContext>,
    /// Whether variable reads and writes search from the chain root.
    pub root_search: bool,
}

/// A protocol implementation.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Prefix this handler is registered under.
    fn protocol(&self) -> &'static str;

    /// Whether the engine interpolates the prompt before invoking. Handlers
    /// that treat the prompt as an expression or path opt out.
    fn interpolates(&self) -> bool {
        true
    }

    /// Whether the handler runs the step's rules itself, in which case the
    /// engine skips its own walk.
    fn consumes_rules(&self) -> bool {
        false
    }

    /// Execute the step.
    async fn invoke(&self, call: HandlerCall) -> Result<Continuation>;
}

/// Prefix → handler table.
#[derive(Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its protocol prefix.
    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) -> anyhow::Result<()> {
        let key = handler.protocol().to_string();
        if self.handlers.contains_key(&key) {
            anyhow::bail!("protocol '{key}' is already registered");
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    /// Look up the handler for a protocol key.
    pub fn get(&self, key: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(&'static str);

    #[async_trait]
    impl ProtocolHandler for Probe {
        fn protocol(&self) -> &'static str {
            self.0
        }

        async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
            Ok(Continuation::Immediate(call.request))
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(Probe("llm"))).unwrap();
        assert!(registry.register(Arc::new(Probe("llm"))).is_err());
        assert!(registry.get("llm").is_some());
        assert!(registry.get("var").is_none());
    }
}
