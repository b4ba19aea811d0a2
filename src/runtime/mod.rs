//! The troupe runtime
//!
//! Wires the protocol registry, scope store, and collaborators into an
//! [`Engine`] and exposes the chat surface:
//!
//! - [`Runtime::chat`] invokes an entry on an actor and replies immediately,
//!   detaching a still-pending walk into a background task.
//! - [`Runtime::chat_settled`] awaits full settlement, for embedders that
//!   want the terminal envelope in one call.

pub mod continuation;
pub mod directory;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod expr;
pub mod handlers;
pub mod registry;
pub mod scope;
pub mod session;
pub mod step;
pub mod template;

use std::sync::Arc;

use tracing::warn;

use continuation::Continuation;
use directory::{ActorDirectory, ActorId, LanguageModel};
use engine::Engine;
use envelope::{Envelope, STATUS_PENDING};
use error::Result;
use handlers::{
    DelegateHandler, ErrorHandler, EvaluateHandler, IterateHandler, ModelHandler, SuspendHandler,
    VariableHandler,
};
use registry::{ProtocolHandler, ProtocolRegistry};
use scope::{ScopeStore, TaskContext};

/// The assembled runtime: one engine serving every actor of a directory.
pub struct Runtime {
    engine: Arc<Engine>,
}

impl Runtime {
    /// Build a runtime with the built-in protocol set.
    pub fn new(
        directory: Arc<dyn ActorDirectory>,
        model: Arc<dyn LanguageModel>,
    ) -> anyhow::Result<Self> {
        Self::with_handlers(directory, model, Vec::new())
    }

    /// Build a runtime with additional protocol handlers. Duplicate
    /// prefixes fail construction.
    pub fn with_handlers(
        directory: Arc<dyn ActorDirectory>,
        model: Arc<dyn LanguageModel>,
        extra: Vec<Arc<dyn ProtocolHandler>>,
    ) -> anyhow::Result<Self> {
        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(DelegateHandler))?;
        registry.register(Arc::new(ErrorHandler))?;
        registry.register(Arc::new(EvaluateHandler))?;
        registry.register(Arc::new(IterateHandler))?;
        registry.register(Arc::new(ModelHandler::new(model)))?;
        registry.register(Arc::new(SuspendHandler))?;
        registry.register(Arc::new(VariableHandler))?;
        for handler in extra {
            registry.register(handler)?;
        }
        let engine = Arc::new(Engine::new(registry, Arc::new(ScopeStore::new()), directory));
        Ok(Self { engine })
    }

    /// The engine, for handlers and tests that drive steps directly.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Invoke `entry` on an actor and reply as soon as possible.
    ///
    /// A walk that suspends (or otherwise defers) is detached into a
    /// background task; the caller receives the interim envelope marked
    /// still-processing. When the detached walk settles, any finish waiter
    /// correlated through the options bag is notified.
    pub async fn chat(
        &self,
        actor_id: &ActorId,
        entry: &str,
        request: Envelope,
        contextual: bool,
    ) -> Result<Envelope> {
        let cont = self.dispatch_chat(actor_id, entry, request, contextual).await?;
        match cont {
            Continuation::Immediate(mut envelope) => {
                self.engine.sessions().notify_finish(&mut envelope);
                Ok(envelope)
            }
            Continuation::Deferred { pending, interim } => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    let mut settled = pending.await;
                    if settled.is_error() && settled.status != STATUS_PENDING {
                        warn!(status = settled.status, "detached walk settled with an error");
                    }
                    engine.sessions().notify_finish(&mut settled);
                });
                Ok(interim.fail(STATUS_PENDING, "request is still processing", None))
            }
        }
    }

    /// Invoke `entry` on an actor and wait for the terminal envelope.
    pub async fn chat_settled(
        &self,
        actor_id: &ActorId,
        entry: &str,
        request: Envelope,
        contextual: bool,
    ) -> Result<Envelope> {
        let cont = self.dispatch_chat(actor_id, entry, request, contextual).await?;
        let mut settled = cont.settle().await;
        self.engine.sessions().notify_finish(&mut settled);
        Ok(settled)
    }

    async fn dispatch_chat(
        &self,
        actor_id: &ActorId,
        entry: &str,
        request: Envelope,
        contextual: bool,
    ) -> Result<Continuation> {
        let Some(actor) = self.engine.directory().find(actor_id).await else {
            return Ok(Continuation::Immediate(request.fail(
                404,
                format!("unknown actor '{actor_id}'"),
                None,
            )));
        };
        let ctx = TaskContext::new();
        self.engine
            .chat_entry(
                actor,
                contextual,
                request,
                entry.to_string(),
                ctx,
                false,
            )
            .await
    }
}
