//! troupe: a prompt execution runtime for hierarchical agents
//!
//! Actors expose named entries backed by declarative step descriptors. A
//! step addresses a protocol (`llm`, `var`, `eval`, `error`, `iterator`,
//! `pause`) or
//! delegates to member actors (`@writer#review`), carries an interpolated
//! prompt, and an ordered rule list the engine walks against the response.
//! Conversations can defer (a handler answers "still processing" and keeps
//! working) and suspend (a human amends a paused conversation before it
//! resumes); the rule walk resumes at its exact cursor in both cases.
//! Variables live in namespaced, chained scopes that outlive individual
//! calls when an actor runs contextually.

pub mod runtime;

pub use runtime::continuation::Continuation;
pub use runtime::directory::{
    ActorDirectory, ActorId, ActorRecord, EntryHandle, FixtureModel, HostDefinition,
    InMemoryDirectory, LanguageModel, MemberDecl,
};
pub use runtime::envelope::{Envelope, STATUS_OK, STATUS_PENDING, STATUS_TERMINATED};
pub use runtime::error::{HandlerFailure, Result, RuntimeError};
pub use runtime::registry::{HandlerCall, ProtocolHandler};
pub use runtime::step::{ResponseRule, StepDescriptor};
pub use runtime::Runtime;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
