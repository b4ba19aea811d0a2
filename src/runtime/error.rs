//! Error types for the troupe runtime
//!
//! Two families of failure exist here. Expected conditions (a missing member,
//! a scope-name conflict, a bad prompt) travel as data on the [`Envelope`]
//! status/message fields and are produced from [`HandlerFailure`] at the
//! dispatch boundary. Configuration-time problems (duplicate protocol,
//! unparseable address, a tag-targeted break) are fatal and surface as
//! [`RuntimeError`] without touching the envelope.
//!
//! [`Envelope`]: super::envelope::Envelope

use thiserror::Error;

use super::scope::ScopeId;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Address parsing / protocol lookup errors
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    /// Scope store errors
    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    /// Rule engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Expected handler failure, converted to envelope data at dispatch
    #[error("Handler failure: {0}")]
    Handler(#[from] HandlerFailure),

    /// Serialization of envelopes / exposed variables failed
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Configuration errors (startup only)
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Address-specific errors. All of these are fatal: an address that cannot
/// even be parsed is a defect in the step descriptor, not a runtime condition.
#[derive(Debug, Error)]
pub enum AddressError {
    /// Address began with `:` so there is no protocol to look up
    #[error("malformed address '{0}': empty protocol")]
    EmptyProtocol(String),

    /// No handler registered under the protocol prefix
    #[error("no handler registered for protocol '{0}'")]
    UnknownProtocol(String),
}

/// Scope store errors
#[derive(Debug, Error)]
pub enum ScopeError {
    /// Scope id not present in the store
    #[error("no scope found: {0}")]
    NotFound(ScopeId),

    /// A long-running scope was required but none exists and creation was disallowed
    #[error("no long-running scope exists for actor '{0}'")]
    NoLongRunning(String),

    /// A parent already has a long-running child under a different name
    #[error("scope name conflict: existing '{existing}', requested '{requested}'")]
    NameConflict {
        /// Name of the child already linked to the parent
        existing: String,
        /// Name that was asked for
        requested: String,
    },

    /// Ephemeral scopes always hang off a persisted parent
    #[error("root scope must be long-running")]
    EphemeralRoot,

    /// The call has no scope bound to its task context
    #[error("no task context bound to the call")]
    NoBinding,
}

/// Convenience result alias for scope operations
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// `break` carried a tag name; bubbling to an ancestor tag is not implemented
    #[error("break to tag '{0}' is not implemented")]
    TaggedBreakUnsupported(String),
}

/// An expected handler failure: carries the status code that will land on the
/// envelope when the registry converts it at the dispatch boundary.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerFailure {
    /// Envelope status code (400/404/405/409/500/503...)
    pub code: i32,
    /// Human-readable message
    pub message: String,
}

impl HandlerFailure {
    /// 400: the step or its prompt is invalid
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: 400,
            message: message.into(),
        }
    }

    /// 404: a named collaborator (member, entry, session) does not exist
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: 404,
            message: message.into(),
        }
    }

    /// 405: the operation is not permitted in the current phase
    pub fn not_allowed(message: impl Into<String>) -> Self {
        Self {
            code: 405,
            message: message.into(),
        }
    }

    /// 409: conflicting state already exists
    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            code: 409,
            message: message.into(),
        }
    }

    /// 500: unexpected internal failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
        }
    }
}

impl From<ScopeError> for HandlerFailure {
    fn from(err: ScopeError) -> Self {
        let code = match &err {
            ScopeError::NotFound(_) | ScopeError::NoBinding => 404,
            ScopeError::NameConflict { .. } => 409,
            ScopeError::EphemeralRoot => 400,
            ScopeError::NoLongRunning(_) => 500,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
