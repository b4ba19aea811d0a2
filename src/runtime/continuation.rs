//! Two-speed step results
//!
//! Every dispatch yields a [`Continuation`]: either the final envelope
//! directly, or a deferred pair of (future final value, interim snapshot).
//! The interim half lets a caller answer "still processing" immediately
//! while the pending half keeps the rule walk alive in the background.

use futures::future::BoxFuture;

use super::envelope::Envelope;

/// The result of dispatching one step.
pub enum Continuation {
    /// The step finished synchronously with this envelope.
    Immediate(Envelope),
    /// The step is still running.
    Deferred {
        /// Resolves to the final envelope once the step settles.
        pending: BoxFuture<'static, Envelope>,
        /// Snapshot handed back to the caller right away.
        interim: Envelope,
    },
}

impl Continuation {
    /// The envelope visible right now: the final value when immediate, the
    /// interim snapshot when deferred.
    pub fn interim(&self) -> &Envelope {
        match self {
            Continuation::Immediate(env) => env,
            Continuation::Deferred { interim, .. } => interim,
        }
    }

    /// Whether the final value is still outstanding.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Continuation::Deferred { .. })
    }

    /// Await the final envelope, driving the pending half if necessary.
    pub async fn settle(self) -> Envelope {
        match self {
            Continuation::Immediate(env) => env,
            Continuation::Deferred { pending, .. } => pending.await,
        }
    }

    /// Chain a step onto this continuation. An immediate value runs `f` right
    /// away; a deferred one keeps its interim and re-attaches `f` behind the
    /// pending future, settling whatever `f` produces in turn.
    pub async fn and_then<F>(self, f: F) -> Continuation
    where
        F: FnOnce(Envelope) -> BoxFuture<'static, Continuation> + Send + 'static,
    {
        match self {
            Continuation::Immediate(env) => f(env).await,
            Continuation::Deferred { pending, interim } => Continuation::Deferred {
                pending: Box::pin(async move {
                    let settled = pending.await;
                    f(settled).await.settle().await
                }),
                interim,
            },
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Continuation::Immediate(env) => f.debug_tuple("Immediate").field(env).finish(),
            Continuation::Deferred { interim, .. } => f
                .debug_struct("Deferred")
                .field("interim", interim)
                .finish_non_exhaustive(),
        }
    }
}

impl From<Envelope> for Continuation {
    fn from(env: Envelope) -> Self {
        Continuation::Immediate(env)
    }
}
