//! The rule engine
//!
//! `process` is one step's full life: interpolate the prompt, dispatch the
//! address through the registry, then walk the step's rules against the
//! result. The walk is cursor-exact under deferral: whenever a `when`,
//! `then`, or `else` dispatch comes back pending, the remainder of the walk
//! is re-attached behind that future at the current index and the caller
//! receives the interim envelope immediately. The walk never restarts.

use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, error};

use super::continuation::Continuation;
use super::directory::{default_entries, ActorDirectory, ActorRecord};
use super::envelope::{Envelope, STATUS_OK};
use super::error::{AddressError, EngineError, HandlerFailure, Result, RuntimeError, ScopeError};
use super::registry::{HandlerCall, ProtocolRegistry};
use super::scope::{ModeGuard, ScopeBinding, ScopeId, ScopeStore, ScopeView, TaskContext};
use super::session::SessionTable;
use super::step::{request_data, BreakDirective, PreparedStep, ResponseRule, RuleCondition, StepDescriptor};
use super::template;

static OK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(ok|yes|true)\b").unwrap());
static ERROR_HANDLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\berrorhandle\b").unwrap());

/// Rule walk and dispatch core. One engine serves all actors.
pub struct Engine {
    registry: ProtocolRegistry,
    scopes: Arc<ScopeStore>,
    directory: Arc<dyn ActorDirectory>,
    sessions: SessionTable,
}

impl Engine {
    pub fn new(
        registry: ProtocolRegistry,
        scopes: Arc<ScopeStore>,
        directory: Arc<dyn ActorDirectory>,
    ) -> Self {
        Self {
            registry,
            scopes,
            directory,
            sessions: SessionTable::new(),
        }
    }

    pub fn scopes(&self) -> &Arc<ScopeStore> {
        &self.scopes
    }

    pub fn directory(&self) -> &Arc<dyn ActorDirectory> {
        &self.directory
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Run one step for `caller`: dispatch its address, then walk its rules.
    pub fn process(
        self: &Arc<Self>,
        caller: ActorRecord,
        step: StepDescriptor,
        request: Envelope,
        ctx: Arc<TaskContext>,
        root_search: bool,
    ) -> BoxFuture<'static, Result<Continuation>> {
        let engine = Arc::clone(self);
        Box::pin(async move {
            let prepared = PreparedStep::prepare(&step)?;
            let base_options = request.options.clone();
            let rules = Arc::clone(&prepared.rules);
            let (cont, consumed) = engine
                .dispatch(&caller, prepared, request, &ctx, root_search)
                .await?;
            if consumed || rules.is_empty() {
                return Ok(merge_options(cont, base_options));
            }
            engine
                .walk(caller, rules, base_options, 0, cont, ctx, root_search)
                .await
        })
    }

    /// Run a rule list against an envelope, outside any address dispatch.
    /// Used by handlers that consume the rules themselves.
    pub fn run_rules(
        self: &Arc<Self>,
        caller: ActorRecord,
        rules: Arc<Vec<ResponseRule>>,
        response: Envelope,
        ctx: Arc<TaskContext>,
        root_search: bool,
    ) -> BoxFuture<'static, Result<Continuation>> {
        let base_options = response.options.clone();
        self.walk(
            caller,
            rules,
            base_options,
            0,
            Continuation::Immediate(response),
            ctx,
            root_search,
        )
    }

    /// Invoke a named entry on an actor.
    ///
    /// The entry's step runs in the mode the entry demands (falling back to
    /// the caller-supplied `contextual` flag), and the previous scope binding
    /// is restored once the continuation fully settles.
    pub fn chat_entry(
        self: &Arc<Self>,
        actor: ActorRecord,
        contextual: bool,
        request: Envelope,
        entry: String,
        ctx: Arc<TaskContext>,
        root_search: bool,
    ) -> BoxFuture<'static, Result<Continuation>> {
        let engine = Arc::clone(self);
        Box::pin(async move {
            let mut entries = Vec::new();
            if let Some(host_id) = &actor.host {
                if let Some(host) = engine.directory.host(host_id).await {
                    entries = host.entries;
                }
            }
            let found = entries
                .iter()
                .find(|candidate| candidate.name == entry)
                .cloned()
                .or_else(|| default_entries().into_iter().find(|d| d.name == entry));
            let Some(found) = found else {
                return Ok(Continuation::Immediate(request.fail(
                    404,
                    format!("entry '{entry}' not found on '{}'", actor.id),
                    None,
                )));
            };
            let Some(step) = found.handle else {
                return Ok(Continuation::Immediate(request));
            };

            let mode = found.contextual.unwrap_or(contextual);
            let guard = engine.switch_mode(&ctx, &actor, mode, true).await?;
            debug!(actor = %actor.id, entry, contextual = mode, "entering chat entry");
            let cont = engine
                .process(actor, step, request, Arc::clone(&ctx), root_search)
                .await?;
            Ok(match cont {
                Continuation::Immediate(env) => {
                    drop(guard);
                    Continuation::Immediate(env)
                }
                Continuation::Deferred { pending, interim } => Continuation::Deferred {
                    // the binding stays switched until the walk settles
                    pending: Box::pin(async move {
                        let env = pending.await;
                        drop(guard);
                        env
                    }),
                    interim,
                },
            })
        })
    }

    /// Switch the call's scope mode, returning a guard that restores the
    /// previous binding and stash when dropped.
    ///
    /// Switching to long-running binds the actor's persisted scope, creating
    /// (and durably recording) one when allowed; the displaced ephemeral
    /// binding is stashed. Switching to ephemeral restores the stashed
    /// binding if one exists, otherwise opens a fresh ephemeral scope under
    /// the nearest persisted parent.
    pub async fn switch_mode(
        &self,
        ctx: &Arc<TaskContext>,
        actor: &ActorRecord,
        long_running: bool,
        create: bool,
    ) -> Result<ModeGuard> {
        let guard = ModeGuard::capture(ctx);
        let current = ctx.binding();

        if long_running {
            if current.as_ref().is_some_and(ScopeBinding::is_long_running) {
                return Ok(guard);
            }
            let target = match actor.ctx_id.and_then(|id| self.scopes.bind(id).ok()) {
                Some(binding) => binding,
                None if create => {
                    let parent = current.as_ref().and_then(|b| b.data.parent);
                    let binding = self.scopes.create_child(parent, true, Some(&actor.name))?;
                    self.directory
                        .persist_ctx_id(&actor.id, Some(binding.data.id))
                        .await?;
                    binding
                }
                None => {
                    return Err(ScopeError::NoLongRunning(actor.id.to_string()).into());
                }
            };
            ctx.replace_stash(current);
            ctx.replace_binding(Some(target));
        } else {
            match &current {
                Some(binding) if !binding.is_long_running() => {}
                _ => {
                    let binding = ctx.replace_stash(None).unwrap_or_else(|| {
                        let parent = current
                            .as_ref()
                            .map(|b| b.data.id)
                            .or(actor.ctx_id);
                        ScopeBinding::ephemeral(parent)
                    });
                    ctx.replace_binding(Some(binding));
                }
            }
        }
        Ok(guard)
    }

    /// The exposed-variable view for one dispatch: builtins `me` and `req`
    /// over the caller's namespace in the bound scope chain.
    pub fn scope_view(
        &self,
        caller: &ActorRecord,
        request: &Envelope,
        ctx: &Arc<TaskContext>,
        root_search: bool,
    ) -> Result<ScopeView> {
        let binding = ctx.binding().ok_or(ScopeError::NoBinding)?;
        let mut extras = Map::new();
        extras.insert("me".into(), serde_json::to_value(caller)?);
        extras.insert("req".into(), request_data(request));
        Ok(ScopeView::new(
            Arc::clone(&self.scopes),
            binding,
            caller.id.0.clone(),
            root_search,
            extras,
        ))
    }

    /// The chain root the current call's binding belongs to. Suspension
    /// sessions are keyed by this.
    pub fn long_running_root(&self, ctx: &Arc<TaskContext>) -> Result<ScopeId> {
        let binding = ctx
            .binding()
            .ok_or_else(|| HandlerFailure::bad_request("no scope bound to the call"))?;
        self.scopes.root_of(&binding).map_err(|_| {
            HandlerFailure::bad_request("suspension requires a long-running scope").into()
        })
    }

    /// Interpolate (unless the handler opts out) and invoke the address's
    /// handler. Expected failures land on the envelope here; only
    /// configuration defects propagate as errors. The second element reports
    /// whether the handler consumed the step's rules.
    async fn dispatch(
        self: &Arc<Self>,
        caller: &ActorRecord,
        mut prepared: PreparedStep,
        request: Envelope,
        ctx: &Arc<TaskContext>,
        root_search: bool,
    ) -> Result<(Continuation, bool)> {
        let Some(address) = prepared.address.clone() else {
            return Ok((Continuation::Immediate(request), false));
        };
        let key = address.protocol_key();
        let handler = self
            .registry
            .get(key)
            .ok_or_else(|| AddressError::UnknownProtocol(key.to_string()))?;

        if handler.interpolates() {
            if let Some(prompt) = prepared.prompt.as_deref() {
                if template::has_markers(prompt) {
                    let view = self.scope_view(caller, &request, ctx, root_search)?;
                    match template::render(prompt, &view, prepared.is_json).await {
                        Ok(Value::String(text)) => prepared.prompt = Some(text),
                        Ok(raw) => prepared.prompt = Some(raw.to_string()),
                        Err(err) => {
                            let label = prepared.address_label().to_string();
                            return Ok((
                                Continuation::Immediate(request.fail(
                                    400,
                                    err.to_string(),
                                    Some(&label),
                                )),
                                false,
                            ));
                        }
                    }
                }
            }
        }

        let consumed = handler.consumes_rules();
        let label = prepared.address_label().to_string();
        let fallback = request.clone();
        let call = HandlerCall {
            engine: Arc::clone(self),
            caller: caller.clone(),
            step: prepared,
            request,
            ctx: Arc::clone(ctx),
            root_search,
        };
        match handler.invoke(call).await {
            Ok(cont) => Ok((cont, consumed)),
            Err(RuntimeError::Handler(failure)) => {
                debug!(address = %label, code = failure.code, "handler failure");
                Ok((
                    Continuation::Immediate(fallback.fail(
                        failure.code,
                        failure.message,
                        Some(&label),
                    )),
                    consumed,
                ))
            }
            Err(RuntimeError::Scope(scope_err)) => {
                let failure = HandlerFailure::from(scope_err);
                Ok((
                    Continuation::Immediate(fallback.fail(
                        failure.code,
                        failure.message,
                        Some(&label),
                    )),
                    consumed,
                ))
            }
            Err(fatal) => Err(fatal),
        }
    }

    /// Walk a rule list from `idx` against the continuation's value.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        self: &Arc<Self>,
        caller: ActorRecord,
        rules: Arc<Vec<ResponseRule>>,
        base_options: Map<String, Value>,
        idx: usize,
        cont: Continuation,
        ctx: Arc<TaskContext>,
        root_search: bool,
    ) -> BoxFuture<'static, Result<Continuation>> {
        let engine = Arc::clone(self);
        Box::pin(async move {
            let mut response = match cont {
                Continuation::Immediate(env) => env,
                Continuation::Deferred { pending, mut interim } => {
                    interim.merge_options_from(&base_options);
                    // re-attach the rest of the walk at this exact index
                    let resume = {
                        let engine = Arc::clone(&engine);
                        let ctx = Arc::clone(&ctx);
                        Box::pin(async move {
                            let settled = pending.await;
                            let walked = engine
                                .walk(
                                    caller,
                                    rules,
                                    base_options,
                                    idx,
                                    Continuation::Immediate(settled),
                                    ctx,
                                    root_search,
                                )
                                .await;
                            settle_or_report(walked).await
                        })
                    };
                    return Ok(Continuation::Deferred {
                        pending: resume,
                        interim,
                    });
                }
            };
            response.merge_options_from(&base_options);
            if idx >= rules.len() || response.status < 0 {
                return Ok(Continuation::Immediate(response));
            }

            let rule = rules[idx].clone();
            let matched = match &rule.when {
                None => response.status == STATUS_OK,
                Some(RuleCondition::Literal(flag)) => *flag,
                Some(condition) => {
                    let when_step = match condition {
                        RuleCondition::Eval(expr) => StepDescriptor {
                            address: Some("eval".into()),
                            prompt: Some(Value::String(expr.clone())),
                            rules: Vec::new(),
                        },
                        RuleCondition::Step(step) => step.clone(),
                        RuleCondition::Literal(_) => unreachable!("handled above"),
                    };
                    // conditions probe a semantics-stripped clone, ephemerally
                    let mut probe = response.clone();
                    probe.status = STATUS_OK;
                    probe.message = None;
                    let guard = engine.switch_mode(&ctx, &caller, false, false).await?;
                    let when_cont = engine
                        .process(
                            caller.clone(),
                            when_step,
                            probe,
                            Arc::clone(&ctx),
                            root_search,
                        )
                        .await?;
                    match when_cont {
                        Continuation::Immediate(verdict) => {
                            drop(guard);
                            semantic_match(&verdict, &mut response)
                        }
                        Continuation::Deferred { pending, interim } => {
                            let engine2 = Arc::clone(&engine);
                            let resume = Box::pin(async move {
                                let verdict = pending.await;
                                drop(guard);
                                let matched = semantic_match(&verdict, &mut response);
                                let walked = engine2
                                    .apply_rule(
                                        caller,
                                        rules,
                                        base_options,
                                        idx,
                                        matched,
                                        response,
                                        ctx,
                                        root_search,
                                    )
                                    .await;
                                settle_or_report(walked).await
                            });
                            return Ok(Continuation::Deferred {
                                pending: resume,
                                interim,
                            });
                        }
                    }
                }
            };

            engine
                .apply_rule(
                    caller,
                    rules,
                    base_options,
                    idx,
                    matched,
                    response,
                    ctx,
                    root_search,
                )
                .await
        })
    }

    /// Execute one rule's branch with a known match verdict and continue the
    /// walk from the next index. The next index is computed before the
    /// branch runs, so flow control survives deferral.
    #[allow(clippy::too_many_arguments)]
    async fn apply_rule(
        self: &Arc<Self>,
        caller: ActorRecord,
        rules: Arc<Vec<ResponseRule>>,
        base_options: Map<String, Value>,
        idx: usize,
        matched: bool,
        response: Envelope,
        ctx: Arc<TaskContext>,
        root_search: bool,
    ) -> Result<Continuation> {
        let rule = rules[idx].clone();
        let (branch, next) = if matched {
            let next = if rule.loop_ {
                idx
            } else {
                match &rule.break_ {
                    Some(BreakDirective::Flag(true)) => rules.len(),
                    Some(BreakDirective::Tag(tag)) => {
                        return Err(EngineError::TaggedBreakUnsupported(tag.clone()).into());
                    }
                    _ => idx + 1,
                }
            };
            (rule.then.as_ref().map(|t| t.resolve("llm")), next)
        } else {
            // flow control never applies on the else path
            let branch = rule.else_.as_ref().map(|e| {
                let step = e.resolve("llm");
                if step.address.is_none() && step.rules.is_empty() {
                    // an else with neither address nor rules is replaced by
                    // then's descriptor wholesale
                    if let Some(then_ref) = &rule.then {
                        return then_ref.resolve("llm");
                    }
                }
                step
            });
            (branch, idx + 1)
        };

        let cont = match branch {
            Some(step) => {
                self.process(caller.clone(), step, response, Arc::clone(&ctx), root_search)
                    .await?
            }
            None => Continuation::Immediate(response),
        };
        self.walk(caller, rules, base_options, next, cont, ctx, root_search)
            .await
    }
}

/// Match verdict for an evaluated `when` subject. An errored verdict never
/// matches; otherwise the verdict text decides, with `ErrorHandle` only
/// catching subjects that are themselves errors.
fn semantic_match(verdict: &Envelope, subject: &mut Envelope) -> bool {
    if verdict.is_error() {
        if subject.message.is_none() {
            subject.message = verdict.message.clone();
        }
        return false;
    }
    let text = verdict.text.as_deref().unwrap_or("");
    if subject.is_error() {
        ERROR_HANDLE_RE.is_match(text)
    } else {
        OK_RE.is_match(text)
    }
}

/// Shallow-merge the caller's options into both halves of a continuation.
fn merge_options(cont: Continuation, base: Map<String, Value>) -> Continuation {
    match cont {
        Continuation::Immediate(mut env) => {
            env.merge_options_from(&base);
            Continuation::Immediate(env)
        }
        Continuation::Deferred { pending, mut interim } => {
            interim.merge_options_from(&base);
            Continuation::Deferred {
                pending: Box::pin(async move {
                    let mut env = pending.await;
                    env.merge_options_from(&base);
                    env
                }),
                interim,
            }
        }
    }
}

/// Settle a finished walk, downgrading fatal errors to a terminal envelope
/// so a detached resumption never panics its task.
async fn settle_or_report(walked: Result<Continuation>) -> Envelope {
    match walked {
        Ok(cont) => cont.settle().await,
        Err(err) => {
            error!(error = %err, "rule walk aborted");
            Envelope::default().fail(500, err.to_string(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(status: i32) -> Envelope {
        Envelope {
            status,
            ..Envelope::default()
        }
    }

    #[test]
    fn test_semantic_match_ok_words() {
        let verdict = Envelope::text("Yes, proceed.");
        assert!(semantic_match(&verdict, &mut subject(0)));
    }

    #[test]
    fn test_semantic_match_error_handle_requires_errored_subject() {
        let verdict = Envelope::text("ErrorHandle: invalid");
        assert!(semantic_match(&verdict, &mut subject(500)));
        assert!(!semantic_match(&verdict, &mut subject(0)));
    }

    #[test]
    fn test_semantic_match_yes_does_not_catch_errors() {
        let verdict = Envelope::text("Yes");
        assert!(!semantic_match(&verdict, &mut subject(500)));
    }

    #[test]
    fn test_errored_verdict_never_matches() {
        let mut verdict = Envelope::text("yes");
        verdict.status = 500;
        verdict.message = Some("verdict failed".into());
        let mut sub = subject(0);
        assert!(!semantic_match(&verdict, &mut sub));
        assert_eq!(sub.message.as_deref(), Some("verdict failed"));
    }
}
