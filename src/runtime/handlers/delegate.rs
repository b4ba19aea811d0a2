//! `@`: delegation through the actor tree
//!
//! Walks the member chain from the caller (`@writer@editor#review`),
//! materializing declared members lazily, then invokes the requested entry
//! on the resolved actor. Contextual mode is inherited from whether the
//! caller currently holds a long-running scope.

use async_trait::async_trait;
use tracing::debug;

use crate::runtime::continuation::Continuation;
use crate::runtime::directory::{ActorDirectory, ActorRecord};
use crate::runtime::error::{HandlerFailure, Result};
use crate::runtime::registry::{HandlerCall, ProtocolHandler};
use crate::runtime::scope::ScopeBinding;
use crate::runtime::step::{loose_json, Address};

pub struct DelegateHandler;

#[async_trait]
impl ProtocolHandler for DelegateHandler {
    fn protocol(&self) -> &'static str {
        "@"
    }

    async fn invoke(&self, call: HandlerCall) -> Result<Continuation> {
        let Some(Address::Delegate { members, entry }) = call.step.address.clone() else {
            return Err(HandlerFailure::internal("delegate invoked without an @ address").into());
        };
        if !call.step.rules.is_empty() {
            return Err(HandlerFailure::bad_request(
                "a delegation step cannot carry its own rules; attach them to the entry",
            )
            .into());
        }

        let mut request = call.request;
        if let Some(prompt) = call.step.prompt.as_deref().filter(|p| !p.is_empty()) {
            if call.step.is_json {
                request.data = Some(loose_json(prompt)?);
                request.text = None;
            } else {
                request.text = Some(prompt.to_string());
                request.data = None;
            }
        }

        let mut target = call.caller.clone();
        for segment in &members {
            target = resolve_segment(call.engine.directory(), &target, segment)
                .await?
                .ok_or_else(|| {
                    HandlerFailure::not_found(format!(
                        "no member '{segment}' under '{}'",
                        target.id
                    ))
                })?;
        }
        debug!(from = %call.caller.id, to = %target.id, ?entry, "delegating");

        let contextual = call
            .ctx
            .binding()
            .as_ref()
            .is_some_and(ScopeBinding::is_long_running);
        call.engine
            .chat_entry(
                target,
                contextual,
                request,
                entry.unwrap_or_default(),
                call.ctx,
                call.root_search,
            )
            .await
    }
}

/// Resolve one chain segment: empty stays put, `parent` climbs, anything
/// else is a member, materialized from the declaration list on first use.
async fn resolve_segment(
    directory: &std::sync::Arc<dyn ActorDirectory>,
    current: &ActorRecord,
    segment: &str,
) -> Result<Option<ActorRecord>> {
    if segment.is_empty() {
        return Ok(Some(current.clone()));
    }
    if segment == "parent" {
        let Some(parent_id) = &current.parent else {
            return Ok(None);
        };
        return Ok(directory.find(parent_id).await);
    }
    if let Some(member) = directory.find_member(&current.id, segment).await {
        return Ok(Some(member));
    }
    let Some(host_id) = &current.host else {
        return Ok(None);
    };
    let Some(host) = directory.host(host_id).await else {
        return Ok(None);
    };
    let Some(decl) = host.members.iter().find(|decl| decl.name == segment) else {
        return Ok(None);
    };
    Ok(Some(directory.create_member(current, decl).await?))
}
