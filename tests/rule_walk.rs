//! Rule walk behavior: cursor-exact resumption, loop/break flow control,
//! else fallback, and semantic matching.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use troupe::{
    ActorId, ActorRecord, Continuation, Envelope, EntryHandle, FixtureModel, HandlerCall,
    HostDefinition, InMemoryDirectory, ProtocolHandler, Runtime, StepDescriptor,
};

fn entry(name: &str, handle: serde_json::Value) -> EntryHandle {
    EntryHandle {
        name: name.to_string(),
        handle: Some(serde_json::from_value::<StepDescriptor>(handle).unwrap()),
        contextual: None,
    }
}

fn build_runtime(
    entries: Vec<EntryHandle>,
    extra: Vec<Arc<dyn ProtocolHandler>>,
) -> (Runtime, Arc<FixtureModel>) {
    let directory = InMemoryDirectory::new();
    directory.add_host(HostDefinition {
        id: "host".into(),
        members: Vec::new(),
        entries,
    });
    directory.add_actor(ActorRecord {
        id: "alpha".into(),
        name: "alpha".into(),
        parent: None,
        host: Some("host".into()),
        ctx_id: None,
    });
    let model = FixtureModel::new();
    let runtime = Runtime::with_handlers(directory, Arc::clone(&model) as _, extra).unwrap();
    (runtime, model)
}

/// Appends its prompt to the request text, but only after a deferral: the
/// caller first sees an interim marked still-processing.
struct DeferAppend;

#[async_trait]
impl ProtocolHandler for DeferAppend {
    fn protocol(&self) -> &'static str {
        "defer"
    }

    async fn invoke(&self, call: HandlerCall) -> troupe::Result<Continuation> {
        let marker = call.step.prompt.clone().unwrap_or_default();
        let mut envelope = call.request;
        let interim = Envelope::default().fail(1, "deferring", None);
        let pending = Box::pin(async move {
            tokio::task::yield_now().await;
            let text = envelope.text.take().unwrap_or_default();
            envelope.text = Some(format!("{text}{marker}"));
            envelope
        });
        Ok(Continuation::Deferred { pending, interim })
    }
}

/// Counts invocations and appends a dot to the text.
struct Tick(Arc<AtomicUsize>);

#[async_trait]
impl ProtocolHandler for Tick {
    fn protocol(&self) -> &'static str {
        "tick"
    }

    async fn invoke(&self, call: HandlerCall) -> troupe::Result<Continuation> {
        self.0.fetch_add(1, Ordering::SeqCst);
        let mut envelope = call.request;
        let text = envelope.text.take().unwrap_or_default();
        envelope.text = Some(format!("{text}."));
        Ok(Continuation::Immediate(envelope))
    }
}

/// Answers yes while the subject text is shorter than three dots.
struct Check;

#[async_trait]
impl ProtocolHandler for Check {
    fn protocol(&self) -> &'static str {
        "check"
    }

    async fn invoke(&self, call: HandlerCall) -> troupe::Result<Continuation> {
        let dots = call.request.text.as_deref().unwrap_or("").len();
        let verdict = if dots < 3 { "yes" } else { "no" };
        Ok(Continuation::Immediate(Envelope::text(verdict)))
    }
}

/// Fails every request with a validation error.
struct Reject;

#[async_trait]
impl ProtocolHandler for Reject {
    fn protocol(&self) -> &'static str {
        "reject"
    }

    async fn invoke(&self, _call: HandlerCall) -> troupe::Result<Continuation> {
        Err(troupe::HandlerFailure::bad_request("rejected").into())
    }
}

#[tokio::test]
async fn test_cursor_resumes_exactly_where_it_deferred() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "rules": [
                    { "then": { "address": "eval", "prompt": "<<req>>a" } },
                    { "then": { "address": "defer", "prompt": "b" } },
                    { "then": { "address": "eval", "prompt": "<<req>>c" } }
                ]
            }),
        )],
        vec![Arc::new(DeferAppend)],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "steps", Envelope::text("x"), false)
        .await
        .unwrap();
    assert_eq!(reply.text.as_deref(), Some("xabc"));
    assert_eq!(reply.status, 0);
}

#[tokio::test]
async fn test_interim_reply_while_walk_is_deferred() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "rules": [
                    { "then": { "address": "defer", "prompt": "b" } }
                ]
            }),
        )],
        vec![Arc::new(DeferAppend)],
    );

    let reply = runtime
        .chat(&ActorId("alpha".into()), "steps", Envelope::text("x"), false)
        .await
        .unwrap();
    assert_eq!(reply.status, 1);
}

#[tokio::test]
async fn test_loop_runs_exactly_three_times() {
    let count = Arc::new(AtomicUsize::new(0));
    let (runtime, _model) = build_runtime(
        vec![entry(
            "drill",
            json!({
                "rules": [
                    {
                        "when": { "address": "check" },
                        "then": { "address": "tick" },
                        "loop": true
                    }
                ]
            }),
        )],
        vec![Arc::new(Tick(Arc::clone(&count))), Arc::new(Check)],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "drill", Envelope::text(""), false)
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(reply.text.as_deref(), Some("..."));
}

#[tokio::test]
async fn test_break_skips_remaining_rules() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "rules": [
                    { "then": { "address": "eval", "prompt": "<<req>>1" }, "break": true },
                    { "then": { "address": "eval", "prompt": "<<req>>2" } }
                ]
            }),
        )],
        vec![],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "steps", Envelope::text("s"), false)
        .await
        .unwrap();
    assert_eq!(reply.text.as_deref(), Some("s1"));
}

#[tokio::test]
async fn test_tagged_break_fails_loudly() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "rules": [
                    { "tag": "outer" },
                    { "break": "outer" }
                ]
            }),
        )],
        vec![],
    );

    let result = runtime
        .chat_settled(&ActorId("alpha".into()), "steps", Envelope::text("s"), false)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_else_falls_back_to_then_descriptor() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "address": "reject",
                "rules": [
                    {
                        "then": { "address": "eval", "prompt": "thens-prompt" },
                        "else": { "prompt": "elses-prompt" }
                    }
                ]
            }),
        )],
        vec![Arc::new(Reject)],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "steps", Envelope::text("s"), false)
        .await
        .unwrap();
    // an else without address or rules is replaced by then's whole descriptor
    assert_eq!(reply.text.as_deref(), Some("thens-prompt"));
    assert_eq!(reply.status, 400);
}

#[tokio::test]
async fn test_interim_carries_caller_options() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "rules": [
                    { "then": { "address": "defer", "prompt": "b", "rules": [ {} ] } }
                ]
            }),
        )],
        vec![Arc::new(DeferAppend)],
    );

    let mut request = Envelope::text("x");
    request.options.insert("trace".into(), json!("t1"));
    let reply = runtime
        .chat(&ActorId("alpha".into()), "steps", request, false)
        .await
        .unwrap();
    assert_eq!(reply.status, 1);
    assert_eq!(reply.options.get("trace"), Some(&json!("t1")));
}

#[tokio::test]
async fn test_error_protocol_sets_status_declaratively() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "missing",
            json!({ "address": "error:404", "prompt": "no such thing" }),
        )],
        vec![],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "missing", Envelope::text("q"), false)
        .await
        .unwrap();
    assert_eq!(reply.status, 404);
    assert_eq!(reply.message.as_deref(), Some("no such thing"));
}

#[tokio::test]
async fn test_error_protocol_keeps_first_failure() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "address": "reject",
                "rules": [
                    { "else": { "address": "error:404", "prompt": "second" } }
                ]
            }),
        )],
        vec![Arc::new(Reject)],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "steps", Envelope::text("q"), false)
        .await
        .unwrap();
    assert_eq!(reply.status, 400);
    assert_eq!(reply.message.as_deref(), Some("rejected"));
}

#[tokio::test]
async fn test_string_when_matches_affirmative_text() {
    let (runtime, _model) = build_runtime(
        vec![entry(
            "steps",
            json!({
                "rules": [
                    {
                        "when": "'yes'",
                        "then": { "address": "eval", "prompt": "matched" },
                        "else": { "address": "eval", "prompt": "not matched" }
                    }
                ]
            }),
        )],
        vec![],
    );

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "steps", Envelope::text("s"), false)
        .await
        .unwrap();
    assert_eq!(reply.text.as_deref(), Some("matched"));
}

#[tokio::test]
async fn test_descriptor_when_asks_the_model() {
    let (runtime, model) = build_runtime(
        vec![entry(
            "review",
            json!({
                "rules": [
                    {
                        "when": { "address": "llm", "prompt": "is this good?" },
                        "then": { "address": "eval", "prompt": "approved" },
                        "else": { "address": "eval", "prompt": "revise" }
                    }
                ]
            }),
        )],
        vec![],
    );
    model.push(Envelope::text("Yes, proceed."));

    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "review", Envelope::text("draft"), false)
        .await
        .unwrap();
    assert_eq!(reply.text.as_deref(), Some("approved"));
}
