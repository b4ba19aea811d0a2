//! The pause start/run/end rendezvous across independent calls.

use serde_json::json;
use troupe::{
    ActorId, ActorRecord, Envelope, EntryHandle, FixtureModel, HostDefinition, InMemoryDirectory,
    Runtime, StepDescriptor,
};

fn entry(name: &str, handle: serde_json::Value) -> EntryHandle {
    EntryHandle {
        name: name.to_string(),
        handle: Some(serde_json::from_value::<StepDescriptor>(handle).unwrap()),
        contextual: Some(true),
    }
}

fn build_runtime() -> Runtime {
    let directory = InMemoryDirectory::new();
    directory.add_host(HostDefinition {
        id: "host".into(),
        members: Vec::new(),
        entries: vec![
            entry(
                "work",
                json!({
                    "address": "pause:start",
                    "rules": [
                        { "then": { "address": "eval", "prompt": "resumed:<<req>>" } }
                    ]
                }),
            ),
            entry(
                "amend",
                json!({
                    "address": "pause:run",
                    "prompt": { "address": "eval", "prompt": "amended" }
                }),
            ),
            entry("finish", json!({ "address": "pause:end" })),
        ],
    });
    directory.add_actor(ActorRecord {
        id: "alpha".into(),
        name: "alpha".into(),
        parent: None,
        host: Some("host".into()),
        ctx_id: None,
    });
    Runtime::new(directory, FixtureModel::new()).unwrap()
}

#[tokio::test]
async fn test_start_replies_with_processing_interim() {
    let runtime = build_runtime();
    let reply = runtime
        .chat(&ActorId("alpha".into()), "work", Envelope::text("draft"), true)
        .await
        .unwrap();
    assert_eq!(reply.status, 1);
    assert_eq!(reply.text.as_deref(), Some("draft"));
}

#[tokio::test]
async fn test_full_rendezvous_with_run_amendment() {
    let runtime = build_runtime();
    let alpha = ActorId("alpha".into());

    let started = runtime
        .chat(&alpha, "work", Envelope::text("draft"), true)
        .await
        .unwrap();
    assert_eq!(started.status, 1);

    // an external call mutates the paused conversation, not its own envelope
    let ran = runtime
        .chat_settled(&alpha, "amend", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(ran.text.as_deref(), Some("amended"));

    // end returns only after the resumed walk settles
    let finished = runtime
        .chat_settled(&alpha, "finish", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(finished.text.as_deref(), Some("resumed:amended"));
    assert_eq!(finished.status, 0);
}

#[tokio::test]
async fn test_end_payload_overrides_captured_envelope() {
    let runtime = build_runtime();
    let alpha = ActorId("alpha".into());

    runtime
        .chat(&alpha, "work", Envelope::text("draft"), true)
        .await
        .unwrap();

    let finished = runtime
        .chat_settled(&alpha, "finish", Envelope::text("override"), true)
        .await
        .unwrap();
    assert_eq!(finished.text.as_deref(), Some("resumed:override"));
}

#[tokio::test]
async fn test_run_without_session_is_not_allowed() {
    let runtime = build_runtime();
    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "amend", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(reply.status, 405);
}

#[tokio::test]
async fn test_end_without_session_is_not_found() {
    let runtime = build_runtime();
    let reply = runtime
        .chat_settled(&ActorId("alpha".into()), "finish", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(reply.status, 404);
}
