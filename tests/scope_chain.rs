//! Variables across calls: contextual persistence, ephemeral isolation,
//! and the var handler's write/move surface.

use serde_json::{json, Value};
use troupe::{
    ActorId, ActorRecord, Envelope, EntryHandle, FixtureModel, HostDefinition, InMemoryDirectory,
    Runtime, StepDescriptor,
};

fn entry(name: &str, contextual: bool, handle: serde_json::Value) -> EntryHandle {
    EntryHandle {
        name: name.to_string(),
        handle: Some(serde_json::from_value::<StepDescriptor>(handle).unwrap()),
        contextual: Some(contextual),
    }
}

fn build_runtime() -> Runtime {
    let directory = InMemoryDirectory::new();
    directory.add_host(HostDefinition {
        id: "host".into(),
        members: Vec::new(),
        entries: vec![
            entry("remember", true, json!({ "address": "var:note", "prompt": "req" })),
            entry("recall", true, json!({ "address": "var", "prompt": "note" })),
            entry("stash", false, json!({ "address": "var:tmp", "prompt": "req" })),
            entry("peek", false, json!({ "address": "var", "prompt": "tmp" })),
            entry(
                "remember-deep",
                true,
                json!({ "address": "var:profile.name", "prompt": "req" }),
            ),
            entry("read-profile", true, json!({ "address": "var", "prompt": "profile" })),
            entry(
                "take",
                true,
                json!({ "address": "var:claimed#move", "prompt": "note" }),
            ),
            entry(
                "guard",
                true,
                json!({ "address": "var:me", "prompt": "req" }),
            ),
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
async fn test_contextual_variables_survive_across_calls() {
    let runtime = build_runtime();
    let alpha = ActorId("alpha".into());

    runtime
        .chat_settled(&alpha, "remember", Envelope::text("hello"), true)
        .await
        .unwrap();
    let reply = runtime
        .chat_settled(&alpha, "recall", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(reply.text.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_ephemeral_variables_vanish_with_the_call() {
    let runtime = build_runtime();
    let alpha = ActorId("alpha".into());

    runtime
        .chat_settled(&alpha, "stash", Envelope::text("temporary"), false)
        .await
        .unwrap();
    let reply = runtime
        .chat_settled(&alpha, "peek", Envelope::default(), false)
        .await
        .unwrap();
    assert_eq!(reply.data, Some(Value::Null));
    assert_eq!(reply.text, None);
}

#[tokio::test]
async fn test_deep_destination_paths_build_objects() {
    let runtime = build_runtime();
    let alpha = ActorId("alpha".into());

    runtime
        .chat_settled(&alpha, "remember-deep", Envelope::text("ava"), true)
        .await
        .unwrap();

    let reply = runtime
        .chat_settled(&alpha, "read-profile", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(reply.data, Some(json!({ "name": "ava" })));
}

#[tokio::test]
async fn test_move_clears_the_source_variable() {
    let runtime = build_runtime();
    let alpha = ActorId("alpha".into());

    runtime
        .chat_settled(&alpha, "remember", Envelope::text("payload"), true)
        .await
        .unwrap();
    runtime
        .chat_settled(&alpha, "take", Envelope::default(), true)
        .await
        .unwrap();

    let reply = runtime
        .chat_settled(&alpha, "recall", Envelope::default(), true)
        .await
        .unwrap();
    assert_eq!(reply.data, Some(Value::Null));
    assert_eq!(reply.text, None);
}

#[tokio::test]
async fn test_builtins_are_read_only() {
    let runtime = build_runtime();
    let reply = runtime
        .chat_settled(
            &ActorId("alpha".into()),
            "guard",
            Envelope::text("overwrite"),
            true,
        )
        .await
        .unwrap();
    assert_eq!(reply.status, 400);
}
