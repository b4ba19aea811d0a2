//! Collaborator seams: the actor directory and the language model
//!
//! The engine never owns actor definitions or model transports; it talks to
//! these traits. In-memory implementations back the tests and embedded use.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::Envelope;
use super::error::{Result, RuntimeError};
use super::scope::ScopeId;
use super::step::StepDescriptor;

/// Actor identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A live actor: an instance of a host, optionally nested under a parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Unique actor id.
    pub id: ActorId,
    /// Member name within the parent (or the root actor's own name).
    pub name: String,
    /// Enclosing actor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ActorId>,
    /// Host definition this actor instantiates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Persisted long-running scope, if one has been created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx_id: Option<ScopeId>,
}

/// A member an actor's host declares and may materialize lazily.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDecl {
    /// Member name, addressable via `@name`.
    pub name: String,
    /// Host the member instantiates. Defaults to the parent's host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// A named entry point on a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHandle {
    /// Entry name; empty string is the default entry.
    #[serde(default)]
    pub name: String,
    /// Step run for this entry. `None` passes the request through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<StepDescriptor>,
    /// Override of the caller-supplied contextual flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contextual: Option<bool>,
}

/// A host: entry points plus declared members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDefinition {
    /// Host id referenced from actor records and member declarations.
    pub id: String,
    /// Members actors of this host may delegate to.
    #[serde(default)]
    pub members: Vec<MemberDecl>,
    /// Entry handles; looked up before the built-in defaults.
    #[serde(default)]
    pub entries: Vec<EntryHandle>,
}

/// The entries every host answers when it does not declare its own: the
/// default entry forwards the request text to the language model.
pub fn default_entries() -> Vec<EntryHandle> {
    let mut step = StepDescriptor::to("llm");
    step.prompt = Some(Value::String("<<req>>".into()));
    vec![EntryHandle {
        name: String::new(),
        handle: Some(step),
        contextual: None,
    }]
}

/// Actor lookup and lifecycle, as seen by the engine.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    /// Look up an actor by id.
    async fn find(&self, id: &ActorId) -> Option<ActorRecord>;

    /// Look up a materialized member by name under a parent.
    async fn find_member(&self, parent: &ActorId, name: &str) -> Option<ActorRecord>;

    /// Look up a host definition.
    async fn host(&self, id: &str) -> Option<HostDefinition>;

    /// Materialize a declared member under a parent.
    async fn create_member(&self, parent: &ActorRecord, decl: &MemberDecl) -> Result<ActorRecord>;

    /// Durably record the actor's long-running scope id.
    async fn persist_ctx_id(&self, id: &ActorId, ctx_id: Option<ScopeId>) -> Result<()>;
}

/// Text completion collaborator. Provider selection, retries, and rate
/// limits live behind this trait.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a prompt. Preference keys (cost, quality) and any opaque
    /// pass-through state arrive in `options`.
    async fn complete(&self, prompt: &str, options: &Map<String, Value>) -> Result<Envelope>;
}

#[derive(Default)]
struct DirectoryInner {
    actors: HashMap<ActorId, ActorRecord>,
    hosts: HashMap<String, HostDefinition>,
}

/// In-memory [`ActorDirectory`].
#[derive(Default)]
pub struct InMemoryDirectory {
    inner: Mutex<DirectoryInner>,
}

impl InMemoryDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_host(&self, host: HostDefinition) {
        self.inner.lock().hosts.insert(host.id.clone(), host);
    }

    pub fn add_actor(&self, actor: ActorRecord) {
        self.inner.lock().actors.insert(actor.id.clone(), actor);
    }
}

#[async_trait]
impl ActorDirectory for InMemoryDirectory {
    async fn find(&self, id: &ActorId) -> Option<ActorRecord> {
        self.inner.lock().actors.get(id).cloned()
    }

    async fn find_member(&self, parent: &ActorId, name: &str) -> Option<ActorRecord> {
        let inner = self.inner.lock();
        inner
            .actors
            .values()
            .find(|actor| actor.parent.as_ref() == Some(parent) && actor.name == name)
            .cloned()
    }

    async fn host(&self, id: &str) -> Option<HostDefinition> {
        self.inner.lock().hosts.get(id).cloned()
    }

    async fn create_member(&self, parent: &ActorRecord, decl: &MemberDecl) -> Result<ActorRecord> {
        let mut inner = self.inner.lock();
        let id = ActorId(format!("{}/{}", parent.id, decl.name));
        let record = ActorRecord {
            id: id.clone(),
            name: decl.name.clone(),
            parent: Some(parent.id.clone()),
            host: decl.host.clone().or_else(|| parent.host.clone()),
            ctx_id: None,
        };
        inner.actors.insert(id, record.clone());
        Ok(record)
    }

    async fn persist_ctx_id(&self, id: &ActorId, ctx_id: Option<ScopeId>) -> Result<()> {
        let mut inner = self.inner.lock();
        let actor = inner
            .actors
            .get_mut(id)
            .ok_or_else(|| RuntimeError::Config(format!("unknown actor '{id}'")))?;
        actor.ctx_id = ctx_id;
        Ok(())
    }
}

/// A [`LanguageModel`] replaying scripted envelopes, echoing the prompt once
/// the script runs out. Used by tests and the demo driver.
#[derive(Default)]
pub struct FixtureModel {
    replies: Mutex<VecDeque<Envelope>>,
}

impl FixtureModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the next reply.
    pub fn push(&self, reply: Envelope) {
        self.replies.lock().push_back(reply);
    }
}

#[async_trait]
impl LanguageModel for FixtureModel {
    async fn complete(&self, prompt: &str, _options: &Map<String, Value>) -> Result<Envelope> {
        Ok(self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| Envelope::text(prompt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_member_creation_nests_ids() {
        let dir = InMemoryDirectory::new();
        let parent = ActorRecord {
            id: "team".into(),
            name: "team".into(),
            parent: None,
            host: Some("team-host".into()),
            ctx_id: None,
        };
        dir.add_actor(parent.clone());

        let decl = MemberDecl {
            name: "writer".into(),
            host: None,
        };
        let member = dir.create_member(&parent, &decl).await.unwrap();
        assert_eq!(member.id, ActorId("team/writer".into()));
        assert_eq!(member.host.as_deref(), Some("team-host"));

        let found = dir.find_member(&parent.id, "writer").await.unwrap();
        assert_eq!(found.id, member.id);
    }

    #[tokio::test]
    async fn test_fixture_model_replays_then_echoes() {
        let model = FixtureModel::new();
        model.push(Envelope::text("scripted"));

        let opts = Map::new();
        let first = model.complete("ignored", &opts).await.unwrap();
        assert_eq!(first.text.as_deref(), Some("scripted"));
        let second = model.complete("echo me", &opts).await.unwrap();
        assert_eq!(second.text.as_deref(), Some("echo me"));
    }
}
