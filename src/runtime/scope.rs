//! Scope chains and the namespaced variable store
//!
//! Long-running scopes are persisted records forming disjoint singly-linked
//! chains (one parent, at most one child). Ephemeral scopes are call-local:
//! they hold their variables in the binding itself and hang off a persisted
//! parent, so reads can still walk the chain while writes vanish with the
//! call. Within every scope, variables are partitioned by a namespace key,
//! the id of the owning actor.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::debug;

use super::error::{ScopeError, ScopeResult};
use super::expr::ExprScope;

/// Scope identifier. Zero is reserved for ephemeral scopes.
pub type ScopeId = u64;

/// The id every ephemeral scope reports.
pub const EPHEMERAL_ID: ScopeId = 0;

type VarMap = HashMap<String, HashMap<String, Value>>;

/// A scope record.
#[derive(Debug, Clone)]
pub struct ScopeData {
    /// Scope id; [`EPHEMERAL_ID`] for call-local scopes.
    pub id: ScopeId,
    /// Enclosing scope, if any.
    pub parent: Option<ScopeId>,
    /// At most one long-running child.
    pub child: Option<ScopeId>,
    /// Name the child was created under.
    pub name: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ScopeData {
    /// Whether this scope outlives the call that created it.
    pub fn is_long_running(&self) -> bool {
        self.id != EPHEMERAL_ID
    }
}

/// A call's attachment to a scope: the record plus, for ephemeral scopes,
/// the call-local variable map.
#[derive(Debug, Clone)]
pub struct ScopeBinding {
    /// The bound scope.
    pub data: ScopeData,
    locals: Arc<Mutex<VarMap>>,
}

impl ScopeBinding {
    /// A fresh ephemeral scope under an optional persisted parent.
    pub fn ephemeral(parent: Option<ScopeId>) -> Self {
        Self {
            data: ScopeData {
                id: EPHEMERAL_ID,
                parent,
                child: None,
                name: None,
                created_at: Utc::now(),
            },
            locals: Arc::new(Mutex::new(VarMap::new())),
        }
    }

    fn stored(data: ScopeData) -> Self {
        Self {
            data,
            locals: Arc::new(Mutex::new(VarMap::new())),
        }
    }

    /// Whether the binding is attached to a persisted scope.
    pub fn is_long_running(&self) -> bool {
        self.data.is_long_running()
    }
}

#[derive(Default)]
struct StoreInner {
    next_id: ScopeId,
    scopes: HashMap<ScopeId, ScopeData>,
    vars: HashMap<ScopeId, VarMap>,
}

/// In-memory store of persisted scope chains and their variables.
pub struct ScopeStore {
    inner: Mutex<StoreInner>,
}

impl Default for ScopeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                next_id: 1,
                ..StoreInner::default()
            }),
        }
    }

    /// Look up a persisted scope.
    pub fn scope(&self, id: ScopeId) -> ScopeResult<ScopeData> {
        self.inner
            .lock()
            .scopes
            .get(&id)
            .cloned()
            .ok_or(ScopeError::NotFound(id))
    }

    /// Bind a call to an existing persisted scope.
    pub fn bind(&self, id: ScopeId) -> ScopeResult<ScopeBinding> {
        Ok(ScopeBinding::stored(self.scope(id)?))
    }

    /// The chain root a binding belongs to, through its nearest persisted
    /// scope.
    pub fn root_of(&self, binding: &ScopeBinding) -> ScopeResult<ScopeId> {
        let start = if binding.is_long_running() {
            binding.data.id
        } else {
            binding
                .data
                .parent
                .ok_or(ScopeError::NotFound(EPHEMERAL_ID))?
        };
        let inner = self.inner.lock();
        let mut current = inner.scopes.get(&start).ok_or(ScopeError::NotFound(start))?;
        while let Some(parent) = current.parent {
            current = inner
                .scopes
                .get(&parent)
                .ok_or(ScopeError::NotFound(parent))?;
        }
        Ok(current.id)
    }

    /// Create (or reattach to) a child scope.
    ///
    /// A long-running child is idempotent per name: asking again for the same
    /// name yields the existing child, a different name is a conflict. An
    /// ephemeral child requires a persisted parent.
    pub fn create_child(
        &self,
        parent: Option<ScopeId>,
        long_running: bool,
        name: Option<&str>,
    ) -> ScopeResult<ScopeBinding> {
        if !long_running {
            let parent = parent.ok_or(ScopeError::EphemeralRoot)?;
            self.scope(parent)?;
            return Ok(ScopeBinding::ephemeral(Some(parent)));
        }

        let mut inner = self.inner.lock();
        if let Some(parent_id) = parent {
            let parent_scope = inner
                .scopes
                .get(&parent_id)
                .ok_or(ScopeError::NotFound(parent_id))?;
            if let Some(child_id) = parent_scope.child {
                let child = inner
                    .scopes
                    .get(&child_id)
                    .ok_or(ScopeError::NotFound(child_id))?;
                if child.name.as_deref() == name {
                    return Ok(ScopeBinding::stored(child.clone()));
                }
                return Err(ScopeError::NameConflict {
                    existing: child.name.clone().unwrap_or_default(),
                    requested: name.unwrap_or_default().to_string(),
                });
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let data = ScopeData {
            id,
            parent,
            child: None,
            name: name.map(str::to_string),
            created_at: Utc::now(),
        };
        inner.scopes.insert(id, data.clone());
        if let Some(parent_id) = parent {
            if let Some(parent_scope) = inner.scopes.get_mut(&parent_id) {
                parent_scope.child = Some(id);
            }
        }
        debug!(scope = id, ?parent, name, "created long-running scope");
        Ok(ScopeBinding::stored(data))
    }

    /// Destroy a scope and everything below it, clearing all namespaces and
    /// unlinking the parent's child pointer. Returns the parent id.
    pub fn destroy_chain(&self, id: ScopeId) -> ScopeResult<Option<ScopeId>> {
        let mut inner = self.inner.lock();
        let scope = inner.scopes.get(&id).ok_or(ScopeError::NotFound(id))?;
        let parent = scope.parent;
        let lived = Utc::now() - scope.created_at;

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            cursor = inner.scopes.remove(&current).and_then(|scope| scope.child);
            inner.vars.remove(&current);
        }
        if let Some(parent_id) = parent {
            if let Some(parent_scope) = inner.scopes.get_mut(&parent_id) {
                parent_scope.child = None;
            }
        }
        debug!(
            scope = id,
            ?parent,
            lived_secs = lived.num_seconds(),
            "destroyed scope chain"
        );
        Ok(parent)
    }

    /// Read a variable through the binding's chain.
    ///
    /// Plain reads return the first owner from the current scope toward the
    /// root; root-search reads return the value at the outermost owner.
    pub fn get_var(
        &self,
        binding: &ScopeBinding,
        name: &str,
        namespace: &str,
        root_search: bool,
    ) -> Value {
        let local = binding
            .locals
            .lock()
            .get(namespace)
            .and_then(|vars| vars.get(name))
            .cloned();
        let local = if binding.is_long_running() { None } else { local };

        let inner = self.inner.lock();
        let chain = chain_ids(&inner, binding);
        let stored = |id: ScopeId| {
            inner
                .vars
                .get(&id)
                .and_then(|ns| ns.get(namespace))
                .and_then(|vars| vars.get(name))
                .cloned()
        };

        if root_search {
            for id in chain.iter().rev() {
                if let Some(value) = stored(*id) {
                    return value;
                }
            }
            return local.unwrap_or(Value::Null);
        }

        if let Some(value) = local {
            return value;
        }
        for id in &chain {
            if let Some(value) = stored(*id) {
                return value;
            }
        }
        Value::Null
    }

    /// Write a variable.
    ///
    /// Plain writes land in the current scope. Root-search writes land in
    /// the outermost owning scope, falling back to the current scope when
    /// no scope in the chain owns the name yet.
    pub fn set_var(
        &self,
        binding: &ScopeBinding,
        name: &str,
        value: Value,
        namespace: &str,
        root_search: bool,
    ) {
        let mut inner = self.inner.lock();
        if root_search {
            let chain = chain_ids(&inner, binding);
            for id in chain.iter().rev() {
                let owns = inner
                    .vars
                    .get(id)
                    .and_then(|ns| ns.get(namespace))
                    .is_some_and(|vars| vars.contains_key(name));
                if owns {
                    store_write(&mut inner, *id, namespace, name, value);
                    return;
                }
            }
        }

        if binding.is_long_running() {
            store_write(&mut inner, binding.data.id, namespace, name, value);
        } else {
            drop(inner);
            binding
                .locals
                .lock()
                .entry(namespace.to_string())
                .or_default()
                .insert(name.to_string(), value);
        }
    }
}

/// Persisted chain from the binding's nearest stored scope up to the root.
fn chain_ids(inner: &StoreInner, binding: &ScopeBinding) -> Vec<ScopeId> {
    let mut chain = Vec::new();
    let mut cursor = if binding.is_long_running() {
        Some(binding.data.id)
    } else {
        binding.data.parent
    };
    while let Some(id) = cursor {
        chain.push(id);
        cursor = inner.scopes.get(&id).and_then(|scope| scope.parent);
    }
    chain
}

fn store_write(inner: &mut StoreInner, id: ScopeId, namespace: &str, name: &str, value: Value) {
    inner
        .vars
        .entry(id)
        .or_default()
        .entry(namespace.to_string())
        .or_default()
        .insert(name.to_string(), value);
}

/// Per-call scope state: the current binding plus a stash slot used when a
/// call inside a long-running scope temporarily drops to ephemeral mode.
#[derive(Default)]
pub struct TaskContext {
    binding: Mutex<Option<ScopeBinding>>,
    stash: Mutex<Option<ScopeBinding>>,
}

impl TaskContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The currently bound scope, if any.
    pub fn binding(&self) -> Option<ScopeBinding> {
        self.binding.lock().clone()
    }

    /// The stashed ephemeral binding, if any.
    pub fn stashed(&self) -> Option<ScopeBinding> {
        self.stash.lock().clone()
    }

    /// Replace the current binding, returning the previous one.
    pub fn replace_binding(&self, binding: Option<ScopeBinding>) -> Option<ScopeBinding> {
        std::mem::replace(&mut *self.binding.lock(), binding)
    }

    /// Replace the stash slot, returning the previous content.
    pub fn replace_stash(&self, stash: Option<ScopeBinding>) -> Option<ScopeBinding> {
        std::mem::replace(&mut *self.stash.lock(), stash)
    }
}

/// RAII restore for a mode switch: captures the binding and stash at switch
/// time and puts both back when dropped, on every exit path.
pub struct ModeGuard {
    ctx: Arc<TaskContext>,
    prev_binding: Option<ScopeBinding>,
    prev_stash: Option<ScopeBinding>,
}

impl ModeGuard {
    /// Capture the context's current state before a switch.
    pub fn capture(ctx: &Arc<TaskContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            prev_binding: ctx.binding(),
            prev_stash: ctx.stashed(),
        }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        self.ctx.replace_binding(self.prev_binding.take());
        self.ctx.replace_stash(self.prev_stash.take());
    }
}

/// The variable surface an expression sees during one dispatch: builtins
/// (`me`, `req`, `id`) layered over the namespaced scope chain.
pub struct ScopeView {
    store: Arc<ScopeStore>,
    binding: ScopeBinding,
    namespace: String,
    root_search: bool,
    extras: Map<String, Value>,
}

impl ScopeView {
    pub fn new(
        store: Arc<ScopeStore>,
        binding: ScopeBinding,
        namespace: impl Into<String>,
        root_search: bool,
        extras: Map<String, Value>,
    ) -> Self {
        Self {
            store,
            binding,
            namespace: namespace.into(),
            root_search,
            extras,
        }
    }

    /// Names that shadow scope variables and are never writable.
    pub fn is_builtin(name: &str) -> bool {
        matches!(name, "me" | "req" | "id")
    }

    /// Resolve a top-level name.
    pub fn get_sync(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.extras.get(name) {
            return Some(value.clone());
        }
        if name == "id" {
            return Some(Value::from(self.binding.data.id));
        }
        match self
            .store
            .get_var(&self.binding, name, &self.namespace, self.root_search)
        {
            Value::Null => None,
            value => Some(value),
        }
    }

    /// Write a scope variable through the binding.
    pub fn set(&self, name: &str, value: Value) {
        self.store
            .set_var(&self.binding, name, value, &self.namespace, self.root_search);
    }

    /// The binding this view reads through.
    pub fn binding(&self) -> &ScopeBinding {
        &self.binding
    }
}

#[async_trait]
impl ExprScope for ScopeView {
    async fn get(&self, name: &str) -> Option<Value> {
        self.get_sync(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ephemeral_requires_parent() {
        let store = ScopeStore::new();
        assert!(matches!(
            store.create_child(None, false, None),
            Err(ScopeError::EphemeralRoot)
        ));
    }

    #[test]
    fn test_long_running_child_idempotent_and_conflicting() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, Some("job")).unwrap();
        let a = store
            .create_child(Some(root.data.id), true, Some("phase1"))
            .unwrap();
        let b = store
            .create_child(Some(root.data.id), true, Some("phase1"))
            .unwrap();
        assert_eq!(a.data.id, b.data.id);

        assert!(matches!(
            store.create_child(Some(root.data.id), true, Some("phase2")),
            Err(ScopeError::NameConflict { .. })
        ));
    }

    #[test]
    fn test_plain_read_prefers_nearest_owner() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let child = store.create_child(Some(root.data.id), true, Some("c")).unwrap();

        store.set_var(&root, "x", json!("outer"), "a1", false);
        store.set_var(&child, "x", json!("inner"), "a1", false);

        assert_eq!(store.get_var(&child, "x", "a1", false), json!("inner"));
        assert_eq!(store.get_var(&child, "x", "a1", true), json!("outer"));
    }

    #[test]
    fn test_root_search_write_updates_outermost_owner() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let child = store.create_child(Some(root.data.id), true, Some("c")).unwrap();

        store.set_var(&root, "x", json!(1), "a1", false);
        store.set_var(&child, "x", json!(2), "a1", true);

        assert_eq!(store.get_var(&root, "x", "a1", false), json!(2));
    }

    #[test]
    fn test_root_search_write_leaves_current_copy_untouched() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let child = store.create_child(Some(root.data.id), true, Some("c")).unwrap();

        store.set_var(&root, "x", json!("outer"), "a1", false);
        store.set_var(&child, "x", json!("own"), "a1", false);
        store.set_var(&child, "x", json!("updated"), "a1", true);

        assert_eq!(store.get_var(&root, "x", "a1", false), json!("updated"));
        assert_eq!(store.get_var(&child, "x", "a1", false), json!("own"));
    }

    #[test]
    fn test_root_search_write_falls_back_to_current() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let child = store.create_child(Some(root.data.id), true, Some("c")).unwrap();

        store.set_var(&child, "fresh", json!(5), "a1", true);

        assert_eq!(store.get_var(&child, "fresh", "a1", false), json!(5));
        assert_eq!(store.get_var(&root, "fresh", "a1", false), Value::Null);
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        store.set_var(&root, "x", json!(1), "a1", false);
        assert_eq!(store.get_var(&root, "x", "a2", false), Value::Null);
    }

    #[test]
    fn test_ephemeral_writes_do_not_persist() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let eph = store.create_child(Some(root.data.id), false, None).unwrap();

        store.set_var(&eph, "tmp", json!(1), "a1", false);
        assert_eq!(store.get_var(&eph, "tmp", "a1", false), json!(1));
        assert_eq!(store.get_var(&root, "tmp", "a1", false), Value::Null);

        // a fresh ephemeral binding starts clean
        let eph2 = store.create_child(Some(root.data.id), false, None).unwrap();
        assert_eq!(store.get_var(&eph2, "tmp", "a1", false), Value::Null);
    }

    #[test]
    fn test_ephemeral_reads_fall_through_to_chain() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let eph = store.create_child(Some(root.data.id), false, None).unwrap();

        store.set_var(&root, "shared", json!("kept"), "a1", false);
        assert_eq!(store.get_var(&eph, "shared", "a1", false), json!("kept"));
    }

    #[test]
    fn test_destroy_chain_clears_descendants() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let mid = store.create_child(Some(root.data.id), true, Some("m")).unwrap();
        let leaf = store.create_child(Some(mid.data.id), true, Some("l")).unwrap();
        store.set_var(&leaf, "x", json!(1), "a1", false);

        let parent = store.destroy_chain(mid.data.id).unwrap();
        assert_eq!(parent, Some(root.data.id));
        assert!(store.scope(mid.data.id).is_err());
        assert!(store.scope(leaf.data.id).is_err());
        assert_eq!(store.scope(root.data.id).unwrap().child, None);
    }

    #[test]
    fn test_mode_guard_restores_on_drop() {
        let store = ScopeStore::new();
        let root = store.create_child(None, true, None).unwrap();
        let ctx = TaskContext::new();
        ctx.replace_binding(Some(root.clone()));

        {
            let _guard = ModeGuard::capture(&ctx);
            ctx.replace_binding(Some(ScopeBinding::ephemeral(Some(root.data.id))));
            assert!(!ctx.binding().unwrap().is_long_running());
        }
        assert!(ctx.binding().unwrap().is_long_running());
    }
}
