//! Hierarchical variable scopes.
//!
//! Lookups walk the parent chain. `set` always writes locally; `assign`
//! updates the nearest existing binding without crossing a frame boundary
//! (request, job or function call) and otherwise writes locally. Names
//! starting with `_` are interpreter state: they are always written locally
//! and never appear in snapshots.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::arena::{Arena, VarMap};
use crate::value::{Value, ValueMap};

/// Reserved key holding the active query builder state.
pub const QUERY_STATE_KEY: &str = "_query_state";
/// Reserved key holding the active transaction handle.
pub const ACTIVE_TX_KEY: &str = "_active_tx";
/// Reserved key holding a function frame's return value.
pub const RETURN_VALUE_KEY: &str = "_return_value";
/// Reserved key prefix for declared functions.
pub const FUNCTION_PREFIX: &str = "_fn.";

/// Returns `true` for interpreter-internal names.
pub fn is_reserved(name: &str) -> bool {
    name.starts_with('_')
}

/// A variable scope. Cloning shares the same scope.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    vars: Mutex<VarMap>,
    parent: Option<Scope>,
    frame: bool,
    arena: Option<Weak<Arena>>,
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.as_ref().and_then(Weak::upgrade) {
            arena.recycle(std::mem::take(self.vars.get_mut()));
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    /// Create a root scope.
    pub fn new() -> Self {
        Self::build(None, true, None)
    }

    /// Create a root scope whose storage comes from `arena`.
    pub fn in_arena(arena: &Arc<Arena>) -> Self {
        Self::build(None, true, Some(Arc::clone(arena)))
    }

    /// Create a nested scope; `assign` may update bindings in `self`.
    #[must_use]
    pub fn child(&self) -> Self {
        Self::build(Some(self.clone()), false, None)
    }

    /// Create a frame scope: reads see `self`, writes never land in it.
    #[must_use]
    pub fn frame_child(&self) -> Self {
        Self::build(Some(self.clone()), true, None)
    }

    /// Create a frame scope allocated from `arena`.
    #[must_use]
    pub fn frame_child_in(&self, arena: &Arc<Arena>) -> Self {
        Self::build(Some(self.clone()), true, Some(Arc::clone(arena)))
    }

    fn build(parent: Option<Scope>, frame: bool, arena: Option<Arc<Arena>>) -> Self {
        let arena = arena.or_else(|| parent.as_ref().and_then(Scope::arena));
        let vars = arena.as_ref().map(|a| a.take_map()).unwrap_or_default();
        Self {
            inner: Arc::new(ScopeInner {
                vars: Mutex::new(vars),
                parent,
                frame,
                arena: arena.as_ref().map(Arc::downgrade),
            }),
        }
    }

    /// The arena backing this scope, if it is still checked out.
    pub fn arena(&self) -> Option<Arc<Arena>> {
        self.inner.arena.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent(&self) -> Option<&Scope> {
        self.inner.parent.as_ref()
    }

    /// Look a name up through the parent chain.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(v) = scope.inner.vars.lock().get(name) {
                return Some(v.clone());
            }
            current = scope.parent();
        }
        None
    }

    /// Look a name up in this scope only.
    pub fn get_local(&self, name: &str) -> Option<Value> {
        self.inner.vars.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Bind `name` in this scope.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.inner.vars.lock().insert(name.into(), value);
    }

    /// Update the nearest binding up to the frame boundary, else bind locally.
    pub fn assign(&self, name: &str, value: Value) {
        if !is_reserved(name) {
            let mut current = Some(self);
            while let Some(scope) = current {
                let mut vars = scope.inner.vars.lock();
                if let Some(slot) = vars.get_mut(name) {
                    *slot = value;
                    return;
                }
                drop(vars);
                if scope.inner.frame {
                    break;
                }
                current = scope.parent();
            }
        }
        self.set(name, value);
    }

    /// Remove a local binding.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.inner.vars.lock().remove(name)
    }

    /// Remove the nearest binding of `name` along the chain.
    pub fn remove_nearest(&self, name: &str) -> Option<Value> {
        let mut current = Some(self);
        while let Some(scope) = current {
            if let Some(v) = scope.inner.vars.lock().remove(name) {
                return Some(v);
            }
            current = scope.parent();
        }
        None
    }

    /// The nearest enclosing frame scope (possibly `self`).
    pub fn frame(&self) -> Scope {
        let mut current = self;
        loop {
            if current.inner.frame {
                return current.clone();
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return current.clone(),
            }
        }
    }

    /// Visible, non-reserved variables; inner bindings shadow outer ones.
    pub fn snapshot(&self) -> ValueMap {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(scope) = current {
            chain.push(scope);
            current = scope.parent();
        }

        let mut out = ValueMap::new();
        for scope in chain.into_iter().rev() {
            let vars = scope.inner.vars.lock();
            let mut keys: Vec<&String> = vars.keys().filter(|k| !is_reserved(k)).collect();
            keys.sort();
            for key in keys {
                out.insert(key.clone(), vars[key].clone());
            }
        }
        out
    }

    /// Names bound directly in this scope.
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.vars.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a dotted path such as `user.address.0.city`.
    ///
    /// Missing segments resolve to `Nil`.
    pub fn resolve_path(&self, path: &str) -> Value {
        let mut segments = path.split('.');
        let Some(head) = segments.next() else {
            return Value::Nil;
        };
        let Some(mut current) = self.get(head) else {
            return Value::Nil;
        };
        for segment in segments {
            current = match current {
                Value::Map(mut map) => map.swap_remove(segment).unwrap_or_default(),
                Value::List(mut list) => match segment.parse::<usize>() {
                    Ok(i) if i < list.len() => list.swap_remove(i),
                    _ => Value::Nil,
                },
                _ => Value::Nil,
            };
        }
        current
    }

    /// Returns `true` if both handles refer to the same scope.
    pub fn same(&self, other: &Scope) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("locals", &self.local_names())
            .field("frame", &self.inner.frame)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ArenaPool;

    #[test]
    fn test_lookup_walks_parents() {
        let root = Scope::new();
        root.set("a", Value::Int(1));
        let child = root.child();
        child.set("b", Value::Int(2));

        assert_eq!(child.get("a"), Some(Value::Int(1)));
        assert_eq!(child.get("b"), Some(Value::Int(2)));
        assert_eq!(root.get("b"), None);
    }

    #[test]
    fn test_assign_updates_nearest_binding() {
        let root = Scope::new();
        root.set("total", Value::Int(0));
        let loop_body = root.child();
        loop_body.assign("total", Value::Int(5));
        loop_body.assign("fresh", Value::Int(1));

        assert_eq!(root.get("total"), Some(Value::Int(5)));
        assert_eq!(root.get("fresh"), None);
        assert_eq!(loop_body.get_local("fresh"), Some(Value::Int(1)));
    }

    #[test]
    fn test_assign_stops_at_frame_boundary() {
        let registration = Scope::new();
        registration.set("counter", Value::Int(1));
        let request = registration.frame_child();
        request.assign("counter", Value::Int(2));

        assert_eq!(registration.get("counter"), Some(Value::Int(1)));
        assert_eq!(request.get("counter"), Some(Value::Int(2)));
    }

    #[test]
    fn test_reserved_names_bind_locally_and_are_hidden() {
        let root = Scope::new();
        root.set(QUERY_STATE_KEY, Value::Int(1));
        let child = root.child();
        child.assign(QUERY_STATE_KEY, Value::Int(2));

        assert_eq!(root.get_local(QUERY_STATE_KEY), Some(Value::Int(1)));
        assert_eq!(child.get(QUERY_STATE_KEY), Some(Value::Int(2)));
        assert!(!child.snapshot().contains_key(QUERY_STATE_KEY));
    }

    #[test]
    fn test_snapshot_shadows_parents() {
        let root = Scope::new();
        root.set("x", Value::Int(1));
        root.set("y", Value::Int(1));
        let child = root.child();
        child.set("x", Value::Int(2));

        let snap = child.snapshot();
        assert_eq!(snap["x"], Value::Int(2));
        assert_eq!(snap["y"], Value::Int(1));
    }

    #[test]
    fn test_resolve_path() {
        let scope = Scope::new();
        let user = Value::from_json(serde_json::json!({
            "email": "a@b.c",
            "tags": ["x", "y"],
            "address": {"city": "Oslo"}
        }));
        scope.set("user", user);

        assert_eq!(scope.resolve_path("user.email"), Value::from("a@b.c"));
        assert_eq!(scope.resolve_path("user.tags.1"), Value::from("y"));
        assert_eq!(scope.resolve_path("user.address.city"), Value::from("Oslo"));
        assert_eq!(scope.resolve_path("user.tags.9"), Value::Nil);
        assert_eq!(scope.resolve_path("user.email.length"), Value::Nil);
        assert_eq!(scope.resolve_path("missing.anything"), Value::Nil);
    }

    #[test]
    fn test_frame_lookup() {
        let root = Scope::new();
        let frame = root.child().frame_child();
        let inner = frame.child().child();
        assert!(inner.frame().same(&frame));
        assert!(root.child().frame().same(&root));
    }

    #[test]
    fn test_arena_scopes_recycle_maps() {
        let pool = ArenaPool::new();
        let guard = pool.acquire();
        {
            let request = Scope::new().frame_child_in(guard.arena());
            request.set("x", Value::Int(1));
        }
        assert_eq!(guard.arena().retained(), 1);
        drop(guard);
        assert_eq!(pool.stats().in_use, 0);
    }
}
