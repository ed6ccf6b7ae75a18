//! Per-request allocation regions.
//!
//! An [`Arena`] owns recycled variable maps for the scopes of one request,
//! worker job or function frame. Arenas are handed out by an [`ArenaPool`]
//! and come back when the [`ArenaGuard`] drops; returned arenas are reset,
//! not freed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::value::Value;

/// Variable map type owned by scopes.
pub type VarMap = HashMap<String, Value>;

const MAX_RETAINED_MAPS: usize = 64;

/// A reusable region of variable maps.
#[derive(Debug, Default)]
pub struct Arena {
    maps: Mutex<Vec<VarMap>>,
}

impl Arena {
    /// Take an empty map, reusing a recycled allocation when available.
    pub fn take_map(&self) -> VarMap {
        self.maps.lock().pop().unwrap_or_default()
    }

    /// Give a map back for reuse.
    pub fn recycle(&self, mut map: VarMap) {
        map.clear();
        let mut maps = self.maps.lock();
        if maps.len() < MAX_RETAINED_MAPS {
            maps.push(map);
        }
    }

    /// Number of maps ready for reuse.
    pub fn retained(&self) -> usize {
        self.maps.lock().len()
    }

    fn reset(&self) {
        let mut maps = self.maps.lock();
        for map in maps.iter_mut() {
            map.clear();
        }
    }
}

/// Pool usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Arenas waiting in the free list.
    pub available: usize,
    /// Arenas allocated over the pool's lifetime.
    pub created: usize,
    /// Arenas currently checked out.
    pub in_use: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    free: Mutex<Vec<Arc<Arena>>>,
    created: AtomicUsize,
    in_use: AtomicUsize,
}

/// Free list of arenas shared by all requests.
#[derive(Debug, Clone, Default)]
pub struct ArenaPool {
    inner: Arc<PoolInner>,
}

impl ArenaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out an arena; it returns to the pool when the guard drops.
    pub fn acquire(&self) -> ArenaGuard {
        let arena = self.inner.free.lock().pop().unwrap_or_else(|| {
            self.inner.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(Arena::default())
        });
        self.inner.in_use.fetch_add(1, Ordering::AcqRel);
        ArenaGuard {
            arena: Some(arena),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.inner.free.lock().len(),
            created: self.inner.created.load(Ordering::Relaxed),
            in_use: self.inner.in_use.load(Ordering::Acquire),
        }
    }
}

/// A checked-out arena.
#[derive(Debug)]
pub struct ArenaGuard {
    arena: Option<Arc<Arena>>,
    pool: Arc<PoolInner>,
}

impl ArenaGuard {
    pub fn arena(&self) -> &Arc<Arena> {
        // Only `Drop` takes the arena out.
        self.arena.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for ArenaGuard {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.take() {
            arena.reset();
            self.pool.free.lock().push(arena);
            self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
