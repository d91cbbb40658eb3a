//! Scope-bound cache slots.
//!
//! A `CacheArena<T>` holds one `CacheSlot<T>` per live scope instance of a
//! single kind. The arena is the sole owner of every cache value; streams
//! receive `CacheHandle`s that can only be created while the slot is in its
//! access window. Destroying a slot whose value is still referenced by a
//! handle is reported as a leak.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, RwLock};

use crate::error::{ContractViolation, Result};
use crate::scope::{ScopeId, ScopeInstance, ScopeKind, ScopeState};

/// Who is asking for a cache handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Per-stream work and stream transitions; requires Begun
    Stream,
    /// Global hooks on the scheduler; Begun or AllStreamsEnded
    Global,
}

/// Read-only, non-owning view of a cache value
pub struct CacheHandle<T> {
    value: Arc<T>,
}

impl<T> CacheHandle<T> {
    pub(crate) fn new(value: Arc<T>) -> Self {
        Self { value }
    }
}

impl<T> Deref for CacheHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CacheHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheHandle").field(&*self.value).finish()
    }
}

/// Holder of one cache instance attached to one scope instance
pub struct CacheSlot<T> {
    scope: ScopeInstance,
    state: ScopeState,
    value: Option<Arc<T>>,
}

impl<T> CacheSlot<T> {
    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn scope(&self) -> &ScopeInstance {
        &self.scope
    }
}

/// All cache slots of one scope kind for one module
pub struct CacheArena<T> {
    kind: ScopeKind,
    slots: RwLock<HashMap<ScopeId, CacheSlot<T>>>,
}

impl<T> CacheArena<T> {
    pub fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Attach the value produced by the begin hook. Creating a second cache
    /// for the same scope is a double begin.
    pub fn create(&self, scope: &ScopeInstance, value: T) -> Result<()> {
        if scope.kind != self.kind {
            return Err(ContractViolation::ordering(format!(
                "{} cache created for a {} scope",
                self.kind, scope.kind
            ))
            .in_scope(scope)
            .into());
        }
        let mut slots = self.write()?;
        if slots.contains_key(&scope.id) {
            return Err(ContractViolation::ordering("cache begin hook invoked twice")
                .in_scope(scope)
                .into());
        }
        slots.insert(
            scope.id,
            CacheSlot {
                scope: scope.clone(),
                state: ScopeState::Begun,
                value: Some(Arc::new(value)),
            },
        );
        Ok(())
    }

    /// Borrow the cache of `id`; fails outside the access window
    pub fn handle(&self, id: ScopeId, access: Access) -> Result<CacheHandle<T>> {
        let slots = self.read()?;
        let slot = slots.get(&id).ok_or_else(|| {
            ContractViolation::ordering(format!("{} cache accessed before its begin hook completed", self.kind))
        })?;
        let allowed = match access {
            Access::Stream => slot.state == ScopeState::Begun,
            Access::Global => matches!(slot.state, ScopeState::Begun | ScopeState::AllStreamsEnded),
        };
        match (&slot.value, allowed) {
            (Some(value), true) => Ok(CacheHandle::new(Arc::clone(value))),
            _ => Err(ContractViolation::ordering(format!(
                "{} cache accessed in state {:?}",
                self.kind, slot.state
            ))
            .in_scope(&slot.scope)
            .into()),
        }
    }

    /// Begun → AllStreamsEnded: stream access is closed from here on
    pub fn close_streams(&self, id: ScopeId) -> Result<()> {
        self.advance(id, ScopeState::Begun, ScopeState::AllStreamsEnded)
    }

    /// AllStreamsEnded → Ended: the end hook has run
    pub fn mark_ended(&self, id: ScopeId) -> Result<()> {
        self.advance(id, ScopeState::AllStreamsEnded, ScopeState::Ended)
    }

    /// Ended → Destroyed: release the value and hand it back.
    /// A value still referenced elsewhere is a leak.
    pub fn destroy(&self, id: ScopeId) -> Result<T> {
        let mut slots = self.write()?;
        let slot = slots
            .remove(&id)
            .ok_or_else(|| ContractViolation::ordering(format!("{} cache destroyed twice", self.kind)))?;
        if slot.state != ScopeState::Ended {
            let scope = slot.scope.clone();
            let state = slot.state;
            slots.insert(id, slot);
            return Err(ContractViolation::ordering(format!("cache destroyed in state {:?}", state))
                .in_scope(scope)
                .into());
        }
        let value = slot
            .value
            .ok_or_else(|| ContractViolation::ordering("cache slot has no value").in_scope(&slot.scope))?;
        Arc::try_unwrap(value).map_err(|shared| {
            ContractViolation::leak(format!(
                "{} cache still referenced by {} handle(s) at destruction",
                self.kind,
                Arc::strong_count(&shared) - 1
            ))
            .in_scope(&slot.scope)
            .into()
        })
    }

    pub fn state(&self, id: ScopeId) -> Option<ScopeState> {
        self.slots.read().ok()?.get(&id).map(|s| s.state)
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.slots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn advance(&self, id: ScopeId, from: ScopeState, to: ScopeState) -> Result<()> {
        let mut slots = self.write()?;
        let slot = slots
            .get_mut(&id)
            .ok_or_else(|| ContractViolation::ordering(format!("{} cache missing for transition", self.kind)))?;
        if slot.state != from {
            return Err(ContractViolation::ordering(format!(
                "cache transition to {:?} attempted from {:?}",
                to, slot.state
            ))
            .in_scope(&slot.scope)
            .into());
        }
        slot.state = to;
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<ScopeId, CacheSlot<T>>>> {
        self.slots
            .read()
            .map_err(|_| ContractViolation::ordering(format!("{} cache arena poisoned", self.kind)).into())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<ScopeId, CacheSlot<T>>>> {
        self.slots
            .write()
            .map_err(|_| ContractViolation::ordering(format!("{} cache arena poisoned", self.kind)).into())
    }
}
