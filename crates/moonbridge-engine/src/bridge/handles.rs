//! Handle Registry
//!
//! Tracks every handle that crosses the boundary so it can be released in
//! bulk on unload:
//!
//! - host objects visible from the VM live in a generational arena; the VM
//!   holds a [`Handle`] (packed into the userdata payload) and the arena holds
//!   the strong reference that keeps the object alive;
//! - VM reference slots owned by host-side reference objects are recorded
//!   under a [`TrackId`] so the sweep can free the ones nobody released.

use crate::error::{BridgeError, BridgeResult};
use crate::host::HostObject;
use crate::vm::{LuaApi, RefId};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Generational index of a host object in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Pack into a userdata payload
    pub fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack from a userdata payload
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }

    /// Arena slot
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation the handle was issued for
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Identifier of a tracked VM reference slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackId(u64);

impl TrackId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TrackId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-instance call state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// No instance method of the object is running
    Idle,
    /// An instance method is running; the reference points at the proxy
    BackReferenceSet(RefId),
}

/// Counts reported by [`HandleRegistry::sweep`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Host handles invalidated
    pub handles: usize,
    /// VM reference slots freed
    pub references: usize,
}

struct Entry {
    object: HostObject,
    /// Back-references of active calls, innermost last
    back_refs: Vec<RefId>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Arena {
    fn entry(&self, handle: Handle) -> Option<&Entry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: Handle) -> Option<&mut Entry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}

/// Registry of cross-boundary handles
#[derive(Default)]
pub struct HandleRegistry {
    arena: Mutex<Arena>,
    references: Mutex<FxHashMap<TrackId, RefId>>,
}

impl HandleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Host objects
    // ========================================================================

    /// Store a host object and issue a handle for it
    pub fn insert(&self, object: HostObject) -> Handle {
        let mut arena = self.arena.lock();
        let entry = Entry {
            object,
            back_refs: Vec::new(),
        };
        arena.live += 1;
        if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.entry = Some(entry);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        let index = arena.slots.len() as u32;
        arena.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    /// Object behind `handle`
    pub fn get(&self, handle: Handle) -> BridgeResult<HostObject> {
        self.arena
            .lock()
            .entry(handle)
            .map(|entry| entry.object.clone())
            .ok_or_else(|| BridgeError::InvalidHandle(handle.to_string()))
    }

    /// Whether `handle` is live
    pub fn contains(&self, handle: Handle) -> bool {
        self.arena.lock().entry(handle).is_some()
    }

    /// Release `handle`, dropping the arena's reference to the object.
    /// Returns false if it was not live.
    pub fn release(&self, handle: Handle) -> bool {
        let mut arena = self.arena.lock();
        let Some(slot) = arena.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation || slot.entry.is_none() {
            return false;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(handle.index);
        arena.live -= 1;
        true
    }

    /// Number of live host handles
    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    /// Check if no host handle is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Back-references
    // ========================================================================

    /// Record that an instance method of `handle` started, with `back_ref`
    /// pointing at the proxy the call came through
    pub fn enter_call(&self, handle: Handle, back_ref: RefId) -> BridgeResult<HostObject> {
        let mut arena = self.arena.lock();
        let entry = arena
            .entry_mut(handle)
            .ok_or_else(|| BridgeError::InvalidHandle(handle.to_string()))?;
        entry.back_refs.push(back_ref);
        Ok(entry.object.clone())
    }

    /// Record that the innermost call on `handle` finished
    pub fn exit_call(&self, handle: Handle) -> Option<RefId> {
        self.arena
            .lock()
            .entry_mut(handle)
            .and_then(|entry| entry.back_refs.pop())
    }

    /// Current call state of `handle`
    pub fn call_state(&self, handle: Handle) -> CallState {
        self.arena
            .lock()
            .entry(handle)
            .and_then(|entry| entry.back_refs.last().copied())
            .map(CallState::BackReferenceSet)
            .unwrap_or(CallState::Idle)
    }

    // ========================================================================
    // Reference slots
    // ========================================================================

    /// Record a VM reference slot owned by a host-side reference object
    pub fn track(&self, reference: RefId) -> TrackId {
        let id = TrackId::next();
        self.references.lock().insert(id, reference);
        id
    }

    /// Stop tracking; returns the slot if it was still tracked
    pub fn untrack(&self, id: TrackId) -> Option<RefId> {
        self.references.lock().remove(&id)
    }

    /// Stop tracking `reference` and free its slot. Does nothing and returns
    /// false when the slot is not tracked.
    pub fn release_reference(&self, vm: &mut dyn LuaApi, reference: RefId) -> bool {
        let tracked = {
            let mut references = self.references.lock();
            let id = references
                .iter()
                .find(|(_, r)| **r == reference)
                .map(|(id, _)| *id);
            id.and_then(|id| references.remove(&id))
        };
        tracked.map_or(false, |r| vm.reference_free(r))
    }

    /// Whether `id` is still tracked
    pub fn is_tracked(&self, id: TrackId) -> bool {
        self.references.lock().contains_key(&id)
    }

    /// Number of tracked reference slots
    pub fn tracked_references(&self) -> usize {
        self.references.lock().len()
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Free every tracked reference slot and invalidate every host handle
    pub fn sweep(&self, vm: &mut dyn LuaApi) -> SweepStats {
        let references: Vec<RefId> = self.references.lock().drain().map(|(_, r)| r).collect();
        let freed = references
            .into_iter()
            .filter(|&r| vm.reference_free(r))
            .count();

        let mut arena = self.arena.lock();
        let mut handles = 0;
        let mut free = Vec::new();
        for (index, slot) in arena.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                handles += 1;
                free.push(index as u32);
            }
            slot.generation = slot.generation.wrapping_add(1);
        }
        arena.free.extend(free);
        arena.live = 0;

        tracing::debug!(handles, references = freed, "handle registry swept");
        SweepStats {
            handles,
            references: freed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::State;

    #[test]
    fn test_handle_bits() {
        let handle = Handle {
            index: 7,
            generation: 3,
        };
        assert_eq!(Handle::from_bits(handle.to_bits()), handle);
    }

    #[test]
    fn test_release_invalidates() {
        let registry = HandleRegistry::new();
        let handle = registry.insert(HostObject::new(1u32));
        assert!(registry.contains(handle));
        assert_eq!(registry.len(), 1);

        assert!(registry.release(handle));
        assert!(!registry.release(handle));
        assert!(matches!(
            registry.get(handle),
            Err(BridgeError::InvalidHandle(_))
        ));

        // Slot is reused with a new generation
        let reused = registry.insert(HostObject::new(2u32));
        assert_eq!(reused.index(), handle.index());
        assert_ne!(reused.generation(), handle.generation());
        assert!(registry.get(handle).is_err());
    }

    #[test]
    fn test_back_reference_stack() {
        let registry = HandleRegistry::new();
        let handle = registry.insert(HostObject::new("obj"));
        assert_eq!(registry.call_state(handle), CallState::Idle);

        let outer = RefId::from_raw(1);
        let inner = RefId::from_raw(2);
        registry.enter_call(handle, outer).unwrap();
        registry.enter_call(handle, inner).unwrap();
        assert_eq!(registry.call_state(handle), CallState::BackReferenceSet(inner));

        assert_eq!(registry.exit_call(handle), Some(inner));
        assert_eq!(registry.call_state(handle), CallState::BackReferenceSet(outer));
        assert_eq!(registry.exit_call(handle), Some(outer));
        assert_eq!(registry.call_state(handle), CallState::Idle);
    }

    #[test]
    fn test_sweep_frees_everything() {
        let mut vm = State::new();
        let registry = HandleRegistry::new();

        let h1 = registry.insert(HostObject::new(1u8));
        let h2 = registry.insert(HostObject::new(2u8));
        vm.push_string("kept");
        let r = vm.reference_create().unwrap();
        let track = registry.track(r);

        let stats = registry.sweep(&mut vm);
        assert_eq!(
            stats,
            SweepStats {
                handles: 2,
                references: 1
            }
        );
        assert!(registry.get(h1).is_err());
        assert!(registry.get(h2).is_err());
        assert!(!registry.is_tracked(track));
        assert_eq!(vm.live_references(), 0);
        assert!(registry.is_empty());
    }
}
