//! Reference-counted generational arena.
//!
//! Leases, associations and pools all live in one of these. A [`Handle`] is
//! a copyable (index, generation) pair; it stays valid until the entry's
//! reference count drops to zero, after which every copy of it is stale and
//! any use is rejected with [`LeaseError::InvalidArgument`].
//!
//! `allocate` always yields a fresh handle with one reference, so the
//! "output slot must be empty" contract cannot be violated. `reference` and
//! `dereference` are the only ways to move the count.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use tracing::error;

use crate::error::{LeaseError, LeaseResult};

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self { index, generation, _marker: PhantomData }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Entry<T> {
    refcnt: u32,
    value: T,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    kind: &'static str,
}

impl<T> Arena<T> {
    /// `kind` only shows up in contract-violation logs.
    pub fn new(kind: &'static str) -> Self {
        Self { slots: Vec::new(), free: Vec::new(), len: 0, kind }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` and hand back its first reference.
    pub fn allocate(&mut self, value: T) -> LeaseResult<Handle<T>> {
        let entry = Some(Entry { refcnt: 1, value });
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = entry;
            return Ok(Handle::new(index, slot.generation));
        }

        if self.slots.len() >= u32::MAX as usize {
            self.len -= 1;
            return Err(LeaseError::OutOfMemory);
        }
        if let Err(e) = self.slots.try_reserve(1) {
            self.len -= 1;
            return Err(e.into());
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, entry });
        Ok(Handle::new(index, 0))
    }

    /// Take one more reference on `src`.
    pub fn reference(&mut self, src: Handle<T>) -> LeaseResult<Handle<T>> {
        match self.entry_mut(src) {
            Some(entry) => {
                entry.refcnt += 1;
                Ok(src)
            }
            None => {
                error!("{} reference: stale handle {:?}", self.kind, src);
                Err(LeaseError::InvalidArgument("stale handle"))
            }
        }
    }

    /// Drop one reference. When the last one goes, the value is removed and
    /// returned so the caller can release whatever it owned.
    pub fn dereference(&mut self, handle: Handle<T>) -> LeaseResult<Option<T>> {
        let kind = self.kind;
        let Some(slot) = self.live_slot_mut(handle) else {
            // Either released twice or never ours: the count would go
            // negative. Report it and leave the arena untouched.
            error!("{} dereference: negative refcnt on {:?}", kind, handle);
            return Err(LeaseError::InvalidArgument("stale handle"));
        };

        let entry = slot.entry.as_mut().ok_or(LeaseError::InvalidArgument("stale handle"))?;
        entry.refcnt = entry.refcnt.saturating_sub(1);
        if entry.refcnt > 0 {
            return Ok(None);
        }

        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Ok(entry.map(|e| e.value))
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Current reference count, zero for stale handles.
    pub fn refcount(&self, handle: Handle<T>) -> u32 {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_ref())
            .map(|e| e.refcnt)
            .unwrap_or(0)
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.entry.as_ref())
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.entry_mut(handle).map(|e| &mut e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry
                .as_ref()
                .map(|e| (Handle::new(i as u32, slot.generation), &e.value))
        })
    }

    fn live_slot_mut(&mut self, handle: Handle<T>) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.entry.is_some())
    }

    fn entry_mut(&mut self, handle: Handle<T>) -> Option<&mut Entry<T>> {
        self.live_slot_mut(handle).and_then(|s| s.entry.as_mut())
    }
}
