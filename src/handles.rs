// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed handle tables for driver objects.
//!
//! Every object kind the public API hands out (surfaces, decoders, mixers,
//! presentation queues, queue targets) lives in one of these arenas, indexed
//! by a small integer handle with a free list for reuse. All tables of a
//! device are mutated under a single registry lock; the table itself is plain
//! data.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::Result;
use crate::error::VdpError;

/// Upper bound on simultaneously live objects of one kind.
const MAX_HANDLES: usize = 4096;

/// A small-integer handle naming an object of type `T`.
pub struct Handle<T> {
    index: u32,
    _kind: PhantomData<fn() -> T>,
}

// Derived impls would bound on `T`, which is not required here.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for Handle<T> {}

/// An arena of shared objects with free-list slot reuse.
pub struct HandleTable<T> {
    slots: Vec<Option<Arc<T>>>,
    free: Vec<u32>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        HandleTable {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> HandleTable<T> {
    /// Stores `object` and returns its handle, or `Resources` if the table is
    /// full.
    pub fn insert(&mut self, object: Arc<T>) -> Result<Handle<T>> {
        let index = match self.free.pop() {
            Some(index) => {
                debug_assert!(self.slots[index as usize].is_none(), "free slot occupied");
                self.slots[index as usize] = Some(object);
                index
            }
            None => {
                if self.slots.len() >= MAX_HANDLES {
                    return Err(VdpError::Resources);
                }
                self.slots.push(Some(object));
                (self.slots.len() - 1) as u32
            }
        };
        Ok(Handle {
            index,
            _kind: PhantomData,
        })
    }

    pub fn get(&self, handle: Handle<T>) -> Result<Arc<T>> {
        self.slots
            .get(handle.index as usize)
            .and_then(|slot| slot.clone())
            .ok_or(VdpError::InvalidHandle)
    }

    /// Frees the slot and returns the object that occupied it. The caller is
    /// responsible for running any teardown once the last reference drops.
    pub fn remove(&mut self, handle: Handle<T>) -> Result<Arc<T>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(VdpError::InvalidHandle)?;
        let object = slot.take().ok_or(VdpError::InvalidHandle)?;
        self.free.push(handle.index);
        Ok(object)
    }

    /// Iterates over live objects.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut table = HandleTable::default();
        let h = table.insert(Arc::new(42u32)).unwrap();
        assert_eq!(*table.get(h).unwrap(), 42);
        assert_eq!(*table.remove(h).unwrap(), 42);
        assert!(matches!(table.get(h), Err(VdpError::InvalidHandle)));
        assert!(matches!(table.remove(h), Err(VdpError::InvalidHandle)));
    }

    #[test]
    fn slots_are_reused() {
        let mut table = HandleTable::default();
        let a = table.insert(Arc::new(1u32)).unwrap();
        table.remove(a).unwrap();
        let b = table.insert(Arc::new(2u32)).unwrap();
        assert_eq!(a, b);
        assert_eq!(*table.get(b).unwrap(), 2);
    }
}
