//! Creation-ordered storage for owned GPU objects.

use crate::error::{GpuError, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of an object in a [`CreationArena`].
///
/// Ids are assigned in strictly increasing creation order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Raw creation sequence number.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Objects keyed by creation order.
///
/// Removing an id twice fails with [`GpuError::AlreadyDestroyed`], and
/// [`CreationArena::drain_reverse`] yields survivors newest first.
#[derive(Debug)]
pub struct CreationArena<T> {
    next: u64,
    live: BTreeMap<u64, T>,
}

impl<T> Default for CreationArena<T> {
    fn default() -> Self {
        Self {
            next: 0,
            live: BTreeMap::new(),
        }
    }
}

impl<T> CreationArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` and return its id.
    pub fn insert(&mut self, value: T) -> ResourceId {
        let id = self.next;
        self.next += 1;
        self.live.insert(id, value);
        ResourceId(id)
    }

    pub fn get(&self, id: ResourceId) -> Result<&T> {
        self.live.get(&id.0).ok_or_else(|| missing(self.next, id))
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Result<&mut T> {
        let next = self.next;
        self.live.get_mut(&id.0).ok_or_else(|| missing(next, id))
    }

    /// Take `id` out of the arena.
    ///
    /// # Errors
    /// [`GpuError::AlreadyDestroyed`] if it was removed before.
    pub fn remove(&mut self, id: ResourceId) -> Result<T> {
        self.live.remove(&id.0).ok_or_else(|| missing(self.next, id))
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.live.contains_key(&id.0)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Remove every live object, newest first.
    pub fn drain_reverse(&mut self) -> Vec<(ResourceId, T)> {
        let live = std::mem::take(&mut self.live);
        live.into_iter()
            .rev()
            .map(|(id, value)| (ResourceId(id), value))
            .collect()
    }
}

fn missing(next: u64, id: ResourceId) -> GpuError {
    if id.0 < next {
        GpuError::AlreadyDestroyed(id.0)
    } else {
        GpuError::ResourceNotFound(id.to_string())
    }
}
