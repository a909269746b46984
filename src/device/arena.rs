/*
 *  device/arena.rs
 *
 *  ledwire - pixels on the wire
 *  (c) 2020-26 Stuart Hunter
 *
 *  Ownership record for raw hardware handles
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::device::error::ArenaError;

/// Stable identifier of a handle held by a [`HandleArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(u64);

impl HandleId {
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// Handles opened by the manager, indexed by [`HandleId`].
///
/// A handle lives until the arena closes it. Shared handles (SPI bridges) are
/// leased out as `Arc` clones, and `close` refuses while any lease is alive.
/// Exclusive handles (USB devices) are moved out with `take`.
pub struct HandleArena<T: ?Sized> {
    handles: BTreeMap<HandleId, Arc<Mutex<T>>>,
    next: u64,
}

impl<T: ?Sized> HandleArena<T> {
    pub fn new() -> Self {
        Self { handles: BTreeMap::new(), next: 1 }
    }

    /// Record an already-wrapped handle; unsized handles come in this way
    pub fn insert_shared(&mut self, handle: Arc<Mutex<T>>) -> HandleId {
        let id = HandleId(self.next);
        self.next += 1;
        self.handles.insert(id, handle);
        debug!("arena: recorded {}", id);
        id
    }

    /// Lease a shared handle
    pub fn get(&self, id: HandleId) -> Result<Arc<Mutex<T>>, ArenaError> {
        self.handles.get(&id).cloned().ok_or(ArenaError::UnknownHandle(id.0))
    }

    /// Leases currently outstanding, not counting the arena's own reference
    pub fn users(&self, id: HandleId) -> Result<usize, ArenaError> {
        self.handles
            .get(&id)
            .map(|h| Arc::strong_count(h) - 1)
            .ok_or(ArenaError::UnknownHandle(id.0))
    }

    /// Forget a handle no device is using any more
    pub fn close(&mut self, id: HandleId) -> Result<(), ArenaError> {
        let users = self.users(id)?;
        if users > 0 {
            return Err(ArenaError::InUse { id: id.0, users });
        }
        self.handles.remove(&id);
        debug!("arena: closed {}", id);
        Ok(())
    }

    pub fn ids(&self) -> Vec<HandleId> {
        self.handles.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<T> HandleArena<T> {
    pub fn insert(&mut self, handle: T) -> HandleId {
        self.insert_shared(Arc::new(Mutex::new(handle)))
    }

    /// Move an exclusive handle out to its single owner
    pub fn take(&mut self, id: HandleId) -> Result<T, ArenaError> {
        let users = self.users(id)?;
        if users > 0 {
            return Err(ArenaError::InUse { id: id.0, users });
        }
        let handle = self.handles.remove(&id).ok_or(ArenaError::UnknownHandle(id.0))?;
        match Arc::try_unwrap(handle) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)),
            Err(handle) => {
                self.handles.insert(id, handle);
                Err(ArenaError::InUse { id: id.0, users })
            }
        }
    }
}

impl<T: ?Sized> Default for HandleArena<T> {
    fn default() -> Self {
        Self::new()
    }
}
