//! Arena-based storage with typed handles.
//!
//! Slots can be removed during graph rewrites. A removed slot is left as a
//! tombstone so that every other handle stays valid; handles are never reused.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A typed handle into an [`Arena`].
///
/// Handles are lightweight identifiers (u32 index) that provide
/// type-safe access to arena-allocated values.
pub struct Handle<T> {
    index: u32,
    _phantom: PhantomData<T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.index)
    }
}

impl<T> Handle<T> {
    /// Creates a new handle from a zero-based index.
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            _phantom: PhantomData,
        }
    }

    /// Returns the zero-based index of this handle.
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// An arena with typed [`Handle`]-based access and tombstoned removal.
#[derive(Clone, Debug)]
pub struct Arena<T> {
    data: Vec<Option<T>>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            live: 0,
        }
    }

    /// Returns the number of live elements in the arena.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Returns `true` if the arena contains no live elements.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Returns the number of slots ever allocated, removed ones included.
    pub fn capacity_used(&self) -> usize {
        self.data.len()
    }

    /// Returns the handle that will be assigned to the next appended value.
    pub fn next_handle(&self) -> Handle<T> {
        let index = u32::try_from(self.data.len()).unwrap_or_else(|_| {
            panic!("arena overflow: {} items exceeds u32::MAX", self.data.len())
        });
        Handle::new(index)
    }

    /// Appends a value and returns its handle.
    pub fn append(&mut self, value: T) -> Handle<T> {
        let handle = self.next_handle();
        self.data.push(Some(value));
        self.live += 1;
        handle
    }

    /// Removes the value behind `handle`, leaving a tombstone.
    ///
    /// Returns `None` if the slot was already removed or never existed.
    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let removed = self.data.get_mut(handle.index()).and_then(Option::take);
        if removed.is_some() {
            self.live -= 1;
        }
        removed
    }

    /// Returns `true` if `handle` refers to a live slot.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.try_get(handle).is_some()
    }

    /// Returns a reference to the value if the handle is live.
    pub fn try_get(&self, handle: Handle<T>) -> Option<&T> {
        self.data.get(handle.index()).and_then(Option::as_ref)
    }

    /// Returns a mutable reference to the value if the handle is live.
    pub fn try_get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        self.data.get_mut(handle.index()).and_then(Option::as_mut)
    }

    /// Iterates over live `(handle, &value)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        // Safety: arena size bounded by u32::MAX (enforced in append)
        self.data
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (Handle::new(i as u32), v)))
    }

    /// Iterates over live `(handle, &mut value)` pairs in allocation order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        // Safety: arena size bounded by u32::MAX (enforced in append)
        self.data
            .iter_mut()
            .enumerate()
            .filter_map(|(i, v)| v.as_mut().map(|v| (Handle::new(i as u32), v)))
    }

    /// Returns the handles of all live slots in allocation order.
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.iter().map(|(h, _)| h).collect()
    }
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.data.get(handle.index()) {
            Some(Some(value)) => value,
            Some(None) => panic!("use of removed arena slot {handle:?}"),
            None => panic!(
                "handle {handle:?} out of bounds (arena size: {})",
                self.data.len()
            ),
        }
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        let size = self.data.len();
        match self.data.get_mut(handle.index()) {
            Some(Some(value)) => value,
            Some(None) => panic!("use of removed arena slot {handle:?}"),
            None => panic!("handle {handle:?} out of bounds (arena size: {size})"),
        }
    }
}
