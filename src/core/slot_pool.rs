//! Generation-checked storage addressed by [`Handle`]s.

use failure::Fail;
use log::{error, warn};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Non-owning reference to a value living in a [`SlotPool`].
///
/// A handle is a slot index plus the generation the slot had when the value was stored. Clearing a slot bumps its
/// generation, so any handle captured before the clear stops resolving instead of silently aliasing whatever gets
/// stored in that slot next.
///
/// Generation 0 is never handed out for a live value; a handle with generation 0 is the null handle.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Handle {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// The handle which never resolves to anything.
    pub fn null() -> Self {
        Self::new(0, 0)
    }

    /// Whether this is the null handle.
    pub fn is_null(&self) -> bool {
        self.generation == 0
    }

    /// Slot index this handle points at.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation this handle was issued with.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

// Manual impls so that handles are Copy and comparable no matter what T is.
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

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Failure type for handle lookups.
#[derive(Fail, Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandleError {
    /// The null handle was used.
    #[fail(display = "Null handle.")]
    Null,

    /// The handle's generation doesn't match its slot, or its index is out of range.
    #[fail(display = "Stale or invalid handle (index {}, generation {}).", index, generation)]
    Stale {
        /// Index of the offending handle.
        index: u32,
        /// Generation of the offending handle.
        generation: u32,
    },
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity, optionally growable, handle-indexed storage.
///
/// Allocation, lookup and release are all O(1). Growth only ever appends slots, so an index never changes meaning
/// while its value is alive.
///
/// This pool must be externally synchronized
#[derive(Debug)]
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,

    /// Free slot indices. Popped from the back, so lower indices are reused first.
    free_list: Vec<u32>,

    growable: bool,
    len: usize,
}

impl<T> SlotPool<T> {
    /// Creates a pool with `capacity` slots which refuses to grow once they're all in use.
    pub fn new(capacity: usize) -> Self {
        let mut pool = SlotPool {
            slots: Vec::with_capacity(capacity),
            free_list: Vec::with_capacity(capacity),
            growable: false,
            len: 0,
        };
        pool.append_slots(capacity);

        pool
    }

    /// Creates a pool with `capacity` initial slots which doubles its capacity whenever it runs out.
    pub fn growable(capacity: usize) -> Self {
        let mut pool = Self::new(capacity.max(1));
        pool.growable = true;

        pool
    }

    fn append_slots(&mut self, count: usize) {
        let start = self.slots.len();
        let end = start + count;
        self.slots.extend((start..end).map(|_| Slot {
            generation: 1,
            value: None,
        }));
        // Reversed so that the lowest new index sits at the back of the free list.
        self.free_list.splice(0..0, (start..end).rev().map(|index| index as u32));
    }

    /// Stores `value` and returns a handle to it.
    ///
    /// When every slot is taken and the pool isn't growable, the value is dropped and the null handle is returned.
    pub fn set(&mut self, value: T) -> Handle<T> {
        if self.free_list.is_empty() {
            if !self.growable {
                warn!("Slot pool exhausted at {} slots", self.slots.len());
                return Handle::null();
            }
            let additional = self.slots.len().max(1);
            self.append_slots(additional);
        }

        match self.free_list.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(value);
                self.len += 1;

                Handle::new(index, slot.generation)
            }
            None => Handle::null(),
        }
    }

    fn slot(&self, handle: Handle<T>) -> Result<&Slot<T>, HandleError> {
        if handle.is_null() {
            return Err(HandleError::Null);
        }
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.value.is_some() => Ok(slot),
            _ => Err(HandleError::Stale {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    /// Looks up the value behind `handle`.
    pub fn try_get(&self, handle: Handle<T>) -> Result<&T, HandleError> {
        self.slot(handle)?;
        match &self.slots[handle.index as usize].value {
            Some(value) => Ok(value),
            None => Err(HandleError::Stale {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    /// Mutable version of [`try_get`](#method.try_get).
    pub fn try_get_mut(&mut self, handle: Handle<T>) -> Result<&mut T, HandleError> {
        self.slot(handle)?;
        match &mut self.slots[handle.index as usize].value {
            Some(value) => Ok(value),
            None => Err(HandleError::Stale {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    /// Looks up the value behind `handle`, treating a stale handle as fatal.
    ///
    /// # Panics
    ///
    /// Panics if the handle is null or stale. Use [`try_get`](#method.try_get) where that is a recoverable condition.
    pub fn get(&self, handle: Handle<T>) -> &T {
        match self.try_get(handle) {
            Ok(value) => value,
            Err(err) => panic!("Slot pool lookup through {:?} failed: {}", handle, err),
        }
    }

    /// Removes the value behind `handle` and invalidates every outstanding copy of the handle.
    ///
    /// Clearing an already-cleared handle fails without touching the free list.
    pub fn clear(&mut self, handle: Handle<T>) -> Result<T, HandleError> {
        if let Err(err) = self.slot(handle) {
            error!("Refusing to clear {:?}: {}", handle, err);
            return Err(err);
        }

        let slot = &mut self.slots[handle.index as usize];
        let value = slot.value.take().ok_or(HandleError::Stale {
            index: handle.index,
            generation: handle.generation,
        })?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            generation => generation,
        };
        self.free_list.push(handle.index);
        self.len -= 1;

        Ok(value)
    }

    /// Whether `handle` currently resolves to a value.
    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_ok()
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no live values.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterates over all live values in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    /// Removes every live value, invalidating all of their handles.
    pub fn drain(&mut self) -> Vec<T> {
        let handles: Vec<_> = self.iter().map(|(handle, _)| handle).collect();
        handles.into_iter().filter_map(|handle| self.clear(handle).ok()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    #[test]
    fn handle_round_trip() {
        let mut pool = SlotPool::new(4);
        let a = pool.set("a");
        let b = pool.set("b");

        assert_eq!(*pool.get(a), "a");
        assert_eq!(pool.try_get(b), Ok(&"b"));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn cleared_handle_goes_stale() {
        let mut pool = SlotPool::new(2);
        let a = pool.set(10);
        assert_eq!(pool.clear(a), Ok(10));

        assert_matches!(pool.try_get(a), Err(HandleError::Stale { .. }));
        assert!(!pool.contains(a));

        // The slot is reused, but the old handle must not see the new value.
        let b = pool.set(20);
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert_matches!(pool.try_get(a), Err(HandleError::Stale { .. }));
        assert_eq!(pool.try_get(b), Ok(&20));
    }

    #[test]
    fn double_clear_fails_cleanly() {
        let mut pool = SlotPool::new(2);
        let a = pool.set(1);
        pool.clear(a).unwrap();
        assert_matches!(pool.clear(a), Err(HandleError::Stale { .. }));

        // Free list wasn't corrupted: both slots are usable exactly once more.
        let x = pool.set(2);
        let y = pool.set(3);
        assert!(!x.is_null());
        assert!(!y.is_null());
        assert_ne!(x.index(), y.index());
        assert!(pool.set(4).is_null());
    }

    #[test]
    fn exhausted_fixed_pool_returns_null() {
        let mut pool = SlotPool::new(1);
        assert!(!pool.set(1).is_null());

        let handle = pool.set(2);
        assert!(handle.is_null());
        assert_eq!(pool.try_get(handle), Err(HandleError::Null));
    }

    #[test]
    fn growth_keeps_indices_stable() {
        let mut pool = SlotPool::growable(2);
        let handles: Vec<_> = (0..9).map(|i| pool.set(i)).collect();

        assert!(pool.capacity() >= 9);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.index(), i as u32);
            assert_eq!(*pool.get(*handle), i);
        }
    }

    #[test]
    fn iter_skips_free_slots() {
        let mut pool = SlotPool::new(4);
        let a = pool.set('a');
        let b = pool.set('b');
        let c = pool.set('c');
        pool.clear(b).unwrap();

        let live: Vec<_> = pool.iter().map(|(handle, value)| (handle, *value)).collect();
        assert_eq!(live, vec![(a, 'a'), (c, 'c')]);
    }

    #[test]
    #[should_panic]
    fn fatal_get_on_stale_handle() {
        let mut pool = SlotPool::new(1);
        let a = pool.set(());
        pool.clear(a).unwrap();
        pool.get(a);
    }
}
