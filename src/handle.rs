//! Generation-checked handles and the slot arena behind every registry.
//!
//! A [`Handle`] is an index plus the generation of the slot at the time the
//! object was created. Destroying an object bumps the slot generation, so a
//! stale handle is rejected in O(1) instead of silently aliasing whatever
//! object reused the slot.
//!
//! Registries are created and mutated collectively: every process performs
//! the same sequence of inserts and removals, so the same logical object has
//! the same handle on every process.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::ga_error::GaError;

/// Opaque, typed reference to a live registry slot.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the handle was issued.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into a single integer, unique for the lifetime of the arena.
    pub fn to_bits(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    /// Inverse of [`Handle::to_bits`].
    pub fn from_bits(bits: u64) -> Self {
        Self::new(bits as u32, (bits >> 32) as u32)
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
        self.to_bits().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl<T> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity arena of slots with an explicit free list.
#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    capacity: usize,
    live: usize,
}

impl<T> SlotArena<T> {
    /// Empty arena that never holds more than `capacity` live objects.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    /// Maximum number of live objects.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `value` in a free slot. Freed slots are reused lowest-first.
    pub fn insert(&mut self, value: T, op: &'static str) -> Result<Handle<T>, GaError> {
        if let Some(pos) = self
            .free
            .iter()
            .enumerate()
            .min_by_key(|(_, idx)| **idx)
            .map(|(pos, _)| pos)
        {
            let index = self.free.swap_remove(pos);
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.live += 1;
            return Ok(Handle::new(index, slot.generation));
        }
        if self.slots.len() >= self.capacity {
            return Err(GaError::NoFreeSlots {
                op,
                capacity: self.capacity,
            });
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.live += 1;
        Ok(Handle::new(index, 0))
    }

    fn slot(&self, h: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(h.index as usize)
            .filter(|s| s.generation == h.generation)
    }

    pub fn contains(&self, h: Handle<T>) -> bool {
        self.get(h).is_some()
    }

    pub fn get(&self, h: Handle<T>) -> Option<&T> {
        self.slot(h).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, h: Handle<T>) -> Option<&mut T> {
        self.slots
            .get_mut(h.index as usize)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Look up `h`, mapping a stale or unknown handle to [`GaError::InvalidHandle`].
    pub fn try_get(&self, h: Handle<T>, op: &'static str) -> Result<&T, GaError> {
        self.get(h).ok_or_else(|| GaError::InvalidHandle {
            op,
            handle: h.to_string(),
        })
    }

    pub fn try_get_mut(&mut self, h: Handle<T>, op: &'static str) -> Result<&mut T, GaError> {
        self.get_mut(h).ok_or_else(|| GaError::InvalidHandle {
            op,
            handle: h.to_string(),
        })
    }

    /// Take the object out and retire the handle.
    pub fn remove(&mut self, h: Handle<T>) -> Option<T> {
        let slot = self
            .slots
            .get_mut(h.index as usize)
            .filter(|s| s.generation == h.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(h.index);
        self.live -= 1;
        Some(value)
    }

    /// Handles of all live objects, in slot order.
    pub fn handles(&self) -> Vec<Handle<T>> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| Handle::new(i as u32, s.generation))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut arena = SlotArena::with_capacity(2);
        let a = arena.insert("a", "test").unwrap();
        assert_eq!(arena.remove(a), Some("a"));
        let b = arena.insert("b", "test").unwrap();
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&"b"));
        assert!(matches!(
            arena.try_get(a, "test"),
            Err(GaError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut arena = SlotArena::with_capacity(1);
        let h = arena.insert(1, "test").unwrap();
        assert!(matches!(
            arena.insert(2, "create"),
            Err(GaError::NoFreeSlots { op: "create", capacity: 1 })
        ));
        arena.remove(h);
        assert!(arena.insert(3, "test").is_ok());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn double_remove_is_none() {
        let mut arena = SlotArena::with_capacity(4);
        let h = arena.insert(7u8, "test").unwrap();
        assert_eq!(arena.remove(h), Some(7));
        assert_eq!(arena.remove(h), None);
        assert!(arena.is_empty());
    }

    #[test]
    fn bits_round_trip() {
        let h: Handle<u8> = Handle::new(17, 3);
        assert_eq!(Handle::<u8>::from_bits(h.to_bits()), h);
    }

    #[test]
    fn same_sequence_gives_same_handles() {
        let run = || {
            let mut arena = SlotArena::with_capacity(8);
            let a = arena.insert(0, "t").unwrap();
            let b = arena.insert(1, "t").unwrap();
            arena.remove(a);
            let c = arena.insert(2, "t").unwrap();
            (b, c)
        };
        assert_eq!(run(), run());
    }
}
