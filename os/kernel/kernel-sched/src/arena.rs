//! Index-stable generational arena backing the thread and process tables.
//!
//! Slots are reused after removal, and every reuse bumps the slot's
//! generation, so a stale [`Handle`] can never reach the slot's new
//! occupant. Run-queue links refer to live slots by raw index and skip the
//! generation check.

use alloc::vec::Vec;
use core::fmt;

/// Slot index paired with the generation it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Packs the handle into a single word, e.g. for storage in an atomic.
    ///
    /// The all-ones word is never produced: it would require the arena to
    /// hold four billion slots.
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn pack(self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    /// Inverse of [`Self::pack`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn unpack(word: u64) -> Self {
        Self {
            index: (word >> 32) as u32,
            generation: word as u32,
        }
    }

    pub(crate) const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn insert(&mut self, entry: T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        // Memory runs out long before the index space does.
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.entry.is_none() {
            return None;
        }
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        entry
    }

    /// Access by raw slot index, bypassing the generation check.
    ///
    /// # Panics
    /// Panics when the slot is vacant. Callers hold links that are unlinked
    /// before their target is removed, so a vacant target means a corrupted
    /// structure.
    pub(crate) fn at(&self, index: u32) -> &T {
        self.slots[index as usize]
            .entry
            .as_ref()
            .expect("link refers to a vacant arena slot")
    }

    /// Mutable sibling of [`Self::at`].
    ///
    /// # Panics
    /// See [`Self::at`].
    pub(crate) fn at_mut(&mut self, index: u32) -> &mut T {
        self.slots[index as usize]
            .entry
            .as_mut()
            .expect("link refers to a vacant arena slot")
    }

    /// Rebuilds the handle of a live slot.
    pub(crate) fn handle_at(&self, index: u32) -> Handle {
        Handle {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.entry.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_miss_after_reuse() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);

        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);

        // The freed slot is reused under a new generation.
        let c = arena.insert("c");
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(c), Some(&"c"));
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn pack_round_trips() {
        let mut arena = Arena::new();
        arena.insert(0u8);
        let handle = arena.insert(1u8);
        arena.remove(handle);
        let reused = arena.insert(2u8);
        assert_eq!(Handle::unpack(reused.pack()), reused);
        assert_ne!(reused.pack(), handle.pack());
    }

    #[test]
    fn raw_index_access_tracks_the_live_entry() {
        let mut arena = Arena::new();
        let a = arena.insert(10);
        *arena.at_mut(a.index()) += 1;
        assert_eq!(arena.at(a.index()), &11);
        assert_eq!(arena.handle_at(a.index()), a);
    }
}
