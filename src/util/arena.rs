// src/util/arena.rs

//! Generation-checked arena used for access records and workflow steps.
//!
//! Handles stay valid until the element is removed. A stale handle (one
//! whose slot was freed and possibly reused) resolves to `None` instead of
//! aliasing the new occupant.

use std::fmt;

/// Stable handle into an [`Arena`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub const fn slot(self) -> u32 {
        self.slot
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into a single integer (used on the wire and in logs).
    pub const fn to_bits(self) -> u64 {
        ((self.slot as u64) << 32) | self.generation as u64
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self {
            slot: (bits >> 32) as u32,
            generation: bits as u32,
        }
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug)]
enum Entry<T> {
    Live { value: T, generation: u32 },
    Free { next: Option<u32>, generation: u32 },
}

#[derive(Debug)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free_head: Option<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            live: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.live
    }

    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.insert_with(|_| value)
    }

    /// Insert a value built from its own final handle.
    pub fn insert_with(&mut self, build: impl FnOnce(ArenaIndex) -> T) -> ArenaIndex {
        self.live += 1;
        match self.free_head {
            Some(slot) => {
                let (next, generation) = match self.entries[slot as usize] {
                    Entry::Free { next, generation } => (next, generation),
                    Entry::Live { .. } => unreachable!("free list points at a live entry"),
                };
                let index = ArenaIndex::new(slot, generation);
                self.free_head = next;
                self.entries[slot as usize] = Entry::Live {
                    value: build(index),
                    generation,
                };
                index
            }
            None => {
                let Ok(slot) = u32::try_from(self.entries.len()) else {
                    panic!("arena holds more than u32::MAX slots");
                };
                let index = ArenaIndex::new(slot, 0);
                self.entries.push(Entry::Live {
                    value: build(index),
                    generation: 0,
                });
                index
            }
        }
    }

    /// Remove and return the element, or `None` for a stale handle.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let entry = self.entries.get_mut(index.slot as usize)?;
        match entry {
            Entry::Live { generation, .. } if *generation == index.generation => {
                let freed = Entry::Free {
                    next: self.free_head,
                    generation: generation.wrapping_add(1),
                };
                let old = std::mem::replace(entry, freed);
                self.free_head = Some(index.slot);
                self.live -= 1;
                match old {
                    Entry::Live { value, .. } => Some(value),
                    Entry::Free { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.entries.get(index.slot as usize)? {
            Entry::Live { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.entries.get_mut(index.slot as usize)? {
            Entry::Live { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                Entry::Live { value, generation } => {
                    Some((ArenaIndex::new(slot as u32, *generation), value))
                }
                Entry::Free { .. } => None,
            })
    }
}
