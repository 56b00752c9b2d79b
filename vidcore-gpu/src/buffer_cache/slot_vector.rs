// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

/// Generational handle into a [`SlotVector`].
///
/// Index 0 is never allocated, so the all-zero id is the null handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    pub const NULL: Self = Self {
        index: 0,
        generation: 0,
    };

    #[inline]
    pub const fn is_null(self) -> bool {
        self.index == 0
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "SlotId(null)")
        } else {
            write!(f, "SlotId({}v{})", self.index, self.generation)
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Dense storage addressed by [`SlotId`].
///
/// Freed slots are reused through a free list; each reuse bumps the slot
/// generation so stale ids stop resolving.
pub struct SlotVector<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    len: usize,
}

impl<T> SlotVector<T> {
    pub fn new() -> Self {
        Self {
            // Reserved null slot.
            slots: vec![Slot {
                generation: 0,
                value: None,
            }],
            free_list: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value and return its id.
    ///
    /// Panics when the index space is exhausted.
    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = Some(value);
            return SlotId {
                index,
                generation: slot.generation,
            };
        }

        assert!(
            self.slots.len() < u32::MAX as usize,
            "slot vector: out of slots"
        );
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        SlotId {
            index,
            generation: 1,
        }
    }

    /// Remove a value. Returns `None` for null or stale ids.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        if id.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free_list.push(id.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        if id.is_null() {
            return None;
        }
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        if id.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Iterate over live values with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for SlotVector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::ops::Index<SlotId> for SlotVector<T> {
    type Output = T;

    fn index(&self, id: SlotId) -> &T {
        match self.get(id) {
            Some(value) => value,
            None => panic!("slot vector: invalid id {:?}", id),
        }
    }
}

impl<T> std::ops::IndexMut<SlotId> for SlotVector<T> {
    fn index_mut(&mut self, id: SlotId) -> &mut T {
        match self.get_mut(id) {
            Some(value) => value,
            None => panic!("slot vector: invalid id {:?}", id),
        }
    }
}
