// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Two-level sparse page table over the 40-bit guest address space.
//!
//! Indexed by caching page number. Layout of an address:
//! `[L0: 16 bits][L1: 10 bits][Offset: 14 bits]` = 40 bits total.
//! Second-level tables are allocated on first write, so memory cost follows
//! the pages actually touched.

use vidcore_common::ADDRESS_SPACE_BITS;

use super::buffer::BufferId;

/// log2 of the caching page size.
pub const CACHING_PAGEBITS: u32 = 14;
/// Caching page size (16 KiB).
pub const CACHING_PAGESIZE: u64 = 1 << CACHING_PAGEBITS;
/// Number of caching pages across the address space.
pub const CACHING_NUMPAGES: u64 = 1 << (ADDRESS_SPACE_BITS - CACHING_PAGEBITS);

/// Address bits spanned by one second-level table.
const FIRST_LEVEL_BITS: u32 = 24;
const L1_BITS: u32 = FIRST_LEVEL_BITS - CACHING_PAGEBITS;
const L1_SIZE: usize = 1 << L1_BITS;
const L0_SIZE: usize = 1 << (ADDRESS_SPACE_BITS - FIRST_LEVEL_BITS);

/// Page-table leaf for the buffer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageData {
    /// Buffer claiming this page. Weak: it must be checked against the slot
    /// table before use.
    pub buffer_id: BufferId,
    /// Download tick that must be reached before the CPU may read the page.
    pub target_tick: u64,
}

/// Sparse page table mapping caching pages to entries of type `E`.
pub struct PageTable<E> {
    /// L0 table: each entry is an optional L1 table.
    first_level: Vec<Option<Box<[E]>>>,
    allocated: usize,
}

impl<E: Copy + Default> PageTable<E> {
    pub fn new() -> Self {
        let mut first_level = Vec::with_capacity(L0_SIZE);
        first_level.resize_with(L0_SIZE, || None);
        Self {
            first_level,
            allocated: 0,
        }
    }

    /// Entry for `page`, or the default entry if its table was never touched.
    #[inline]
    pub fn get(&self, page: u64) -> E {
        let (l0, l1) = Self::split(page);
        match &self.first_level[l0] {
            Some(table) => table[l1],
            None => E::default(),
        }
    }

    /// Mutable entry for `page`, allocating its second-level table.
    pub fn get_mut(&mut self, page: u64) -> &mut E {
        let (l0, l1) = Self::split(page);
        let allocated = &mut self.allocated;
        let table = self.first_level[l0].get_or_insert_with(|| {
            *allocated += 1;
            vec![E::default(); L1_SIZE].into_boxed_slice()
        });
        &mut table[l1]
    }

    /// Mutable entry for `page` only if its table already exists.
    pub fn get_mut_if_present(&mut self, page: u64) -> Option<&mut E> {
        let (l0, l1) = Self::split(page);
        self.first_level[l0].as_mut().map(|table| &mut table[l1])
    }

    /// Number of second-level tables allocated so far.
    pub fn allocated_tables(&self) -> usize {
        self.allocated
    }

    #[inline]
    fn split(page: u64) -> (usize, usize) {
        assert!(page < CACHING_NUMPAGES, "page table: page 0x{:X} out of range", page);
        ((page >> L1_BITS) as usize, (page as usize) & (L1_SIZE - 1))
    }
}

impl<E: Copy + Default> Default for PageTable<E> {
    fn default() -> Self {
        Self::new()
    }
}
