// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Interval containers keyed by guest address.
//!
//! [`RangeSet`] keeps a sorted set of disjoint, non-adjacent half-open
//! intervals, merging on insert. [`RangeMap`] associates a value with each
//! interval and splits existing intervals when a new one lands on top.

use std::collections::BTreeMap;

use vidcore_common::VAddr;

// ---------------------------------------------------------------------------
// RangeSet
// ---------------------------------------------------------------------------

/// Coalesced set of `[begin, end)` intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    /// begin -> end
    ranges: BTreeMap<VAddr, VAddr>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint intervals.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Add `[addr, addr + size)`, merging with overlapping or adjacent intervals.
    pub fn add(&mut self, addr: VAddr, size: u64) {
        if size == 0 {
            return;
        }
        let mut begin = addr;
        let mut end = addr + size;

        let touching: Vec<(VAddr, VAddr)> = self
            .ranges
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= begin)
            .map(|(&b, &e)| (b, e))
            .collect();
        for (b, e) in touching {
            self.ranges.remove(&b);
            begin = begin.min(b);
            end = end.max(e);
        }
        self.ranges.insert(begin, end);
    }

    /// Remove `[addr, addr + size)`, splitting intervals that straddle it.
    pub fn subtract(&mut self, addr: VAddr, size: u64) {
        if size == 0 {
            return;
        }
        let begin = addr;
        let end = addr + size;

        let overlapping: Vec<(VAddr, VAddr)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > begin)
            .map(|(&b, &e)| (b, e))
            .collect();
        for (b, e) in overlapping {
            self.ranges.remove(&b);
            if b < begin {
                self.ranges.insert(b, begin);
            }
            if e > end {
                self.ranges.insert(end, e);
            }
        }
    }

    /// Whether any part of `[addr, addr + size)` is in the set.
    pub fn intersects(&self, addr: VAddr, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        self.ranges
            .range(..addr + size)
            .next_back()
            .is_some_and(|(_, &e)| e > addr)
    }

    /// Whether all of `[addr, addr + size)` is in the set.
    pub fn covers(&self, addr: VAddr, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        self.ranges
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, &e)| e >= addr + size)
    }

    /// Visit every interval in address order.
    pub fn for_each(&self, mut func: impl FnMut(VAddr, VAddr)) {
        for (&b, &e) in &self.ranges {
            func(b, e);
        }
    }

    /// Visit the parts of intervals that fall inside `[addr, addr + size)`.
    pub fn for_each_in_range(&self, addr: VAddr, size: u64, mut func: impl FnMut(VAddr, VAddr)) {
        let end = addr + size;
        let start = self
            .ranges
            .range(..=addr)
            .next_back()
            .filter(|&(_, &e)| e > addr)
            .map_or(addr, |(&b, _)| b);
        for (&b, &e) in self.ranges.range(start..end) {
            func(b.max(addr), e.min(end));
        }
    }

    /// Visit the parts of `[addr, addr + size)` not covered by the set.
    pub fn for_each_gap_in_range(&self, addr: VAddr, size: u64, mut func: impl FnMut(VAddr, VAddr)) {
        let end = addr + size;
        let mut cursor = addr;
        self.for_each_in_range(addr, size, |b, e| {
            if b > cursor {
                func(cursor, b);
            }
            cursor = e;
        });
        if cursor < end {
            func(cursor, end);
        }
    }

    /// Collect all intervals. Mostly useful for diagnostics and tests.
    pub fn to_vec(&self) -> Vec<(VAddr, VAddr)> {
        self.ranges.iter().map(|(&b, &e)| (b, e)).collect()
    }
}

// ---------------------------------------------------------------------------
// RangeMap
// ---------------------------------------------------------------------------

/// Map from disjoint `[begin, end)` intervals to values.
///
/// Inserting over an existing interval overwrites the overlapped part and
/// keeps the rest. Adjacent intervals holding the same value are merged.
#[derive(Debug, Clone, Default)]
pub struct RangeMap<T> {
    /// begin -> (end, value)
    ranges: BTreeMap<VAddr, (VAddr, T)>,
}

impl<T: Copy + Eq> RangeMap<T> {
    pub fn new() -> Self {
        Self {
            ranges: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Assign `value` to `[addr, addr + size)`.
    pub fn insert(&mut self, addr: VAddr, size: u64, value: T) {
        if size == 0 {
            return;
        }
        self.remove(addr, size);
        let mut begin = addr;
        let mut end = addr + size;

        if let Some((&b, &(e, v))) = self.ranges.range(..begin).next_back() {
            if e == begin && v == value {
                self.ranges.remove(&b);
                begin = b;
            }
        }
        if let Some(&(e, v)) = self.ranges.get(&end) {
            if v == value {
                self.ranges.remove(&end);
                end = e;
            }
        }
        self.ranges.insert(begin, (end, value));
    }

    /// Clear `[addr, addr + size)`, splitting intervals that straddle it.
    pub fn remove(&mut self, addr: VAddr, size: u64) {
        if size == 0 {
            return;
        }
        let begin = addr;
        let end = addr + size;

        let overlapping: Vec<(VAddr, VAddr, T)> = self
            .ranges
            .range(..end)
            .rev()
            .take_while(|&(_, &(e, _))| e > begin)
            .map(|(&b, &(e, v))| (b, e, v))
            .collect();
        for (b, e, v) in overlapping {
            self.ranges.remove(&b);
            if b < begin {
                self.ranges.insert(b, (begin, v));
            }
            if e > end {
                self.ranges.insert(end, (e, v));
            }
        }
    }

    /// Value at `addr`, if any.
    pub fn get(&self, addr: VAddr) -> Option<T> {
        self.ranges
            .range(..=addr)
            .next_back()
            .filter(|&(_, &(e, _))| e > addr)
            .map(|(_, &(_, v))| v)
    }

    /// Whether any part of `[addr, addr + size)` is mapped.
    pub fn intersects(&self, addr: VAddr, size: u64) -> bool {
        if size == 0 {
            return false;
        }
        self.ranges
            .range(..addr + size)
            .next_back()
            .is_some_and(|(_, &(e, _))| e > addr)
    }

    /// Visit mapped intervals clipped to `[addr, addr + size)`.
    pub fn for_each_in_range(
        &self,
        addr: VAddr,
        size: u64,
        mut func: impl FnMut(VAddr, VAddr, T),
    ) {
        let end = addr + size;
        let start = self
            .ranges
            .range(..=addr)
            .next_back()
            .filter(|&(_, &(e, _))| e > addr)
            .map_or(addr, |(&b, _)| b);
        for (&b, &(e, v)) in self.ranges.range(start..end) {
            func(b.max(addr), e.min(end), v);
        }
    }

    /// Intervals currently mapped to `value`.
    pub fn ranges_of(&self, value: T) -> Vec<(VAddr, VAddr)> {
        self.ranges
            .iter()
            .filter(|(_, &(_, v))| v == value)
            .map(|(&b, &(e, _))| (b, e))
            .collect()
    }

    /// Visit every interval in address order.
    pub fn for_each(&self, mut func: impl FnMut(VAddr, VAddr, T)) {
        for (&b, &(e, v)) in &self.ranges {
            func(b, e, v);
        }
    }
}
