// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! CPU-side dirty tracking.
//!
//! The tracker remembers which guest bytes currently have an up-to-date copy
//! on the device. Anything not recorded as synchronized counts as modified by
//! the CPU, so fresh memory is always uploaded on first use. Invalidation
//! works at host page granularity because that is what write-watching can
//! observe.

use std::sync::Arc;

use vidcore_common::{align_down, align_up, VAddr, HOST_PAGE_SIZE};

use super::range_set::RangeSet;

/// The CPU write-watch mechanism.
///
/// The tracker asks the watcher to report writes to ranges it has
/// synchronized, and to stop once a range is dirty again. Reports come back
/// through `BufferCache::invalidate_memory`.
pub trait PageWatcher: Send + Sync {
    fn update_watch(&self, addr: VAddr, size: u64, watch: bool);
}

pub struct MemoryTracker {
    synced: RangeSet,
    watcher: Option<Arc<dyn PageWatcher>>,
}

impl MemoryTracker {
    pub fn new(watcher: Option<Arc<dyn PageWatcher>>) -> Self {
        Self {
            synced: RangeSet::new(),
            watcher,
        }
    }

    /// Whether any byte of the range was written by the CPU since its last
    /// upload (or was never uploaded).
    pub fn is_region_cpu_modified(&self, addr: VAddr, size: u64) -> bool {
        !self.synced.covers(addr, size)
    }

    /// Record a CPU write to the range.
    pub fn mark_region_as_cpu_modified(&mut self, addr: VAddr, size: u64) {
        let begin = align_down(addr, HOST_PAGE_SIZE);
        let end = align_up(addr + size, HOST_PAGE_SIZE);
        if !self.synced.intersects(begin, end - begin) {
            return;
        }
        self.synced.subtract(begin, end - begin);
        if let Some(watcher) = &self.watcher {
            watcher.update_watch(begin, end - begin, false);
        }
    }

    /// Visit every CPU-modified sub-range of `[addr, addr + size)` and mark
    /// it synchronized. The caller must upload each range it is handed.
    pub fn for_each_upload_range(
        &mut self,
        addr: VAddr,
        size: u64,
        mut func: impl FnMut(VAddr, u64),
    ) {
        let mut dirty = Vec::new();
        self.synced
            .for_each_gap_in_range(addr, size, |begin, end| dirty.push((begin, end)));
        for (begin, end) in dirty {
            func(begin, end - begin);
            self.synced.add(begin, end - begin);
            if let Some(watcher) = &self.watcher {
                watcher.update_watch(begin, end - begin, true);
            }
        }
    }
}
