// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Ring allocators for transient device memory.
//!
//! A [`StreamBuffer`] hands out sub-ranges of one device allocation in ring
//! order. Each committed region is tagged with the tick that retires it;
//! when the ring wraps onto a region whose tick has not been reached, the
//! allocation waits for it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use vidcore_common::align_up;

use crate::backend::{BufferUsageFlags, Device, DeviceError, MemoryUsage, ResourceHandle};

struct Watch {
    begin: u64,
    end: u64,
    tick: u64,
    lap: u64,
}

struct RingState {
    cursor: u64,
    lap: u64,
    /// Regions mapped since the last commit.
    uncommitted: Vec<(u64, u64, u64)>,
    /// Committed regions in ring order, oldest first.
    watches: VecDeque<Watch>,
}

/// A ring-allocated device buffer for one memory usage.
pub struct StreamBuffer {
    device: Arc<dyn Device>,
    resource: ResourceHandle,
    usage: MemoryUsage,
    size: u64,
    ring: Mutex<RingState>,
}

impl StreamBuffer {
    pub fn new(device: Arc<dyn Device>, usage: MemoryUsage, size: u64) -> Result<Self, DeviceError> {
        let flags = match usage {
            MemoryUsage::Upload => BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::Download => BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::Stream | MemoryUsage::DeviceLocal => BufferUsageFlags::ALL,
        };
        let resource = device.create_buffer(size, usage, flags)?;
        log::info!("stream buffer: {:?} ring of 0x{:X} bytes", usage, size);
        Ok(Self {
            device,
            resource,
            usage,
            size,
            ring: Mutex::new(RingState {
                cursor: 0,
                lap: 0,
                uncommitted: Vec::new(),
                watches: VecDeque::new(),
            }),
        })
    }

    #[inline]
    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    #[inline]
    pub fn usage(&self) -> MemoryUsage {
        self.usage
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reserve `size` bytes at `alignment` and return their offset.
    ///
    /// `wait` is called with the retire tick of every older region the new
    /// allocation overwrites. Panics if `size` exceeds the ring.
    pub fn map(&self, size: u64, alignment: u64, mut wait: impl FnMut(u64)) -> u64 {
        assert!(
            size <= self.size,
            "stream buffer: request 0x{:X} exceeds ring size 0x{:X}",
            size,
            self.size
        );
        let mut ring = self.ring.lock();
        let mut offset = align_up(ring.cursor, alignment.max(1));
        if offset + size > self.size {
            // Previous-lap regions still ahead of the cursor lie in the
            // skipped tail. Retire them so the queue front stays in ring order.
            let lap = ring.lap;
            while let Some(watch) = ring.watches.front() {
                if watch.lap >= lap {
                    break;
                }
                wait(watch.tick);
                ring.watches.pop_front();
            }
            offset = 0;
            ring.lap += 1;
        }
        let end = offset + size;
        let lap = ring.lap;
        while let Some(watch) = ring.watches.front() {
            if watch.lap == lap || watch.begin >= end {
                break;
            }
            wait(watch.tick);
            ring.watches.pop_front();
        }
        ring.cursor = end;
        ring.uncommitted.push((offset, end, lap));
        offset
    }

    /// Tag every region mapped since the last commit with `tick`.
    pub fn commit(&self, tick: u64) {
        let mut ring = self.ring.lock();
        let regions = std::mem::take(&mut ring.uncommitted);
        for (begin, end, lap) in regions {
            ring.watches.push_back(Watch {
                begin,
                end,
                tick,
                lap,
            });
        }
    }

    /// Write through the host mapping.
    pub fn write(&self, offset: u64, data: &[u8]) {
        self.device.write_mapped(self.resource, offset, data);
    }

    /// Read through the host mapping.
    pub fn read(&self, offset: u64, dst: &mut [u8]) {
        self.device.read_mapped(self.resource, offset, dst);
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.resource);
    }
}
