// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use vidcore_common::VAddr;

use crate::backend::{MemoryUsage, ResourceHandle};

use super::slot_vector::SlotId;

/// Handle to a [`Buffer`] in the cache's slot table.
pub type BufferId = SlotId;

/// The null buffer id, returned on a cache miss.
pub const NULL_BUFFER_ID: BufferId = SlotId::NULL;

/// A device allocation mirroring a contiguous guest address range.
#[derive(Debug)]
pub struct Buffer {
    cpu_addr: VAddr,
    size_bytes: u64,
    resource: ResourceHandle,
    device_address: u64,
    usage: MemoryUsage,
    /// Merge-driven usage heuristic, see `stream_leap_threshold`.
    stream_score: u32,
    /// Set once the buffer is unregistered; the slot lingers until the
    /// device is done with it.
    pub is_deleted: bool,
    /// The shared transient stream buffer. Never retired by a merge.
    is_shared_stream: bool,
}

impl Buffer {
    pub fn new(
        cpu_addr: VAddr,
        size_bytes: u64,
        resource: ResourceHandle,
        device_address: u64,
        usage: MemoryUsage,
    ) -> Self {
        Self {
            cpu_addr,
            size_bytes,
            resource,
            device_address,
            usage,
            stream_score: 0,
            is_deleted: false,
            is_shared_stream: false,
        }
    }

    /// Wrap the transient stream pool's resource so it can be handed out
    /// like any other buffer.
    pub fn shared_stream(size_bytes: u64, resource: ResourceHandle, device_address: u64) -> Self {
        Self {
            is_shared_stream: true,
            ..Self::new(0, size_bytes, resource, device_address, MemoryUsage::Stream)
        }
    }

    #[inline]
    pub fn cpu_addr(&self) -> VAddr {
        self.cpu_addr
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    #[inline]
    pub fn end_addr(&self) -> VAddr {
        self.cpu_addr + self.size_bytes
    }

    #[inline]
    pub fn resource(&self) -> ResourceHandle {
        self.resource
    }

    #[inline]
    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    #[inline]
    pub fn usage(&self) -> MemoryUsage {
        self.usage
    }

    #[inline]
    pub fn is_shared_stream(&self) -> bool {
        self.is_shared_stream
    }

    #[inline]
    pub fn stream_score(&self) -> u32 {
        self.stream_score
    }

    pub fn increase_stream_score(&mut self, score: u32) {
        self.stream_score = self.stream_score.saturating_add(score);
    }

    /// Byte offset of `addr` inside this buffer.
    #[inline]
    pub fn offset_of(&self, addr: VAddr) -> u64 {
        debug_assert!(addr >= self.cpu_addr, "address below buffer base");
        addr - self.cpu_addr
    }

    /// Whether `[addr, addr + size)` lies entirely inside this buffer.
    #[inline]
    pub fn contains(&self, addr: VAddr, size: u64) -> bool {
        addr >= self.cpu_addr && addr + size <= self.end_addr()
    }
}
