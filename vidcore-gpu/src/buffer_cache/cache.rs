// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The buffer cache.
//!
//! Guest ranges referenced by draws and dispatches are resolved to device
//! buffers through a page table over 16 KiB caching pages. A request that no
//! single buffer covers creates a new buffer spanning the request and every
//! buffer it touches, copies their contents in and retires them. CPU writes
//! arrive through [`BufferCache::invalidate_memory`]; GPU writes are queued
//! for download and written back to guest memory by the download worker.
//!
//! Locking: `state` guards the page table, the range sets and the memory
//! tracker; `slots` guards the buffers themselves. When both are held,
//! `state` is always taken first.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use thiserror::Error;

use vidcore_common::settings::BufferCacheSettings;
use vidcore_common::{
    align_down, align_up, div_ceil, is_in_address_space, VAddr, ADDRESS_SPACE_SIZE, HOST_PAGE_SIZE,
};

use crate::backend::{BufferCopy, BufferUsageFlags, Device, DeviceError, MemoryUsage, ResourceHandle};
use crate::guest_memory::GuestMemory;

use super::buffer::{Buffer, BufferId, NULL_BUFFER_ID};
use super::download::{DownloadWorker, PendingDownload};
use super::fault_buffer::FaultBuffer;
use super::interfaces::{DrawStateProvider, ImageSource};
use super::memory_tracker::{MemoryTracker, PageWatcher};
use super::page_table::{PageData, PageTable, CACHING_PAGEBITS, CACHING_PAGESIZE};
use super::range_set::{RangeMap, RangeSet};
use super::slot_vector::SlotVector;
use super::stream_buffer::StreamBuffer;

const UPLOAD_ALIGNMENT: u64 = 4;
const STREAM_ALIGNMENT: u64 = 256;
const DOWNLOAD_ALIGNMENT: u64 = 64;

/// Errors raised while setting up a [`BufferCache`].
#[derive(Debug, Error)]
pub enum BufferCacheError {
    #[error("device: {0}")]
    Device(#[from] DeviceError),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved buffer and the byte offset of the requested address in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObtainedBuffer {
    pub id: BufferId,
    pub resource: ResourceHandle,
    pub offset: u64,
}

/// Buffers touched by a request and the range a replacement must cover.
#[derive(Debug)]
struct OverlapResult {
    ids: SmallVec<[BufferId; 16]>,
    begin: VAddr,
    end: VAddr,
    has_stream_leap: bool,
    has_stream_buffer: bool,
}

struct CacheState {
    page_table: PageTable<PageData>,
    /// Page-aligned extent of every registered buffer.
    buffer_ranges: RangeMap<BufferId>,
    gpu_modified_ranges: RangeSet,
    /// GPU writes not yet scheduled for download.
    pending_download_ranges: RangeSet,
    memory_tracker: MemoryTracker,
    /// Deleted buffers waiting for the device tick current at deletion.
    pending_deletions: Vec<(u64, BufferId)>,
    /// Signal tick of the last scheduled download.
    current_download_tick: u64,
}

/// Region of a GPU buffer copied into the readback area.
struct DownloadRegion {
    resource: ResourceHandle,
    src_offset: u64,
    addr: VAddr,
    size: u64,
    dst_offset: u64,
}

pub struct BufferCache {
    settings: BufferCacheSettings,
    device: Arc<dyn Device>,
    guest: Arc<dyn GuestMemory>,
    image_source: Option<Arc<dyn ImageSource>>,
    state: RwLock<CacheState>,
    slots: RwLock<SlotVector<Buffer>>,
    staging_buffer: StreamBuffer,
    stream_buffer: StreamBuffer,
    download_buffer: StreamBuffer,
    device_buffer: StreamBuffer,
    stream_buffer_id: BufferId,
    gds_buffer: ResourceHandle,
    fault_buffer: FaultBuffer,
    download_worker: DownloadWorker,
}

impl BufferCache {
    pub fn new(
        settings: &BufferCacheSettings,
        device: Arc<dyn Device>,
        guest: Arc<dyn GuestMemory>,
        watcher: Option<Arc<dyn PageWatcher>>,
        image_source: Option<Arc<dyn ImageSource>>,
    ) -> Result<Self, BufferCacheError> {
        let staging_buffer =
            StreamBuffer::new(device.clone(), MemoryUsage::Upload, settings.staging_buffer_size)?;
        let stream_buffer =
            StreamBuffer::new(device.clone(), MemoryUsage::Stream, settings.stream_buffer_size)?;
        let download_buffer =
            StreamBuffer::new(device.clone(), MemoryUsage::Download, settings.download_buffer_size)?;
        let device_buffer =
            StreamBuffer::new(device.clone(), MemoryUsage::DeviceLocal, settings.device_buffer_size)?;
        let fault_buffer = FaultBuffer::new()?;
        let download_worker = DownloadWorker::spawn(device.clone())?;
        let gds_buffer = device.create_buffer(
            settings.gds_buffer_size,
            MemoryUsage::DeviceLocal,
            BufferUsageFlags::ALL,
        )?;

        let mut slots = SlotVector::new();
        let stream_buffer_id = slots.insert(Buffer::shared_stream(
            stream_buffer.size(),
            stream_buffer.resource(),
            device.device_address(stream_buffer.resource()),
        ));

        log::info!(
            "buffer cache: on {} device, growth margin 0x{:X}, stream threshold 0x{:X}",
            device.name(),
            settings.growth_margin,
            settings.stream_threshold
        );

        Ok(Self {
            settings: settings.clone(),
            device,
            guest,
            image_source,
            state: RwLock::new(CacheState {
                page_table: PageTable::new(),
                buffer_ranges: RangeMap::new(),
                gpu_modified_ranges: RangeSet::new(),
                pending_download_ranges: RangeSet::new(),
                memory_tracker: MemoryTracker::new(watcher),
                pending_deletions: Vec::new(),
                current_download_tick: 0,
            }),
            slots: RwLock::new(slots),
            staging_buffer,
            stream_buffer,
            download_buffer,
            device_buffer,
            stream_buffer_id,
            gds_buffer,
            fault_buffer,
            download_worker,
        })
    }

    // -----------------------------------------------------------------------
    // Obtain
    // -----------------------------------------------------------------------

    /// Resolve `[addr, addr + size)` to one buffer covering all of it,
    /// creating or merging buffers as needed.
    ///
    /// CPU-modified bytes in the range are uploaded first. A written range is
    /// recorded as GPU-modified and queued for the next download commit.
    pub fn obtain_buffer(&self, addr: VAddr, size: u64, is_written: bool) -> ObtainedBuffer {
        assert!(
            is_in_address_space(addr, size),
            "buffer cache: range 0x{:X}+0x{:X} outside the address space",
            addr,
            size
        );
        let size = size.max(1);

        let mut guard = self.state.write();
        let state = &mut *guard;
        let id = self.find_or_create(state, addr, size);

        let slots = self.slots.read();
        let buffer = &slots[id];
        self.synchronize_buffer(state, buffer, addr, size);
        if is_written {
            state.gpu_modified_ranges.add(addr, size);
            state.pending_download_ranges.add(addr, size);
        }
        log::trace!(
            "obtain 0x{:X}+0x{:X} written={} -> {:?} at 0x{:X}",
            addr,
            size,
            is_written,
            id,
            buffer.offset_of(addr)
        );
        ObtainedBuffer {
            id,
            resource: buffer.resource(),
            offset: buffer.offset_of(addr),
        }
    }

    /// Read-only variant for short-lived per-draw data.
    ///
    /// Small requests over memory the cache does not track are copied into
    /// the shared stream buffer instead of materializing a cached buffer.
    pub fn obtain_transient(&self, addr: VAddr, size: u64) -> ObtainedBuffer {
        assert!(
            is_in_address_space(addr, size),
            "buffer cache: range 0x{:X}+0x{:X} outside the address space",
            addr,
            size
        );
        if size <= self.settings.stream_threshold {
            let is_tracked = {
                let state = self.state.read();
                state.buffer_ranges.intersects(addr, size)
                    || state.gpu_modified_ranges.intersects(addr, size)
            };
            if !is_tracked {
                return self.stream_upload(addr, size);
            }
        }
        self.obtain_buffer(addr, size, false)
    }

    /// Id of the buffer covering `[addr, addr + size)`, created if needed.
    /// Address 0 is never backed and yields the null id.
    pub fn find_buffer(&self, addr: VAddr, size: u64) -> BufferId {
        if addr == 0 {
            return NULL_BUFFER_ID;
        }
        assert!(
            is_in_address_space(addr, size),
            "buffer cache: range 0x{:X}+0x{:X} outside the address space",
            addr,
            size
        );
        let mut guard = self.state.write();
        self.find_or_create(&mut guard, addr, size.max(1))
    }

    /// Buffer holding GPU-written data for an image copy, if one already
    /// covers the whole range. Never creates buffers.
    pub fn obtain_buffer_for_image(&self, addr: VAddr, size: u64) -> Option<ObtainedBuffer> {
        let state = self.state.read();
        if !state.gpu_modified_ranges.intersects(addr, size) {
            return None;
        }
        let id = state.page_table.get(addr >> CACHING_PAGEBITS).buffer_id;
        let slots = self.slots.read();
        let buffer = slots
            .get(id)
            .filter(|buffer| !buffer.is_deleted && buffer.contains(addr, size))?;
        Some(ObtainedBuffer {
            id,
            resource: buffer.resource(),
            offset: buffer.offset_of(addr),
        })
    }

    fn find_or_create(&self, state: &mut CacheState, addr: VAddr, size: u64) -> BufferId {
        let id = state.page_table.get(addr >> CACHING_PAGEBITS).buffer_id;
        if !id.is_null() {
            let slots = self.slots.read();
            if slots
                .get(id)
                .is_some_and(|buffer| {
                    !buffer.is_deleted && !buffer.is_shared_stream() && buffer.contains(addr, size)
                })
            {
                return id;
            }
        }
        self.create_buffer(state, addr, size)
    }

    fn resolve_overlaps(
        &self,
        state: &CacheState,
        slots: &SlotVector<Buffer>,
        addr: VAddr,
        size: u64,
    ) -> OverlapResult {
        let settings = &self.settings;
        let mut overlap = OverlapResult {
            ids: SmallVec::new(),
            begin: addr,
            end: align_up(addr + size + settings.growth_margin, CACHING_PAGESIZE)
                .min(ADDRESS_SPACE_SIZE),
            has_stream_leap: false,
            has_stream_buffer: false,
        };
        let mut stream_score = 0u32;
        let mut cursor = align_down(addr, CACHING_PAGESIZE);
        while cursor < overlap.end {
            let id = state.page_table.get(cursor >> CACHING_PAGEBITS).buffer_id;
            cursor += CACHING_PAGESIZE;
            if id.is_null() || overlap.ids.contains(&id) {
                continue;
            }
            if id == self.stream_buffer_id {
                overlap.has_stream_buffer = true;
                continue;
            }
            let Some(buffer) = slots.get(id).filter(|buffer| !buffer.is_deleted) else {
                continue;
            };
            overlap.ids.push(id);
            overlap.begin = overlap.begin.min(buffer.cpu_addr());
            overlap.end = overlap.end.max(buffer.end_addr());

            stream_score = stream_score.saturating_add(buffer.stream_score());
            if stream_score > settings.stream_leap_threshold && !overlap.has_stream_leap {
                overlap.has_stream_leap = true;
                overlap.begin = overlap.begin.saturating_sub(settings.stream_leap_growth);
                overlap.end = (overlap.end + settings.stream_leap_growth).min(ADDRESS_SPACE_SIZE);
                cursor = align_down(overlap.begin, CACHING_PAGESIZE);
            }
        }
        overlap.end = align_up(overlap.end, CACHING_PAGESIZE).min(ADDRESS_SPACE_SIZE);
        overlap
    }

    fn create_buffer(&self, state: &mut CacheState, addr: VAddr, size: u64) -> BufferId {
        let mut slots = self.slots.write();
        self.reclaim_deleted(state, &mut slots);

        let overlap = self.resolve_overlaps(state, &slots, addr, size);
        let size = overlap.end - overlap.begin;
        let resource = self.allocate(size, MemoryUsage::DeviceLocal, BufferUsageFlags::ALL);
        let device_address = self.device.device_address(resource);
        let new_id = slots.insert(Buffer::new(
            overlap.begin,
            size,
            resource,
            device_address,
            MemoryUsage::DeviceLocal,
        ));

        for &overlap_id in &overlap.ids {
            self.join_overlap(state, &mut slots, new_id, overlap_id, !overlap.has_stream_leap);
        }
        Self::change_register(state, new_id, &slots[new_id], true);

        log::debug!(
            "buffer cache: create {:?} [0x{:X}..0x{:X}) merging {} buffers{}{}",
            new_id,
            overlap.begin,
            overlap.end,
            overlap.ids.len(),
            if overlap.has_stream_leap { ", stream leap" } else { "" },
            if overlap.has_stream_buffer { ", past stream buffer" } else { "" },
        );
        new_id
    }

    /// Copy an overlapping buffer into its replacement and retire it.
    fn join_overlap(
        &self,
        state: &mut CacheState,
        slots: &mut SlotVector<Buffer>,
        new_id: BufferId,
        overlap_id: BufferId,
        accumulate_stream_score: bool,
    ) {
        let overlap = &slots[overlap_id];
        let (src, src_addr, src_size) = (overlap.resource(), overlap.cpu_addr(), overlap.size_bytes());
        let score = overlap.stream_score();

        let new_buffer = &mut slots[new_id];
        if accumulate_stream_score {
            new_buffer.increase_stream_score(score.saturating_add(1));
        }
        let copy = BufferCopy {
            src_offset: 0,
            dst_offset: new_buffer.offset_of(src_addr),
            size: src_size,
        };
        let dst = new_buffer.resource();
        self.device.copy_buffer(src, dst, &[copy]);
        self.device.buffer_barrier(dst, copy.dst_offset, copy.size);
        self.delete_buffer(state, slots, overlap_id);
    }

    fn change_register(state: &mut CacheState, id: BufferId, buffer: &Buffer, is_register: bool) {
        let page_begin = buffer.cpu_addr() >> CACHING_PAGEBITS;
        let page_end = div_ceil(buffer.end_addr(), CACHING_PAGESIZE);
        for page in page_begin..page_end {
            if is_register {
                state.page_table.get_mut(page).buffer_id = id;
            } else if let Some(entry) = state.page_table.get_mut_if_present(page) {
                debug_assert_eq!(entry.buffer_id, id, "page 0x{:X} claimed by another buffer", page);
                entry.buffer_id = NULL_BUFFER_ID;
            }
        }
        let begin = page_begin << CACHING_PAGEBITS;
        let size = (page_end - page_begin) << CACHING_PAGEBITS;
        if is_register {
            state.buffer_ranges.insert(begin, size, id);
        } else {
            state.buffer_ranges.remove(begin, size);
        }
    }

    /// Unregister a buffer and queue it for reclamation. The shared stream
    /// buffer is never deleted.
    fn delete_buffer(&self, state: &mut CacheState, slots: &mut SlotVector<Buffer>, id: BufferId) {
        let buffer = &mut slots[id];
        if buffer.is_shared_stream() || buffer.is_deleted {
            return;
        }
        buffer.is_deleted = true;
        Self::change_register(state, id, buffer, false);

        let tick = self.device.current_tick();
        state.pending_deletions.push((tick, id));
        log::debug!(
            "buffer cache: delete {:?} [0x{:X}..0x{:X}), reclaim after tick {}",
            id,
            buffer.cpu_addr(),
            buffer.end_addr(),
            tick
        );
    }

    fn reclaim_deleted(&self, state: &mut CacheState, slots: &mut SlotVector<Buffer>) {
        let device = &self.device;
        state.pending_deletions.retain(|&(tick, id)| {
            if !device.is_tick_complete(tick) {
                return true;
            }
            if let Some(buffer) = slots.remove(id) {
                device.destroy_buffer(buffer.resource());
            }
            false
        });
    }

    // -----------------------------------------------------------------------
    // Uploads
    // -----------------------------------------------------------------------

    fn synchronize_buffer(&self, state: &mut CacheState, buffer: &Buffer, addr: VAddr, size: u64) {
        let mut ranges: SmallVec<[(VAddr, u64); 8]> = SmallVec::new();
        let gpu_modified = &state.gpu_modified_ranges;
        // GPU-written bytes that have not been downloaded yet are newer than
        // guest memory even when their host page was invalidated.
        state
            .memory_tracker
            .for_each_upload_range(addr, size, |range_addr, range_size| {
                gpu_modified.for_each_gap_in_range(range_addr, range_size, |begin, end| {
                    ranges.push((begin, end - begin))
                });
            });
        if let Some(images) = &self.image_source {
            ranges.retain(|&mut (range_addr, range_size)| {
                !images.try_copy_to_buffer(
                    range_addr,
                    range_size,
                    buffer.resource(),
                    buffer.offset_of(range_addr),
                )
            });
        }
        if !ranges.is_empty() {
            self.upload_ranges(buffer, &ranges);
        }
    }

    fn upload_ranges(&self, buffer: &Buffer, ranges: &[(VAddr, u64)]) {
        let total: u64 = ranges.iter().map(|&(_, size)| size).sum();
        let use_staging = total <= self.staging_buffer.size();
        let (src, base) = if use_staging {
            let offset = self
                .staging_buffer
                .map(total, UPLOAD_ALIGNMENT, |tick| self.wait_device_tick(tick));
            (self.staging_buffer.resource(), offset)
        } else {
            (self.allocate(total, MemoryUsage::Upload, BufferUsageFlags::TRANSFER_SRC), 0)
        };

        let mut copies: SmallVec<[BufferCopy; 8]> = SmallVec::with_capacity(ranges.len());
        let mut bytes = Vec::new();
        let mut src_offset = base;
        for &(addr, size) in ranges {
            bytes.resize(size as usize, 0);
            self.guest.read(addr, &mut bytes);
            self.device.write_mapped(src, src_offset, &bytes);
            copies.push(BufferCopy {
                src_offset,
                dst_offset: buffer.offset_of(addr),
                size,
            });
            src_offset += size;
        }
        if use_staging {
            self.staging_buffer.commit(self.device.current_tick());
        }
        self.device.copy_buffer(src, buffer.resource(), &copies);
        self.device.buffer_barrier(buffer.resource(), 0, buffer.size_bytes());
        if !use_staging {
            self.device.destroy_buffer(src);
        }
        log::trace!(
            "upload {} ranges (0x{:X} bytes) into buffer at 0x{:X}",
            copies.len(),
            total,
            buffer.cpu_addr()
        );
    }

    fn stream_upload(&self, addr: VAddr, size: u64) -> ObtainedBuffer {
        let offset = self
            .stream_buffer
            .map(size, STREAM_ALIGNMENT, |tick| self.wait_device_tick(tick));
        let mut bytes = vec![0u8; size as usize];
        self.guest.read(addr, &mut bytes);
        self.stream_buffer.write(offset, &bytes);
        self.stream_buffer.commit(self.device.current_tick());
        log::trace!("stream 0x{:X}+0x{:X} at 0x{:X}", addr, size, offset);
        ObtainedBuffer {
            id: self.stream_buffer_id,
            resource: self.stream_buffer.resource(),
            offset,
        }
    }

    /// Upload CPU-modified bytes of every registered buffer in the range.
    pub fn synchronize_buffers_in_range(&self, addr: VAddr, size: u64) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let slots = self.slots.read();
        let mut pieces: SmallVec<[(VAddr, VAddr, BufferId); 8]> = SmallVec::new();
        state
            .buffer_ranges
            .for_each_in_range(addr, size, |begin, end, id| pieces.push((begin, end, id)));
        for (begin, end, id) in pieces {
            let buffer = &slots[id];
            let begin = begin.max(buffer.cpu_addr());
            let end = end.min(buffer.end_addr());
            if begin < end {
                self.synchronize_buffer(state, buffer, begin, end - begin);
            }
        }
    }

    /// Synchronize every registered buffer before DMA reads them through raw
    /// device addresses.
    pub fn synchronize_dma_buffers(&self) {
        self.synchronize_buffers_in_range(0, ADDRESS_SPACE_SIZE);
        self.device.memory_barrier();
    }

    // -----------------------------------------------------------------------
    // Coherency
    // -----------------------------------------------------------------------

    pub fn is_region_registered(&self, addr: VAddr, size: u64) -> bool {
        self.state.read().buffer_ranges.intersects(addr, size)
    }

    pub fn is_region_cpu_modified(&self, addr: VAddr, size: u64) -> bool {
        self.state.read().memory_tracker.is_region_cpu_modified(addr, size)
    }

    pub fn is_region_gpu_modified(&self, addr: VAddr, size: u64) -> bool {
        self.state.read().gpu_modified_ranges.intersects(addr, size)
    }

    /// React to a CPU write reported by the write-watch mechanism.
    ///
    /// Waits for downloads still heading to the range, drops pending GPU
    /// state for it and marks it CPU-modified. Buffers lying entirely inside
    /// the invalidated pages and holding no GPU-written data are deleted.
    pub fn invalidate_memory(&self, addr: VAddr, size: u64) {
        if !self.is_region_registered(addr, size) {
            return;
        }
        self.read_memory(addr, size);

        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut slots = self.slots.write();

        let begin = align_down(addr, HOST_PAGE_SIZE);
        let end = align_up(addr + size, HOST_PAGE_SIZE);
        let mut victims: SmallVec<[BufferId; 4]> = SmallVec::new();
        let gpu_modified = &state.gpu_modified_ranges;
        state.buffer_ranges.for_each_in_range(begin, end - begin, |_, _, id| {
            if victims.contains(&id) {
                return;
            }
            let buffer = &slots[id];
            if buffer.cpu_addr() >= begin
                && buffer.end_addr() <= end
                && !gpu_modified.intersects(buffer.cpu_addr(), buffer.size_bytes())
            {
                victims.push(id);
            }
        });

        state.gpu_modified_ranges.subtract(addr, size);
        state.pending_download_ranges.subtract(addr, size);
        state.memory_tracker.mark_region_as_cpu_modified(addr, size);
        for id in victims {
            self.delete_buffer(state, &mut slots, id);
        }
    }

    /// Block until every scheduled download covering the range has been
    /// written back to guest memory.
    pub fn read_memory(&self, addr: VAddr, size: u64) {
        let target_tick = {
            let state = self.state.read();
            let page_end = div_ceil(addr + size.max(1), CACHING_PAGESIZE);
            (addr >> CACHING_PAGEBITS..page_end)
                .map(|page| state.page_table.get(page).target_tick)
                .max()
                .unwrap_or(0)
        };
        if self.download_worker.download_tick() < target_tick {
            log::trace!("read 0x{:X}+0x{:X} waits for download tick {}", addr, size, target_tick);
            self.download_worker.wait_for_tick(target_tick);
        }
    }

    // -----------------------------------------------------------------------
    // Downloads
    // -----------------------------------------------------------------------

    /// Schedule every pending GPU write for download to guest memory.
    ///
    /// Returns whether anything was scheduled. With `wait_done`, blocks
    /// until the download has landed.
    pub fn commit_pending_downloads(&self, wait_done: bool) -> bool {
        let signal_tick = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let mut slots = self.slots.write();
            self.reclaim_deleted(state, &mut slots);
            if state.pending_download_ranges.is_empty() {
                return false;
            }

            let mut regions: Vec<DownloadRegion> = Vec::new();
            let mut total = 0u64;
            let buffer_ranges = &state.buffer_ranges;
            state.pending_download_ranges.for_each(|begin, end| {
                buffer_ranges.for_each_in_range(begin, end - begin, |range_begin, range_end, id| {
                    let buffer = &slots[id];
                    let begin = range_begin.max(buffer.cpu_addr());
                    let end = range_end.min(buffer.end_addr());
                    if begin >= end {
                        return;
                    }
                    regions.push(DownloadRegion {
                        resource: buffer.resource(),
                        src_offset: buffer.offset_of(begin),
                        addr: begin,
                        size: end - begin,
                        dst_offset: total,
                    });
                    total += end - begin;
                });
            });
            state.pending_download_ranges.clear();
            if regions.is_empty() {
                return false;
            }

            state.current_download_tick += 1;
            let signal_tick = state.current_download_tick;
            for region in &regions {
                state.gpu_modified_ranges.subtract(region.addr, region.size);
                let page_end = div_ceil(region.addr + region.size, CACHING_PAGESIZE);
                for page in region.addr >> CACHING_PAGEBITS..page_end {
                    state.page_table.get_mut(page).target_tick = signal_tick;
                }
            }

            let use_ring = total <= self.download_buffer.size();
            let (dst, base) = if use_ring {
                let offset = self.download_buffer.map(total, DOWNLOAD_ALIGNMENT, |tick| {
                    self.download_worker.wait_for_tick(tick)
                });
                (self.download_buffer.resource(), offset)
            } else {
                (self.allocate(total, MemoryUsage::Download, BufferUsageFlags::TRANSFER_DST), 0)
            };
            for region in &regions {
                let copy = BufferCopy {
                    src_offset: region.src_offset,
                    dst_offset: base + region.dst_offset,
                    size: region.size,
                };
                self.device.copy_buffer(region.resource, dst, &[copy]);
            }
            let gpu_tick = self.device.flush();
            if use_ring {
                self.download_buffer.commit(signal_tick);
            }

            let device = self.device.clone();
            let guest = self.guest.clone();
            let writes: Vec<(VAddr, u64, u64)> = regions
                .iter()
                .map(|region| (region.addr, base + region.dst_offset, region.size))
                .collect();
            let callback = Box::new(move || {
                let mut bytes = Vec::new();
                for (addr, offset, size) in writes {
                    bytes.resize(size as usize, 0);
                    device.read_mapped(dst, offset, &mut bytes);
                    guest.write(addr, &bytes);
                }
                if !use_ring {
                    device.destroy_buffer(dst);
                }
            });
            self.download_worker.push(PendingDownload {
                callback,
                gpu_tick,
                signal_tick,
            });
            log::debug!(
                "buffer cache: download {} regions (0x{:X} bytes), gpu tick {}, signal tick {}",
                regions.len(),
                total,
                gpu_tick,
                signal_tick
            );
            signal_tick
        };

        if wait_done {
            self.download_worker.wait_for_tick(signal_tick);
        }
        true
    }

    /// Highest download tick whose write-back has completed.
    pub fn download_tick(&self) -> u64 {
        self.download_worker.download_tick()
    }

    // -----------------------------------------------------------------------
    // Faults
    // -----------------------------------------------------------------------

    /// Materialize a buffer for every page recorded in the fault bitmap.
    /// Returns the number of faulting pages handled.
    pub fn process_fault_buffer(&self) -> usize {
        let pages = self.fault_buffer.take_faults();
        for &page in &pages {
            self.obtain_buffer(page << CACHING_PAGEBITS, CACHING_PAGESIZE, true);
        }
        if !pages.is_empty() {
            self.device.memory_barrier();
            log::debug!("buffer cache: processed {} faulting pages", pages.len());
        }
        pages.len()
    }

    // -----------------------------------------------------------------------
    // Command helpers
    // -----------------------------------------------------------------------

    /// Write inline command data either to the global data share or to
    /// guest memory through the cache.
    pub fn inline_data(&self, addr: VAddr, data: &[u8], is_gds: bool) {
        if data.is_empty() {
            return;
        }
        let (resource, offset) = if is_gds {
            self.gds_range(addr, data.len() as u64)
        } else {
            let obtained = self.obtain_buffer(addr, data.len() as u64, true);
            (obtained.resource, obtained.offset)
        };
        self.device.update_buffer(resource, offset, data);
    }

    /// Copy `num_bytes` from `src` to `dst`. Either side may address the
    /// global data share instead of guest memory.
    pub fn copy_buffer(&self, dst: VAddr, src: VAddr, num_bytes: u64, dst_gds: bool, src_gds: bool) {
        if num_bytes == 0 {
            return;
        }
        if !src_gds {
            self.obtain_buffer(src, num_bytes, false);
        }
        let (dst_resource, dst_offset) = if dst_gds {
            self.gds_range(dst, num_bytes)
        } else {
            let obtained = self.obtain_buffer(dst, num_bytes, true);
            (obtained.resource, obtained.offset)
        };
        // Resolving the destination may have merged the source buffer away.
        let (src_resource, src_offset) = if src_gds {
            self.gds_range(src, num_bytes)
        } else {
            let obtained = self.obtain_buffer(src, num_bytes, false);
            (obtained.resource, obtained.offset)
        };

        let overlapping = src_resource == dst_resource
            && src_offset < dst_offset + num_bytes
            && dst_offset < src_offset + num_bytes;
        if overlapping {
            let use_ring = num_bytes <= self.device_buffer.size();
            let (bounce, base) = if use_ring {
                let offset = self
                    .device_buffer
                    .map(num_bytes, UPLOAD_ALIGNMENT, |tick| self.wait_device_tick(tick));
                (self.device_buffer.resource(), offset)
            } else {
                (self.allocate(num_bytes, MemoryUsage::DeviceLocal, BufferUsageFlags::TRANSFER), 0)
            };
            self.device.copy_buffer(
                src_resource,
                bounce,
                &[BufferCopy {
                    src_offset,
                    dst_offset: base,
                    size: num_bytes,
                }],
            );
            self.device.buffer_barrier(bounce, base, num_bytes);
            self.device.copy_buffer(
                bounce,
                dst_resource,
                &[BufferCopy {
                    src_offset: base,
                    dst_offset,
                    size: num_bytes,
                }],
            );
            if use_ring {
                self.device_buffer.commit(self.device.current_tick());
            } else {
                self.device.destroy_buffer(bounce);
            }
        } else {
            self.device.copy_buffer(
                src_resource,
                dst_resource,
                &[BufferCopy {
                    src_offset,
                    dst_offset,
                    size: num_bytes,
                }],
            );
        }
        self.device.buffer_barrier(dst_resource, dst_offset, num_bytes);
    }

    /// Bind the vertex streams of the current draw. Overlapping or adjacent
    /// streams are resolved as one range. Returns `false` if the draw has no
    /// vertex streams.
    pub fn bind_vertex_buffers(&self, provider: &dyn DrawStateProvider) -> bool {
        let bindings = provider.vertex_buffers();
        if bindings.is_empty() {
            return false;
        }

        let mut spans: SmallVec<[(VAddr, VAddr); 8]> = bindings
            .iter()
            .filter(|binding| binding.size > 0 && binding.address != 0)
            .map(|binding| (binding.address, binding.address + binding.size))
            .collect();
        spans.sort_unstable();
        let mut merged: SmallVec<[(VAddr, VAddr); 8]> = SmallVec::new();
        for (begin, end) in spans {
            if let Some(last) = merged.last_mut() {
                if begin <= last.1 {
                    last.1 = last.1.max(end);
                    continue;
                }
            }
            merged.push((begin, end));
        }
        for &(begin, end) in &merged {
            self.obtain_buffer(begin, end - begin, false);
        }

        // A later span may have merged an earlier one's buffer, so resolve
        // the final placement per binding.
        let handles: SmallVec<[(ResourceHandle, u64); 16]> = bindings
            .iter()
            .map(|binding| {
                if binding.size == 0 || binding.address == 0 {
                    return (ResourceHandle::NULL, 0);
                }
                let obtained = self
                    .lookup(binding.address, binding.size)
                    .unwrap_or_else(|| self.obtain_buffer(binding.address, binding.size, false));
                (obtained.resource, obtained.offset)
            })
            .collect();
        self.device.bind_vertex_buffers(0, &handles);
        true
    }

    /// Bind the index buffer of the current draw, starting `index_offset`
    /// indices in. Returns `false` if the draw is not indexed.
    pub fn bind_index_buffer(&self, provider: &dyn DrawStateProvider, index_offset: u32) -> bool {
        let Some(index) = provider.index_buffer() else {
            return false;
        };
        let size = index.size_bytes();
        if size == 0 {
            return false;
        }
        let addr = index.address + index_offset as u64 * index.index_type.size_bytes();
        let obtained = self.obtain_buffer(addr, size, false);
        self.device
            .bind_index_buffer(obtained.resource, obtained.offset, index.index_type);
        true
    }

    pub fn memory_barrier(&self) {
        self.device.memory_barrier();
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// A live buffer by id. Deleted and stale ids yield `None`.
    pub fn buffer(&self, id: BufferId) -> Option<MappedRwLockReadGuard<'_, Buffer>> {
        RwLockReadGuard::try_map(self.slots.read(), |slots| {
            slots.get(id).filter(|buffer| !buffer.is_deleted)
        })
        .ok()
    }

    /// Visit each registered buffer overlapping the range once, in address
    /// order. `func` must not call back into the cache.
    pub fn for_each_buffer_in_range(&self, addr: VAddr, size: u64, mut func: impl FnMut(BufferId, &Buffer)) {
        let state = self.state.read();
        let slots = self.slots.read();
        let mut ids: SmallVec<[BufferId; 8]> = SmallVec::new();
        state.buffer_ranges.for_each_in_range(addr, size, |_, _, id| {
            if !ids.contains(&id) {
                ids.push(id);
            }
        });
        for id in ids {
            func(id, &slots[id]);
        }
    }

    /// Device address backing guest address `addr`, as a raw device-address
    /// page table would map it.
    pub fn device_address_of(&self, addr: VAddr) -> Option<u64> {
        let state = self.state.read();
        let id = state.page_table.get(addr >> CACHING_PAGEBITS).buffer_id;
        let slots = self.slots.read();
        let buffer = slots
            .get(id)
            .filter(|buffer| !buffer.is_deleted && buffer.contains(addr, 1))?;
        Some(buffer.device_address() + buffer.offset_of(addr))
    }

    #[inline]
    pub fn stream_buffer_id(&self) -> BufferId {
        self.stream_buffer_id
    }

    #[inline]
    pub fn gds_buffer(&self) -> ResourceHandle {
        self.gds_buffer
    }

    #[inline]
    pub fn fault_buffer(&self) -> &FaultBuffer {
        &self.fault_buffer
    }

    /// The streaming pool serving `usage`.
    pub fn utility_buffer(&self, usage: MemoryUsage) -> &StreamBuffer {
        match usage {
            MemoryUsage::DeviceLocal => &self.device_buffer,
            MemoryUsage::Upload => &self.staging_buffer,
            MemoryUsage::Download => &self.download_buffer,
            MemoryUsage::Stream => &self.stream_buffer,
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn lookup(&self, addr: VAddr, size: u64) -> Option<ObtainedBuffer> {
        let state = self.state.read();
        let id = state.page_table.get(addr >> CACHING_PAGEBITS).buffer_id;
        let slots = self.slots.read();
        let buffer = slots
            .get(id)
            .filter(|buffer| !buffer.is_deleted && buffer.contains(addr, size))?;
        Some(ObtainedBuffer {
            id,
            resource: buffer.resource(),
            offset: buffer.offset_of(addr),
        })
    }

    fn gds_range(&self, offset: u64, size: u64) -> (ResourceHandle, u64) {
        assert!(
            offset + size <= self.settings.gds_buffer_size,
            "buffer cache: GDS access 0x{:X}+0x{:X} out of range",
            offset,
            size
        );
        (self.gds_buffer, offset)
    }

    fn allocate(&self, size: u64, usage: MemoryUsage, flags: BufferUsageFlags) -> ResourceHandle {
        match self.device.create_buffer(size, usage, flags) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("buffer cache: {:?} allocation of 0x{:X} bytes failed: {}", usage, size, err);
                panic!("buffer cache: device allocation failed: {}", err);
            }
        }
    }

    /// Wait for a device tick guarding a ring region, submitting the
    /// recording first if the tick is still open.
    fn wait_device_tick(&self, tick: u64) {
        if self.device.is_tick_complete(tick) {
            return;
        }
        if tick >= self.device.current_tick() {
            self.device.flush();
        }
        self.device.wait_tick(tick);
    }
}

impl Drop for BufferCache {
    fn drop(&mut self) {
        self.download_worker.stop();
        for (_, buffer) in self.slots.get_mut().iter() {
            if !buffer.is_shared_stream() {
                self.device.destroy_buffer(buffer.resource());
            }
        }
        self.device.destroy_buffer(self.gds_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::host::CompletionMode;
    use crate::backend::IndexType;
    use crate::buffer_cache::interfaces::{IndexBufferBinding, VertexBufferBinding};
    use crate::test_util::{test_cache, test_cache_with, test_settings, TestCache};
    use std::thread;
    use std::time::Duration;

    fn contents(env: &TestCache, obtained: ObtainedBuffer, len: usize) -> Vec<u8> {
        env.device.read_buffer(obtained.resource, obtained.offset, len)
    }

    fn live_buffers(cache: &BufferCache) -> Vec<(BufferId, VAddr, VAddr)> {
        let mut buffers = Vec::new();
        cache.for_each_buffer_in_range(0, ADDRESS_SPACE_SIZE, |id, buffer| {
            buffers.push((id, buffer.cpu_addr(), buffer.end_addr()))
        });
        buffers
    }

    fn assert_coverage(cache: &BufferCache) {
        let state = cache.state.read();
        let slots = cache.slots.read();
        let mut registered = Vec::new();
        state.buffer_ranges.for_each(|begin, end, id| registered.push((begin, end, id)));
        for (begin, end, id) in registered {
            let buffer = &slots[id];
            assert!(!buffer.is_deleted);
            assert_eq!(begin, align_down(buffer.cpu_addr(), CACHING_PAGESIZE));
            assert_eq!(end, align_up(buffer.end_addr(), CACHING_PAGESIZE));
            for page in begin >> CACHING_PAGEBITS..end >> CACHING_PAGEBITS {
                assert_eq!(state.page_table.get(page).buffer_id, id);
            }
            // Neighbouring pages belong to someone else.
            if begin > 0 {
                assert_ne!(state.page_table.get((begin >> CACHING_PAGEBITS) - 1).buffer_id, id);
            }
            assert_ne!(state.page_table.get(end >> CACHING_PAGEBITS).buffer_id, id);
        }
    }

    struct Draw {
        vertex: Vec<VertexBufferBinding>,
        index: Option<IndexBufferBinding>,
    }

    impl DrawStateProvider for Draw {
        fn vertex_buffers(&self) -> Vec<VertexBufferBinding> {
            self.vertex.clone()
        }

        fn index_buffer(&self) -> Option<IndexBufferBinding> {
            self.index
        }
    }

    #[test]
    fn test_obtain_creates_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        let obtained = env.cache.obtain_buffer(0x1000, 0x4000, false);
        assert_eq!(obtained.offset, 0);
        assert_ne!(obtained.id, NULL_BUFFER_ID);

        let buffer = env.cache.buffer(obtained.id).unwrap();
        assert!(buffer.contains(0x1000, 0x4000));
        assert!(env.cache.is_region_registered(0x1000, 0x4000));
        assert!(!env.cache.is_region_gpu_modified(0x1000, 0x4000));
    }

    #[test]
    fn test_obtain_uploads_guest_data() {
        let env = test_cache(CompletionMode::Immediate);
        env.guest.write(0x2000, &[1, 2, 3, 4]);
        let obtained = env.cache.obtain_buffer(0x2000, 0x100, false);
        assert_eq!(contents(&env, obtained, 4), vec![1, 2, 3, 4]);
        assert!(!env.cache.is_region_cpu_modified(0x2000, 0x100));
        assert!(env.cache.is_region_cpu_modified(0x2100, 0x100));
    }

    #[test]
    fn test_idempotent_reuse() {
        let env = test_cache(CompletionMode::Immediate);
        let first = env.cache.obtain_buffer(0x10000, 0x3000, false);
        let second = env.cache.obtain_buffer(0x10000, 0x3000, false);
        assert_eq!(first, second);

        // Any sub-range resolves to the same buffer too.
        let inner = env.cache.obtain_buffer(0x11000, 0x10, true);
        assert_eq!(inner.id, first.id);
        assert_eq!(inner.offset, 0x1000);
    }

    #[test]
    fn test_merge_overlapping() {
        let env = test_cache(CompletionMode::Immediate);
        env.guest.write(0x1000, &[0xAA; 16]);
        let first = env.cache.obtain_buffer(0x1000, 0x4000, false);
        let second = env.cache.obtain_buffer(0x3000, 0x6000, false);
        assert_ne!(first.id, second.id);
        assert!(env.cache.buffer(first.id).is_none());

        let buffers = live_buffers(&env.cache);
        assert_eq!(buffers.len(), 1);
        let (id, begin, end) = buffers[0];
        assert_eq!(id, second.id);
        assert!(begin <= 0x1000 && end >= 0x9000);
        assert_eq!(second.offset, 0x3000 - begin);

        // Content of the retired buffer was carried over.
        let merged = env.cache.obtain_buffer(0x1000, 16, false);
        assert_eq!(contents(&env, merged, 16), vec![0xAA; 16]);
        assert_coverage(&env.cache);
    }

    #[test]
    fn test_merge_spanning_several_buffers() {
        let env = test_cache(CompletionMode::Immediate);
        let a = env.cache.obtain_buffer(0x0, 0x4000, false);
        let b = env.cache.obtain_buffer(0x8000, 0x4000, false);
        let c = env.cache.obtain_buffer(0x14000, 0x100, false);
        assert_eq!(live_buffers(&env.cache).len(), 3);

        let merged = env.cache.obtain_buffer(0x2000, 0x13000, false);
        for old in [a.id, b.id, c.id] {
            assert!(env.cache.buffer(old).is_none());
        }
        let buffers = live_buffers(&env.cache);
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].0, merged.id);
        assert_eq!(buffers[0].1, 0);
        assert_eq!(env.cache.buffer(merged.id).unwrap().stream_score(), 3);
        assert_coverage(&env.cache);
    }

    #[test]
    fn test_no_overlap_after_merges() {
        let env = test_cache(CompletionMode::Immediate);
        let requests = [
            (0x1000, 0x800),
            (0x9000, 0x2000),
            (0x4000, 0x100),
            (0x3F00, 0x6000),
            (0x20000, 0x4000),
            (0x1F000, 0x2000),
            (0x7FF0, 0x20),
            (0x30000, 0x10),
        ];
        for (addr, size) in requests {
            let obtained = env.cache.obtain_buffer(addr, size, false);
            assert!(env.cache.buffer(obtained.id).unwrap().contains(addr, size));
            assert_coverage(&env.cache);
        }

        let mut buffers = live_buffers(&env.cache);
        buffers.sort_by_key(|&(_, begin, _)| begin);
        for pair in buffers.windows(2) {
            assert!(align_up(pair[0].2, CACHING_PAGESIZE) <= align_down(pair[1].1, CACHING_PAGESIZE));
        }
    }

    #[test]
    fn test_growth_margin() {
        let settings = BufferCacheSettings {
            growth_margin: 0x10000,
            ..test_settings()
        };
        let env = test_cache_with(&settings, CompletionMode::Immediate, None);
        let obtained = env.cache.obtain_buffer(0x4000, 0x10, false);
        let buffer = env.cache.buffer(obtained.id).unwrap();
        assert_eq!(buffer.cpu_addr(), 0x4000);
        assert_eq!(buffer.end_addr(), 0x18000);
    }

    #[test]
    fn test_stream_leap() {
        let settings = BufferCacheSettings {
            stream_leap_threshold: 1,
            stream_leap_growth: 4 * CACHING_PAGESIZE,
            ..test_settings()
        };
        let env = test_cache_with(&settings, CompletionMode::Immediate, None);
        let base = 0x100000;
        env.cache.obtain_buffer(base, 0x4000, false);
        let second = env.cache.obtain_buffer(base, 0x8000, false);
        assert_eq!(env.cache.buffer(second.id).unwrap().stream_score(), 1);
        let third = env.cache.obtain_buffer(base, 0xC000, false);
        assert_eq!(env.cache.buffer(third.id).unwrap().stream_score(), 2);

        // Accumulated score now exceeds the threshold.
        let leap = env.cache.obtain_buffer(base, 0x10000, false);
        let buffer = env.cache.buffer(leap.id).unwrap();
        assert_eq!(buffer.stream_score(), 0);
        assert_eq!(buffer.cpu_addr(), base - 4 * CACHING_PAGESIZE);
        assert_eq!(buffer.end_addr(), base + 0x10000 + 4 * CACHING_PAGESIZE);
        assert_eq!(leap.offset, 4 * CACHING_PAGESIZE);
    }

    #[test]
    fn test_transient_stream_path() {
        let env = test_cache(CompletionMode::Immediate);
        env.guest.write(0x40000, &[7, 7, 7]);
        let transient = env.cache.obtain_transient(0x40000, 0x100);
        assert_eq!(transient.id, env.cache.stream_buffer_id());
        assert_eq!(transient.offset % STREAM_ALIGNMENT, 0);
        assert_eq!(contents(&env, transient, 3), vec![7, 7, 7]);
        assert!(!env.cache.is_region_registered(0x40000, 0x100));

        // Registered memory goes through the cache.
        let cached = env.cache.obtain_buffer(0x40000, 0x4000, false);
        let again = env.cache.obtain_transient(0x40000, 0x100);
        assert_eq!(again.id, cached.id);
    }

    #[test]
    fn test_stream_buffer_excluded_from_merge() {
        let env = test_cache(CompletionMode::Immediate);
        let stream_id = env.cache.stream_buffer_id();
        let left = env.cache.obtain_buffer(0x20000, 0x100, false);
        {
            let mut state = env.cache.state.write();
            for page in (0x24000 >> CACHING_PAGEBITS)..(0x2C000 >> CACHING_PAGEBITS) {
                state.page_table.get_mut(page).buffer_id = stream_id;
            }
        }
        {
            let state = env.cache.state.read();
            let slots = env.cache.slots.read();
            let overlap = env.cache.resolve_overlaps(&state, &slots, 0x20000, 0xC000);
            assert!(overlap.has_stream_buffer);
            assert_eq!(overlap.ids.as_slice(), &[left.id]);
        }

        let merged = env.cache.obtain_buffer(0x20000, 0xC000, false);
        assert_ne!(merged.id, stream_id);
        assert!(env.cache.buffer(left.id).is_none());
        let stream = env.cache.buffer(stream_id).unwrap();
        assert!(stream.is_shared_stream());
        assert!(!stream.is_deleted);
    }

    #[test]
    fn test_find_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        assert_eq!(env.cache.find_buffer(0, 0x100), NULL_BUFFER_ID);
        let id = env.cache.find_buffer(0x8000, 0x100);
        assert!(!id.is_null());
        assert_eq!(env.cache.find_buffer(0x8010, 0x10), id);
        assert_eq!(env.cache.obtain_buffer(0x8000, 0x100, false).id, id);
    }

    #[test]
    fn test_dirty_round_trip() {
        let env = test_cache(CompletionMode::Immediate);
        env.guest.write(0x5000, &[1; 8]);
        let first = env.cache.obtain_buffer(0x5000, 0x100, false);
        assert_eq!(contents(&env, first, 8), vec![1; 8]);

        // Without an invalidation the cached copy is trusted.
        env.guest.write(0x5000, &[2; 8]);
        let stale = env.cache.obtain_buffer(0x5000, 0x100, false);
        assert_eq!(contents(&env, stale, 8), vec![1; 8]);

        env.cache.invalidate_memory(0x5000, 8);
        assert!(env.cache.is_region_cpu_modified(0x5000, 8));
        let fresh = env.cache.obtain_buffer(0x5000, 0x100, false);
        assert_eq!(contents(&env, fresh, 8), vec![2; 8]);

        let events = env.watcher.events();
        assert!(events.contains(&(0x5000, 0x100, true)));
        assert!(events.contains(&(0x5000, 0x1000, false)));
    }

    #[test]
    fn test_invalidate_deletes_covered_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        let obtained = env.cache.obtain_buffer(0x4000, 0x4000, false);
        env.cache.invalidate_memory(0x4000, 0x4000);
        assert!(env.cache.buffer(obtained.id).is_none());
        assert!(!env.cache.is_region_registered(0x4000, 0x4000));
        assert_coverage(&env.cache);
    }

    #[test]
    fn test_invalidate_keeps_gpu_modified_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        let obtained = env.cache.obtain_buffer(0x4000, 0x4000, true);
        env.cache.invalidate_memory(0x4000, 0x4000);
        assert!(env.cache.buffer(obtained.id).is_some());
        assert!(!env.cache.is_region_gpu_modified(0x4000, 0x4000));
        // The dropped write is no longer scheduled.
        assert!(!env.cache.commit_pending_downloads(false));
    }

    #[test]
    fn test_invalidate_keeps_unflushed_gpu_bytes_in_shared_page() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.inline_data(0x1000, &[0xAB; 16], false);

        // A CPU write elsewhere in the same host page.
        env.guest.write(0x1800, &[7]);
        env.cache.invalidate_memory(0x1800, 1);
        assert!(env.cache.is_region_gpu_modified(0x1000, 0x10));
        assert!(env.cache.is_region_cpu_modified(0x1800, 1));

        let obtained = env.cache.obtain_buffer(0x1000, 0x1000, false);
        assert_eq!(contents(&env, obtained, 16), vec![0xAB; 16]);
        let neighbour = ObtainedBuffer {
            offset: obtained.offset + 0x800,
            ..obtained
        };
        assert_eq!(contents(&env, neighbour, 1), vec![7]);

        assert!(env.cache.commit_pending_downloads(true));
        let mut guest = [0u8; 16];
        env.guest.read(0x1000, &mut guest);
        assert_eq!(guest, [0xAB; 16]);
        let mut byte = [0u8; 1];
        env.guest.read(0x1800, &mut byte);
        assert_eq!(byte, [7]);
    }

    #[test]
    fn test_invalidate_unregistered_is_ignored() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.invalidate_memory(0x9000, 0x100);
        assert!(env.watcher.events().is_empty());
    }

    #[test]
    fn test_commit_downloads_to_guest() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.inline_data(0x1000, &[5, 6, 7, 8], false);
        assert!(env.cache.is_region_gpu_modified(0x1000, 4));

        assert!(env.cache.commit_pending_downloads(true));
        assert_eq!(env.cache.download_tick(), 1);
        assert!(!env.cache.is_region_gpu_modified(0x1000, 4));
        let mut bytes = [0u8; 4];
        env.guest.read(0x1000, &mut bytes);
        assert_eq!(bytes, [5, 6, 7, 8]);

        // Nothing left to do.
        assert!(!env.cache.commit_pending_downloads(true));
    }

    #[test]
    fn test_read_waits_for_download() {
        let env = test_cache(CompletionMode::Manual);
        env.cache.obtain_buffer(0x1000, 0x1000, true);
        env.cache.inline_data(0x1000, &[0x5A; 32], false);
        assert!(env.cache.commit_pending_downloads(false));
        let gpu_tick = env.device.last_submitted_tick();

        thread::scope(|scope| {
            let reader = scope.spawn(|| {
                env.cache.read_memory(0x1000, 0x800);
                let mut bytes = [0u8; 32];
                env.guest.read(0x1000, &mut bytes);
                (env.cache.download_tick(), bytes)
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!reader.is_finished());
            assert_eq!(env.cache.download_tick(), 0);

            env.device.signal(gpu_tick);
            let (tick, bytes) = reader.join().unwrap();
            assert!(tick >= 1);
            assert_eq!(bytes, [0x5A; 32]);
        });
    }

    #[test]
    fn test_download_ticks_monotonic() {
        let env = test_cache(CompletionMode::Immediate);
        let mut last = env.cache.download_tick();
        for i in 0..5u64 {
            let addr = 0x10000 + i * 0x8000;
            env.cache.inline_data(addr, &[i as u8; 16], false);
            assert!(env.cache.commit_pending_downloads(i % 2 == 0));
            env.cache.read_memory(addr, 16);
            let tick = env.cache.download_tick();
            assert!(tick >= last);
            last = tick;
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_large_download_uses_temporary_buffer() {
        let settings = BufferCacheSettings {
            download_buffer_size: 0x1000,
            ..test_settings()
        };
        let env = test_cache_with(&settings, CompletionMode::Immediate, None);
        let data: Vec<u8> = (0..0x8000u32).map(|i| (i % 251) as u8).collect();
        env.cache.inline_data(0x20000, &data, false);
        assert!(env.cache.commit_pending_downloads(true));

        let mut bytes = vec![0u8; data.len()];
        env.guest.read(0x20000, &mut bytes);
        assert_eq!(bytes, data);
    }

    #[test]
    fn test_process_fault_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.fault_buffer().mark_fault(0x2000);
        env.cache.fault_buffer().mark_fault(0x8000);
        assert_eq!(env.cache.process_fault_buffer(), 2);

        assert!(!env.cache.fault_buffer().is_faulted(0x2000));
        assert!(!env.cache.fault_buffer().is_faulted(0x8000));
        assert!(env.cache.is_region_registered(0x2000, 1));
        assert!(env.cache.is_region_registered(0x8000, 1));
        assert!(env.cache.is_region_gpu_modified(0x8000, 1));
        assert_eq!(live_buffers(&env.cache).len(), 2);
        assert!(env.cache.device_address_of(0x2000).is_some());

        assert_eq!(env.cache.process_fault_buffer(), 0);
    }

    #[test]
    fn test_device_address_of() {
        let env = test_cache(CompletionMode::Immediate);
        assert_eq!(env.cache.device_address_of(0x6000), None);
        let obtained = env.cache.obtain_buffer(0x6000, 0x100, false);
        let base = env.cache.buffer(obtained.id).unwrap().device_address();
        assert_eq!(env.cache.device_address_of(0x6010), Some(base + 0x10));
    }

    #[test]
    fn test_obtain_buffer_for_image() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.obtain_buffer(0x8000, 0x1000, false);
        assert!(env.cache.obtain_buffer_for_image(0x8000, 0x1000).is_none());

        let written = env.cache.obtain_buffer(0x8000, 0x1000, true);
        assert_eq!(env.cache.obtain_buffer_for_image(0x8000, 0x1000), Some(written));
        assert!(env.cache.obtain_buffer_for_image(0x8000, 0x100000).is_none());
    }

    #[test]
    fn test_copy_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        env.guest.write(0x1000, &[3; 64]);
        env.cache.copy_buffer(0x9000, 0x1000, 64, false, false);

        let dst = env.cache.obtain_buffer(0x9000, 64, false);
        assert_eq!(contents(&env, dst, 64), vec![3; 64]);
        assert!(env.cache.is_region_gpu_modified(0x9000, 64));
        assert!(!env.cache.is_region_gpu_modified(0x1000, 64));
    }

    #[test]
    fn test_overlapping_copy_bounces() {
        let env = test_cache(CompletionMode::Immediate);
        let data: Vec<u8> = (0..0x40u8).collect();
        env.guest.write(0x1000, &data);
        env.cache.obtain_buffer(0x1000, 0x100, false);

        let copies = env.device.stats().copies;
        env.cache.copy_buffer(0x1010, 0x1000, 0x40, false, false);
        assert_eq!(env.device.stats().copies, copies + 2);

        let dst = env.cache.obtain_buffer(0x1010, 0x40, false);
        assert_eq!(contents(&env, dst, 0x40), data);
    }

    #[test]
    fn test_gds_inline_and_copy() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.inline_data(0x10, &[1, 2, 3, 4], true);
        assert_eq!(env.device.read_buffer(env.cache.gds_buffer(), 0x10, 4), vec![1, 2, 3, 4]);

        env.cache.copy_buffer(0x3000, 0x10, 4, false, true);
        let dst = env.cache.obtain_buffer(0x3000, 4, false);
        assert_eq!(contents(&env, dst, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    #[should_panic]
    fn test_gds_out_of_range() {
        let env = test_cache(CompletionMode::Immediate);
        let size = test_settings().gds_buffer_size;
        env.cache.inline_data(size - 2, &[0; 4], true);
    }

    #[test]
    fn test_bind_vertex_buffers() {
        let env = test_cache(CompletionMode::Immediate);
        let draw = Draw {
            vertex: vec![
                VertexBufferBinding { address: 0x1000, size: 0x100, stride: 16 },
                VertexBufferBinding { address: 0x1100, size: 0x100, stride: 16 },
                VertexBufferBinding { address: 0, size: 0, stride: 0 },
                VertexBufferBinding { address: 0x80000, size: 0x40, stride: 4 },
            ],
            index: None,
        };
        assert!(env.cache.bind_vertex_buffers(&draw));

        let bindings = env.device.vertex_bindings();
        assert_eq!(bindings.len(), 4);
        assert_eq!(bindings[0].0, bindings[1].0);
        assert_eq!(bindings[1].1 - bindings[0].1, 0x100);
        assert_eq!(bindings[2], (ResourceHandle::NULL, 0));
        assert_ne!(bindings[3].0, bindings[0].0);

        let empty = Draw { vertex: Vec::new(), index: None };
        assert!(!env.cache.bind_vertex_buffers(&empty));
    }

    #[test]
    fn test_bind_index_buffer() {
        let env = test_cache(CompletionMode::Immediate);
        let draw = Draw {
            vertex: Vec::new(),
            index: Some(IndexBufferBinding {
                address: 0x6000,
                count: 12,
                index_type: IndexType::U16,
            }),
        };
        assert!(env.cache.bind_index_buffer(&draw, 4));
        let (handle, offset, index_type) = env.device.index_binding().unwrap();
        let expected = env.cache.obtain_buffer(0x6008, 24, false);
        assert_eq!((handle, offset), (expected.resource, expected.offset));
        assert_eq!(index_type, IndexType::U16);

        let unindexed = Draw { vertex: Vec::new(), index: None };
        assert!(!env.cache.bind_index_buffer(&unindexed, 0));
    }

    #[test]
    fn test_synchronize_buffers_in_range() {
        let env = test_cache(CompletionMode::Immediate);
        let obtained = env.cache.obtain_buffer(0x10000, 0x8000, false);
        env.guest.write(0x11000, &[9; 4]);
        env.cache.invalidate_memory(0x11000, 4);
        assert!(env.cache.is_region_cpu_modified(0x11000, 4));

        env.cache.synchronize_buffers_in_range(0x10000, 0x8000);
        assert!(!env.cache.is_region_cpu_modified(0x10000, 0x8000));
        assert_eq!(env.device.read_buffer(obtained.resource, 0x1000, 4), vec![9; 4]);
    }

    #[test]
    fn test_synchronize_dma_buffers() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.obtain_buffer(0x1000, 0x10, false);
        env.cache.obtain_buffer(0x40000, 0x10, false);
        assert!(env.cache.is_region_cpu_modified(0x1010, 0x10));

        let barriers = env.device.stats().barriers;
        env.cache.synchronize_dma_buffers();
        assert!(!env.cache.is_region_cpu_modified(0x1000, 0x3000));
        assert!(!env.cache.is_region_cpu_modified(0x40000, 0x4000));
        assert!(env.device.stats().barriers > barriers);
    }

    #[test]
    fn test_deleted_buffers_reclaimed_after_tick() {
        let env = test_cache(CompletionMode::Manual);
        let first = env.cache.obtain_buffer(0x1000, 0x100, false);
        env.cache.obtain_buffer(0x1000, 0x8000, false);
        assert!(env.cache.buffer(first.id).is_none());
        assert_eq!(env.cache.state.read().pending_deletions.len(), 1);

        // The tick open at deletion time has not completed yet.
        env.cache.commit_pending_downloads(false);
        assert_eq!(env.cache.state.read().pending_deletions.len(), 1);

        let tick = env.device.flush();
        env.device.signal(tick);
        env.cache.commit_pending_downloads(false);
        assert!(env.cache.state.read().pending_deletions.is_empty());
        assert!(env.cache.slots.read().get(first.id).is_none());
    }

    #[test]
    fn test_utility_buffers() {
        let env = test_cache(CompletionMode::Immediate);
        let settings = test_settings();
        let cache = &env.cache;
        assert_eq!(cache.utility_buffer(MemoryUsage::Upload).size(), settings.staging_buffer_size);
        assert_eq!(cache.utility_buffer(MemoryUsage::Stream).size(), settings.stream_buffer_size);
        assert_eq!(cache.utility_buffer(MemoryUsage::Download).size(), settings.download_buffer_size);
        assert_eq!(cache.utility_buffer(MemoryUsage::DeviceLocal).size(), settings.device_buffer_size);
        assert_eq!(cache.utility_buffer(MemoryUsage::Stream).usage(), MemoryUsage::Stream);
    }

    #[test]
    fn test_image_source_satisfies_upload() {
        struct Filler {
            device: Arc<crate::backend::host::HostDevice>,
        }

        impl ImageSource for Filler {
            fn try_copy_to_buffer(&self, addr: VAddr, size: u64, dst: ResourceHandle, dst_offset: u64) -> bool {
                if addr < 0x20000 {
                    return false;
                }
                self.device.update_buffer(dst, dst_offset, &vec![0xEE; size as usize]);
                true
            }
        }

        let device = Arc::new(crate::backend::host::HostDevice::new());
        let filler: Arc<dyn ImageSource> = Arc::new(Filler { device: device.clone() });
        let env = crate::test_util::test_cache_on(&test_settings(), device, Some(filler));
        env.guest.write(0x20000, &[1; 4]);
        let from_image = env.cache.obtain_buffer(0x20000, 0x10, false);
        assert_eq!(contents(&env, from_image, 4), vec![0xEE; 4]);

        env.guest.write(0x1000, &[1; 4]);
        let from_guest = env.cache.obtain_buffer(0x1000, 0x10, false);
        assert_eq!(contents(&env, from_guest, 4), vec![1; 4]);
    }

    #[test]
    fn test_resolve_overlaps_reports_extent() {
        let env = test_cache(CompletionMode::Immediate);
        let left = env.cache.obtain_buffer(0x1000, 0x100, false);
        let right = env.cache.obtain_buffer(0xC000, 0x4000, false);

        let state = env.cache.state.read();
        let slots = env.cache.slots.read();
        let overlap = env.cache.resolve_overlaps(&state, &slots, 0x2000, 0xB000);
        assert_eq!(overlap.ids.as_slice(), &[left.id, right.id]);
        assert_eq!(overlap.begin, 0x1000);
        assert_eq!(overlap.end, 0x10000);
        assert!(!overlap.has_stream_leap);
        assert!(!overlap.has_stream_buffer);
    }

    #[test]
    #[should_panic]
    fn test_out_of_address_space() {
        let env = test_cache(CompletionMode::Immediate);
        env.cache.obtain_buffer(ADDRESS_SPACE_SIZE - 0x10, 0x20, false);
    }
}
