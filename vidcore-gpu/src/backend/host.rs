// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host-memory device backend.
//!
//! Every buffer is a `Vec<u8>` and every recorded command executes at record
//! time, so submission order equals execution order. Ticks either complete as
//! soon as they are submitted, or only when [`HostDevice::signal`] is called,
//! which lets callers hold the GPU timeline back.

use std::collections::HashMap;

use parking_lot::{Condvar, Mutex};

use super::{
    BufferCopy, BufferUsageFlags, Device, DeviceError, IndexType, MemoryUsage, ResourceHandle,
};

/// Base of the fake device address range handed out to buffers.
const DEVICE_ADDRESS_BASE: u64 = 0x1_0000_0000;

/// Device address alignment between consecutive buffers.
const DEVICE_ADDRESS_ALIGN: u64 = 0x1_0000;

/// How submitted ticks complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// A tick completes when it is submitted.
    Immediate,
    /// A tick completes only when explicitly signalled.
    Manual,
}

/// Counters exposed for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub buffers_created: u64,
    pub buffers_destroyed: u64,
    pub copies: u64,
    pub bytes_copied: u64,
    pub inline_updates: u64,
    pub barriers: u64,
    pub submissions: u64,
}

struct HostBuffer {
    data: Vec<u8>,
    usage: MemoryUsage,
    device_address: u64,
}

struct HostState {
    buffers: HashMap<u64, HostBuffer>,
    next_handle: u64,
    next_device_address: u64,
    allocated: u64,
    /// Resources released once the paired tick completes.
    pending_destroy: Vec<(u64, ResourceHandle)>,
    vertex_bindings: Vec<(ResourceHandle, u64)>,
    index_binding: Option<(ResourceHandle, u64, IndexType)>,
    stats: HostDeviceStats,
    /// Tick the next submission will signal.
    current_tick: u64,
    completed_tick: u64,
}

/// Software device that keeps all buffers in host memory.
pub struct HostDevice {
    state: Mutex<HostState>,
    tick_cv: Condvar,
    mode: CompletionMode,
    memory_budget: u64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::with_config(CompletionMode::Immediate, u64::MAX)
    }

    pub fn with_config(mode: CompletionMode, memory_budget: u64) -> Self {
        Self {
            state: Mutex::new(HostState {
                buffers: HashMap::new(),
                next_handle: 1,
                next_device_address: DEVICE_ADDRESS_BASE,
                allocated: 0,
                pending_destroy: Vec::new(),
                vertex_bindings: Vec::new(),
                index_binding: None,
                stats: HostDeviceStats::default(),
                current_tick: 1,
                completed_tick: 0,
            }),
            tick_cv: Condvar::new(),
            mode,
            memory_budget,
        }
    }

    /// Mark every tick up to `tick` as complete and wake waiters.
    pub fn signal(&self, tick: u64) {
        let mut state = self.state.lock();
        if tick > state.completed_tick {
            state.completed_tick = tick;
            Self::release_completed(&mut state);
        }
        log::trace!("host device: signalled tick {}", tick);
        self.tick_cv.notify_all();
    }

    /// Highest tick handed out by `flush` so far.
    pub fn last_submitted_tick(&self) -> u64 {
        self.state.lock().current_tick - 1
    }

    pub fn stats(&self) -> HostDeviceStats {
        self.state.lock().stats
    }

    /// Number of live (not yet released) resources.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Read buffer contents directly, bypassing host visibility.
    pub fn read_buffer(&self, handle: ResourceHandle, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let Some(buffer) = state.buffers.get(&handle.0) else {
            panic!("host device: read of unknown buffer {:?}", handle);
        };
        let start = offset as usize;
        buffer.data[start..start + len].to_vec()
    }

    pub fn vertex_bindings(&self) -> Vec<(ResourceHandle, u64)> {
        self.state.lock().vertex_bindings.clone()
    }

    pub fn index_binding(&self) -> Option<(ResourceHandle, u64, IndexType)> {
        self.state.lock().index_binding
    }

    fn release_completed(state: &mut HostState) {
        let completed = state.completed_tick;
        let mut released = Vec::new();
        state.pending_destroy.retain(|&(tick, handle)| {
            if tick <= completed {
                released.push(handle);
                false
            } else {
                true
            }
        });
        for handle in released {
            if let Some(buffer) = state.buffers.remove(&handle.0) {
                state.allocated -= buffer.data.len() as u64;
                state.stats.buffers_destroyed += 1;
            }
        }
    }

    fn buffer_mut(state: &mut HostState, handle: ResourceHandle) -> &mut HostBuffer {
        match state.buffers.get_mut(&handle.0) {
            Some(buffer) => buffer,
            None => panic!("host device: {}", DeviceError::UnknownResource(handle)),
        }
    }

    fn mapped_mut(state: &mut HostState, handle: ResourceHandle) -> &mut HostBuffer {
        let buffer = Self::buffer_mut(state, handle);
        if !buffer.usage.is_host_visible() {
            panic!("host device: {}", DeviceError::NotHostVisible(handle));
        }
        buffer
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        "host"
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: MemoryUsage,
        _flags: BufferUsageFlags,
    ) -> Result<ResourceHandle, DeviceError> {
        let mut state = self.state.lock();
        let available = self.memory_budget.saturating_sub(state.allocated);
        if size > available {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available,
            });
        }

        let handle = ResourceHandle(state.next_handle);
        state.next_handle += 1;
        let device_address = state.next_device_address;
        state.next_device_address += vidcore_common::align_up(size.max(1), DEVICE_ADDRESS_ALIGN);
        state.allocated += size;
        state.stats.buffers_created += 1;
        state.buffers.insert(
            handle.0,
            HostBuffer {
                data: vec![0u8; size as usize],
                usage,
                device_address,
            },
        );
        log::trace!(
            "host device: create {:?} size=0x{:X} usage={:?}",
            handle,
            size,
            usage
        );
        Ok(handle)
    }

    fn destroy_buffer(&self, handle: ResourceHandle) {
        let mut state = self.state.lock();
        let tick = state.current_tick;
        state.pending_destroy.push((tick, handle));
        if tick <= state.completed_tick {
            Self::release_completed(&mut state);
        }
    }

    fn device_address(&self, handle: ResourceHandle) -> u64 {
        let mut state = self.state.lock();
        Self::buffer_mut(&mut state, handle).device_address
    }

    fn write_mapped(&self, handle: ResourceHandle, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let buffer = Self::mapped_mut(&mut state, handle);
        let start = offset as usize;
        buffer.data[start..start + data.len()].copy_from_slice(data);
    }

    fn read_mapped(&self, handle: ResourceHandle, offset: u64, dst: &mut [u8]) {
        let mut state = self.state.lock();
        let buffer = Self::mapped_mut(&mut state, handle);
        let start = offset as usize;
        dst.copy_from_slice(&buffer.data[start..start + dst.len()]);
    }

    fn update_buffer(&self, handle: ResourceHandle, offset: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let buffer = Self::buffer_mut(&mut state, handle);
        let start = offset as usize;
        buffer.data[start..start + data.len()].copy_from_slice(data);
        state.stats.inline_updates += 1;
    }

    fn copy_buffer(&self, src: ResourceHandle, dst: ResourceHandle, copies: &[BufferCopy]) {
        let mut state = self.state.lock();
        for copy in copies {
            let src_start = copy.src_offset as usize;
            let len = copy.size as usize;
            let bytes = Self::buffer_mut(&mut state, src).data[src_start..src_start + len].to_vec();
            let dst_start = copy.dst_offset as usize;
            Self::buffer_mut(&mut state, dst).data[dst_start..dst_start + len]
                .copy_from_slice(&bytes);
            state.stats.copies += 1;
            state.stats.bytes_copied += copy.size;
        }
    }

    fn buffer_barrier(&self, _handle: ResourceHandle, _offset: u64, _size: u64) {
        self.state.lock().stats.barriers += 1;
    }

    fn memory_barrier(&self) {
        self.state.lock().stats.barriers += 1;
    }

    fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[(ResourceHandle, u64)]) {
        let mut state = self.state.lock();
        let first = first_binding as usize;
        if state.vertex_bindings.len() < first + buffers.len() {
            state
                .vertex_bindings
                .resize(first + buffers.len(), (ResourceHandle::NULL, 0));
        }
        state.vertex_bindings[first..first + buffers.len()].copy_from_slice(buffers);
    }

    fn bind_index_buffer(&self, handle: ResourceHandle, offset: u64, index_type: IndexType) {
        self.state.lock().index_binding = Some((handle, offset, index_type));
    }

    fn flush(&self) -> u64 {
        let mut state = self.state.lock();
        let tick = state.current_tick;
        state.current_tick += 1;
        state.stats.submissions += 1;
        if self.mode == CompletionMode::Immediate {
            state.completed_tick = tick;
            Self::release_completed(&mut state);
            self.tick_cv.notify_all();
        }
        tick
    }

    fn current_tick(&self) -> u64 {
        self.state.lock().current_tick
    }

    fn is_tick_complete(&self, tick: u64) -> bool {
        self.state.lock().completed_tick >= tick
    }

    fn wait_tick(&self, tick: u64) {
        let mut state = self.state.lock();
        while state.completed_tick < tick {
            self.tick_cv.wait(&mut state);
        }
    }
}
