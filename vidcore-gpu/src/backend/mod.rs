// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device/queue service abstraction.
//!
//! The buffer cache only needs a narrow slice of a graphics device: buffer
//! allocation, mapped access to host-visible buffers, copy and barrier
//! recording, and submission ticks. Backends implement [`Device`]; the
//! software [`host::HostDevice`] executes everything on host memory.

pub mod host;

use bitflags::bitflags;
use thiserror::Error;

/// Opaque handle to a device buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourceHandle(pub u64);

impl ResourceHandle {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Memory placement of a buffer, mirroring the four streaming pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device local, not host visible.
    DeviceLocal,
    /// Host visible, written by the CPU and read by the GPU.
    Upload,
    /// Host visible, written by the GPU and read by the CPU.
    Download,
    /// Host visible and device local, used for short-lived per-draw data.
    Stream,
}

impl MemoryUsage {
    /// Whether buffers with this usage can be accessed through a host mapping.
    #[inline]
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }
}

bitflags! {
    /// How a buffer may be bound or used by device commands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsageFlags: u32 {
        const TRANSFER_SRC   = 1 << 0;
        const TRANSFER_DST   = 1 << 1;
        const UNIFORM        = 1 << 2;
        const STORAGE        = 1 << 3;
        const INDEX          = 1 << 4;
        const VERTEX         = 1 << 5;
        const INDIRECT       = 1 << 6;
        const TEXEL          = 1 << 7;
        const DEVICE_ADDRESS = 1 << 8;

        const TRANSFER = Self::TRANSFER_SRC.bits() | Self::TRANSFER_DST.bits();
        /// Everything a guest-backed buffer may be bound as.
        const ALL = Self::TRANSFER.bits()
            | Self::UNIFORM.bits()
            | Self::STORAGE.bits()
            | Self::INDEX.bits()
            | Self::VERTEX.bits()
            | Self::INDIRECT.bits()
            | Self::TEXEL.bits()
            | Self::DEVICE_ADDRESS.bits();
    }
}

/// One region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Index element width for index buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    #[inline]
    pub const fn size_bytes(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }
}

/// Device errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory (requested {requested:#X}, available {available:#X})")]
    OutOfMemory { requested: u64, available: u64 },

    #[error("unknown resource handle {0:?}")]
    UnknownResource(ResourceHandle),

    #[error("resource {0:?} is not host visible")]
    NotHostVisible(ResourceHandle),
}

/// Trait for the graphics device and its submission queue.
///
/// Command recording methods append work to the current command buffer.
/// [`Device::flush`] submits it and returns the tick that completes when
/// the submission has executed. Resources passed to `destroy_buffer` may
/// still be referenced by in-flight work; the device defers the actual
/// release as needed.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    fn create_buffer(
        &self,
        size: u64,
        usage: MemoryUsage,
        flags: BufferUsageFlags,
    ) -> Result<ResourceHandle, DeviceError>;

    fn destroy_buffer(&self, handle: ResourceHandle);

    /// GPU virtual address of the start of the buffer, for raw device access.
    fn device_address(&self, _handle: ResourceHandle) -> u64 {
        0
    }

    /// Write through the host mapping of a host-visible buffer.
    fn write_mapped(&self, handle: ResourceHandle, offset: u64, data: &[u8]);

    /// Read through the host mapping of a host-visible buffer.
    fn read_mapped(&self, handle: ResourceHandle, offset: u64, dst: &mut [u8]);

    /// Record a small inline update carried in the command stream.
    fn update_buffer(&self, handle: ResourceHandle, offset: u64, data: &[u8]);

    fn copy_buffer(&self, src: ResourceHandle, dst: ResourceHandle, copies: &[BufferCopy]);

    /// Order prior transfers to `handle` before subsequent shader access.
    fn buffer_barrier(&self, _handle: ResourceHandle, _offset: u64, _size: u64) {}

    /// Global memory barrier, used for buffers reached through raw addresses.
    fn memory_barrier(&self) {}

    fn bind_vertex_buffers(&self, _first_binding: u32, _buffers: &[(ResourceHandle, u64)]) {}

    fn bind_index_buffer(&self, _handle: ResourceHandle, _offset: u64, _index_type: IndexType) {}

    /// Submit recorded work. Returns the tick signalled on completion.
    fn flush(&self) -> u64;

    /// Tick that the next submission will signal.
    fn current_tick(&self) -> u64;

    fn is_tick_complete(&self, tick: u64) -> bool;

    /// Block until `tick` has been signalled by the device.
    fn wait_tick(&self, tick: u64);
}
