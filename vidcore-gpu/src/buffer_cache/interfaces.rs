// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Collaborators the buffer cache consumes but does not own.

use vidcore_common::VAddr;

use crate::backend::{IndexType, ResourceHandle};

/// Image cache hook used while synchronizing a buffer.
pub trait ImageSource: Send + Sync {
    /// Fill `size` bytes of `dst` at `dst_offset` with the image-backed
    /// contents of guest range `[addr, addr + size)`. Returns `false` when
    /// no image covers the range and guest memory should be used instead.
    fn try_copy_to_buffer(
        &self,
        addr: VAddr,
        size: u64,
        dst: ResourceHandle,
        dst_offset: u64,
    ) -> bool;
}

/// A vertex stream as decoded from the current draw state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub address: VAddr,
    pub size: u64,
    pub stride: u32,
}

/// The index buffer of the current draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub address: VAddr,
    pub count: u32,
    pub index_type: IndexType,
}

impl IndexBufferBinding {
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.count as u64 * self.index_type.size_bytes()
    }
}

/// Command-processor state read when binding buffers for a draw.
pub trait DrawStateProvider {
    /// Vertex streams in binding order. Disabled slots have size 0.
    fn vertex_buffers(&self) -> Vec<VertexBufferBinding>;

    fn index_buffer(&self) -> Option<IndexBufferBinding>;
}
