// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest buffer cache.
//!
//! Maps the 40-bit guest address space onto device buffers and keeps the
//! CPU and GPU views of guest memory coherent.

pub mod buffer;
pub mod cache;
pub mod download;
pub mod fault_buffer;
pub mod interfaces;
pub mod memory_tracker;
pub mod page_table;
pub mod range_set;
pub mod slot_vector;
pub mod stream_buffer;

pub use buffer::{Buffer, BufferId, NULL_BUFFER_ID};
pub use cache::{BufferCache, BufferCacheError, ObtainedBuffer};
pub use interfaces::{DrawStateProvider, ImageSource, IndexBufferBinding, VertexBufferBinding};
pub use memory_tracker::PageWatcher;
pub use page_table::{CACHING_PAGEBITS, CACHING_PAGESIZE};
