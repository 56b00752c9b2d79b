// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU memory virtualization for vidcore.
//!
//! Resolves guest GPU addresses to device buffers, tracks which side last
//! wrote each range, and writes GPU results back to guest memory on a
//! background thread.

pub mod backend;
pub mod buffer_cache;
pub mod guest_memory;
pub mod tick;

#[cfg(test)]
mod test_util;
