// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Address in the emulated GPU address space.
pub type VAddr = u64;

/// Width of the GPU-addressable guest address space.
pub const ADDRESS_SPACE_BITS: u32 = 40;

/// Size of the GPU-addressable guest address space (1 TiB).
pub const ADDRESS_SPACE_SIZE: u64 = 1 << ADDRESS_SPACE_BITS;

/// Size of a host page as seen by the write-watch mechanism (4 KiB).
pub const HOST_PAGE_SIZE: u64 = 0x1000;

/// Host page shift (log2 of HOST_PAGE_SIZE).
pub const HOST_PAGE_SHIFT: u32 = 12;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given power-of-two alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Integer division rounding towards positive infinity.
#[inline]
pub const fn div_ceil(value: u64, divisor: u64) -> u64 {
    (value + divisor - 1) / divisor
}

/// Check if a value is aligned to the given power-of-two alignment.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Check that `[addr, addr + size)` lies inside the guest address space.
#[inline]
pub const fn is_in_address_space(addr: VAddr, size: u64) -> bool {
    match addr.checked_add(size) {
        Some(end) => end <= ADDRESS_SPACE_SIZE,
        None => false,
    }
}
