// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Guest memory access for uploads and GPU write-back.
//!
//! [`GuestMemory`] resolves guest addresses to host bytes. The buffer cache
//! reads through it when uploading CPU-modified ranges and the download
//! worker writes through it when GPU results land. Writes made through this
//! trait must not trip the CPU write-watch mechanism.

use memmap2::MmapMut;
use parking_lot::RwLock;
use thiserror::Error;

use vidcore_common::VAddr;

/// Errors returned by [`MappedGuestMemory`].
#[derive(Debug, Error)]
pub enum GuestMemoryError {
    #[error("range [0x{0:010X}..0x{1:010X}) is outside the guest window")]
    OutOfWindow(VAddr, VAddr),

    #[error("failed to create backing mmap: {0}")]
    MmapFailed(#[from] std::io::Error),
}

/// Trait for the guest-memory resolver.
pub trait GuestMemory: Send + Sync {
    /// Copy guest bytes at `addr` into `dst`.
    fn read(&self, addr: VAddr, dst: &mut [u8]);

    /// Copy `src` into guest memory at `addr`.
    fn write(&self, addr: VAddr, src: &[u8]);
}

/// Guest memory window backed by a sparse anonymous mmap.
///
/// Covers `[base, base + size)`. Reads outside the window return zeros and
/// writes outside it are dropped, matching how unmapped GPU pages behave.
pub struct MappedGuestMemory {
    base: VAddr,
    backing: RwLock<MmapMut>,
}

impl MappedGuestMemory {
    pub fn new(base: VAddr, size: usize) -> Result<Self, GuestMemoryError> {
        let backing = MmapMut::map_anon(size)?;
        log::debug!(
            "guest memory: window 0x{:010X}..0x{:010X}",
            base,
            base + size as u64
        );
        Ok(Self {
            base,
            backing: RwLock::new(backing),
        })
    }

    pub fn base(&self) -> VAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.backing.read().len() as u64
    }

    /// Read, failing if any byte lies outside the window.
    pub fn try_read(&self, addr: VAddr, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let backing = self.backing.read();
        let start = self.window_offset(addr, dst.len() as u64, backing.len())?;
        dst.copy_from_slice(&backing[start..start + dst.len()]);
        Ok(())
    }

    /// Write, failing if any byte lies outside the window.
    pub fn try_write(&self, addr: VAddr, src: &[u8]) -> Result<(), GuestMemoryError> {
        let mut backing = self.backing.write();
        let start = self.window_offset(addr, src.len() as u64, backing.len())?;
        backing[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn window_offset(&self, addr: VAddr, len: u64, window: usize) -> Result<usize, GuestMemoryError> {
        let end = addr.saturating_add(len);
        if addr < self.base || end - self.base > window as u64 {
            return Err(GuestMemoryError::OutOfWindow(addr, end));
        }
        Ok((addr - self.base) as usize)
    }
}

impl GuestMemory for MappedGuestMemory {
    fn read(&self, addr: VAddr, dst: &mut [u8]) {
        if let Err(err) = self.try_read(addr, dst) {
            log::trace!("guest memory: {}", err);
            dst.fill(0);
        }
    }

    fn write(&self, addr: VAddr, src: &[u8]) {
        if let Err(err) = self.try_write(addr, src) {
            log::warn!("guest memory: dropped write, {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let mem = MappedGuestMemory::new(0x10_0000, 0x4000).unwrap();
        mem.write(0x10_0010, &[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut buf = [0u8; 4];
        mem.read(0x10_0010, &mut buf);
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_fresh_window_is_zeroed() {
        let mem = MappedGuestMemory::new(0, 0x1000).unwrap();
        let mut buf = [0xFFu8; 16];
        mem.read(0x800, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_out_of_window() {
        let mem = MappedGuestMemory::new(0x1000, 0x1000).unwrap();
        let mut buf = [0xAAu8; 8];
        assert!(mem.try_read(0x1FFC, &mut buf).is_err());
        assert!(mem.try_read(0x0FFF, &mut buf).is_err());

        // Lenient trait read zero-fills.
        mem.read(0x1FFC, &mut buf);
        assert_eq!(buf, [0u8; 8]);

        assert!(matches!(
            mem.try_write(0x2000, &[1]),
            Err(GuestMemoryError::OutOfWindow(0x2000, 0x2001))
        ));
    }
}
