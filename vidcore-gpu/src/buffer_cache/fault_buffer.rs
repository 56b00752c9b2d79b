// SPDX-FileCopyrightText: 2025 vidcore contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Page fault bitmap for raw device-address accesses.
//!
//! One bit per caching page across the 40-bit space (8 MiB), set when a
//! device-address access misses the device page table. The bitmap lives in
//! an anonymous mapping so untouched parts never get committed. A summary
//! level with one bit per bitmap word keeps the scan proportional to the
//! faults actually raised. The bitmap is private, so `mark_fault` is the
//! only way to raise a fault and the summary never misses a word.

use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;

use vidcore_common::VAddr;

use super::page_table::{CACHING_NUMPAGES, CACHING_PAGEBITS};

/// Size of the fault bitmap in bytes.
pub const FAULT_BUFFER_SIZE: u64 = CACHING_NUMPAGES / 8;

const WORD_BITS: u64 = u64::BITS as u64;
const NUM_WORDS: usize = (CACHING_NUMPAGES / WORD_BITS) as usize;
const NUM_SUMMARY_WORDS: usize = NUM_WORDS / WORD_BITS as usize;

pub struct FaultBuffer {
    bits: MmapMut,
    summary: Box<[AtomicU64]>,
}

impl FaultBuffer {
    pub fn new() -> std::io::Result<Self> {
        let bits = MmapMut::map_anon(FAULT_BUFFER_SIZE as usize)?;
        let summary = (0..NUM_SUMMARY_WORDS).map(|_| AtomicU64::new(0)).collect();
        Ok(Self { bits, summary })
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is page aligned, a multiple of 8 bytes long,
        // outlives the returned slice, and is only ever accessed atomically.
        unsafe { std::slice::from_raw_parts(self.bits.as_ptr() as *const AtomicU64, NUM_WORDS) }
    }

    /// Record a fault on the caching page containing `addr`.
    pub fn mark_fault(&self, addr: VAddr) {
        let page = addr >> CACHING_PAGEBITS;
        assert!(page < CACHING_NUMPAGES, "fault buffer: address 0x{:X} out of range", addr);
        let word = (page / WORD_BITS) as usize;
        self.words()[word].fetch_or(1 << (page % WORD_BITS), Ordering::Release);
        self.summary[word / WORD_BITS as usize]
            .fetch_or(1 << (word as u64 % WORD_BITS), Ordering::Release);
    }

    /// Whether a fault is pending on the page containing `addr`.
    pub fn is_faulted(&self, addr: VAddr) -> bool {
        let page = addr >> CACHING_PAGEBITS;
        let word = (page / WORD_BITS) as usize;
        self.words()[word].load(Ordering::Acquire) & (1 << (page % WORD_BITS)) != 0
    }

    /// Clear every pending fault and return the faulting page numbers in
    /// ascending order.
    pub fn take_faults(&self) -> Vec<u64> {
        let words = self.words();
        let mut pages = Vec::new();
        for (summary_index, summary) in self.summary.iter().enumerate() {
            let mut summary_bits = summary.swap(0, Ordering::AcqRel);
            while summary_bits != 0 {
                let word = summary_index * WORD_BITS as usize + summary_bits.trailing_zeros() as usize;
                summary_bits &= summary_bits - 1;

                let mut bits = words[word].swap(0, Ordering::AcqRel);
                while bits != 0 {
                    pages.push(word as u64 * WORD_BITS + bits.trailing_zeros() as u64);
                    bits &= bits - 1;
                }
            }
        }
        pages
    }
}
