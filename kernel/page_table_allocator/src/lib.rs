//! The dedicated allocator for page-table frames (L3/L2/L1 tables).
//!
//! The page-table engine in `page_table` never calls into the general
//! physical-frame allocator directly: table frames come from a fixed pool
//! reserved once at boot, so that the atomic reservation protocol in
//! `page_table::map`/`unmap` can compute an upper bound on how many table
//! frames an operation needs without racing the general allocator.
//!
//! Every frame in the pool is identity-mapped at
//! [`kernel_config::memory::PHYSICAL_MEMORY_OFFSET`], and this allocator
//! caches that mapping per frame so that zeroing a freshly-claimed table, or
//! reading an existing one during `compact`, never has to walk the page
//! table to find a pointer to it.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
#[cfg(not(test))]
use core::ptr;
use kernel_config::memory::PHYSICAL_MEMORY_OFFSET;
#[cfg(not(test))]
use kernel_config::memory::PAGE_SIZE;
use kernel_errors::{Error, Result};
use memory_structs::{Frame, PhysicalAddress, VirtualAddress};
use sync::IrqSafeMutex;

/// Computes the identity-mapped virtual address of `frame` directly, used
/// to seed the cache and to sanity-check it in tests.
fn identity_address_of(frame: Frame) -> VirtualAddress {
    VirtualAddress::new_canonical(PHYSICAL_MEMORY_OFFSET + frame.start_address().value())
}

pub struct PageTableAllocator {
    /// Frames currently not in use by any page table.
    free: Vec<Frame>,
    /// Frames currently backing a live L3/L2/L1 table.
    in_use: Vec<Frame>,
    /// frame -> identity-mapped virtual address, populated for every frame
    /// the pool owns (free or in use).
    identity_cache: BTreeMap<Frame, VirtualAddress>,
}

impl PageTableAllocator {
    /// Builds the pool from `n_frames` frames starting at `base`, all of
    /// which must already be identity-mapped.
    pub fn new(base: Frame, n_frames: usize) -> PageTableAllocator {
        let mut free = Vec::with_capacity(n_frames);
        let mut identity_cache = BTreeMap::new();
        for i in 0..n_frames {
            let frame = base + i;
            free.push(frame);
            identity_cache.insert(frame, identity_address_of(frame));
        }
        PageTableAllocator { free, in_use: Vec::new(), identity_cache }
    }

    /// Zeroes a claimed frame through its identity mapping.
    ///
    /// Not compiled in host unit test builds: there is no real identity map
    /// to write through there, so the data-structure tests below exercise
    /// everything except this one hardware-touching step.
    #[cfg(not(test))]
    fn zero_frame(&self, frame: Frame) {
        let vaddr = self.identity_cache.get(&frame).copied().unwrap_or_else(|| identity_address_of(frame));
        // SAFETY: `vaddr` is the identity mapping of a frame this pool
        // exclusively owns, is page-aligned, and covers at least `PAGE_SIZE`
        // bytes.
        unsafe {
            ptr::write_bytes(vaddr.value() as *mut u8, 0, PAGE_SIZE);
        }
    }

    #[cfg(test)]
    fn zero_frame(&self, _frame: Frame) {}

    /// All-or-nothing allocation of `n` table frames, each zeroed.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<Frame>> {
        if n == 0 {
            return Err(Error::invalid_input("allocate: n must be non-zero"));
        }
        if self.free.len() < n {
            return Err(Error::out_of_memory("allocate: page-table frame pool exhausted"));
        }
        let mut result = Vec::with_capacity(n);
        for _ in 0..n {
            let frame = self.free.pop().expect("checked length above");
            self.zero_frame(frame);
            self.in_use.push(frame);
            result.push(frame);
        }
        Ok(result)
    }

    /// Same contract as [`Self::allocate`], returned as an owned list rather
    /// than a fixed array (callers don't always know `n` at compile time).
    pub fn allocate_list(&mut self, n: usize) -> Result<Vec<Frame>> {
        self.allocate(n)
    }

    /// Tops up `list` with `n` more frames, all-or-nothing. On failure,
    /// `list` is left unchanged.
    pub fn allocate_extra(&mut self, n: usize, list: &mut Vec<Frame>) -> bool {
        match self.allocate(n) {
            Ok(mut extra) => {
                list.append(&mut extra);
                true
            }
            Err(_) => false,
        }
    }

    /// Returns every frame in `list` to the free list.
    pub fn free(&mut self, list: Vec<Frame>) {
        for frame in list {
            if let Some(idx) = self.in_use.iter().position(|f| *f == frame) {
                self.in_use.swap_remove(idx);
            }
            self.free.push(frame);
        }
    }

    /// Calls `is_empty` on each in-use frame via `table_view` and reclaims
    /// any table frame it reports empty. Returns the number reclaimed.
    ///
    /// `table_view` reads the 512-entry table at a frame's identity address
    /// and reports whether every entry is absent; it is supplied by the
    /// page-table engine so that this crate never has to understand entry
    /// encoding.
    pub fn compact(&mut self, mut table_view: impl FnMut(VirtualAddress) -> bool) -> usize {
        let mut reclaimed = Vec::new();
        for &frame in &self.in_use {
            let vaddr = self.identity_cache[&frame];
            if table_view(vaddr) {
                reclaimed.push(frame);
            }
        }
        let count = reclaimed.len();
        self.free(reclaimed);
        count
    }

    /// The identity-mapped virtual address backing `frame`, if this pool owns it.
    pub fn identity_address(&self, frame: Frame) -> Option<VirtualAddress> {
        self.identity_cache.get(&frame).copied()
    }

    pub fn frames_free(&self) -> usize {
        self.free.len()
    }

    pub fn frames_in_use(&self) -> usize {
        self.in_use.len()
    }
}

/// The global page-table frame pool, installed once at boot.
pub static PAGE_TABLE_ALLOCATOR: IrqSafeMutex<Option<PageTableAllocator>> = IrqSafeMutex::new(None);

pub fn init(base_phys_addr: PhysicalAddress, n_frames: usize) {
    let base = Frame::containing_address(base_phys_addr);
    *PAGE_TABLE_ALLOCATOR.lock() = Some(PageTableAllocator::new(base, n_frames));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_all_or_nothing() {
        let mut pool = PageTableAllocator::new(Frame::containing_address(PhysicalAddress::zero()), 4);
        assert!(pool.allocate(5).is_err());
        assert_eq!(pool.frames_in_use(), 0);
        let frames = pool.allocate(4).unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(pool.frames_free(), 0);
    }

    #[test]
    fn free_returns_frames_to_pool() {
        let mut pool = PageTableAllocator::new(Frame::containing_address(PhysicalAddress::zero()), 4);
        let frames = pool.allocate(4).unwrap();
        pool.free(frames);
        assert_eq!(pool.frames_free(), 4);
        assert_eq!(pool.frames_in_use(), 0);
    }

    #[test]
    fn allocate_extra_tops_up_existing_list() {
        let mut pool = PageTableAllocator::new(Frame::containing_address(PhysicalAddress::zero()), 4);
        let mut list = pool.allocate(2).unwrap();
        assert!(pool.allocate_extra(2, &mut list));
        assert_eq!(list.len(), 4);
        assert!(!pool.allocate_extra(1, &mut list));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn identity_cache_matches_direct_computation() {
        let base = Frame::containing_address(PhysicalAddress::new_canonical(0x4000, 52));
        let pool = PageTableAllocator::new(base, 2);
        assert_eq!(pool.identity_address(base), Some(identity_address_of(base)));
    }
}
