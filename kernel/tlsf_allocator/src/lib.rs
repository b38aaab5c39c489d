//! A two-level segregated-fit (TLSF) heap over one contiguous virtual
//! address range.
//!
//! Free blocks are indexed by a first-level class (`fl`, the position of
//! the block's highest set bit in pages) and a second-level class (`sl`, a
//! linear subdivision of that first-level range into
//! [`SL_COUNT`] buckets), the same two-level scheme the allocator is named
//! for. Each bucket holds the start addresses of its free blocks; two
//! bitmaps track which buckets are non-empty so a search never has to probe
//! an empty one. Every size this module works with internally is a page
//! count, not a byte count: the heap only ever hands out page-aligned,
//! page-sized ranges.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use kernel_config::memory::PAGE_SIZE;
use kernel_errors::{Error, Result};
use memory_structs::{VirtualAddress, VirtualRange};

const SLI_BITS: u32 = 4;
const SL_COUNT: usize = 1 << SLI_BITS;
const FL_COUNT: usize = 40;

fn to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

fn fl_index(size_pages: usize) -> usize {
    debug_assert!(size_pages > 0);
    (usize::BITS - 1 - size_pages.leading_zeros()) as usize
}

/// Maps `size_pages` to the `(fl, sl)` bucket that exactly contains it.
fn mapping(size_pages: usize) -> (usize, usize) {
    if size_pages < SL_COUNT {
        return (0, size_pages);
    }
    let fl = fl_index(size_pages);
    let shift = fl as u32 - SLI_BITS;
    let sl = (size_pages >> shift) & (SL_COUNT - 1);
    (fl, sl)
}

/// Rounds `size_pages` up to the smallest value whose bucket is guaranteed
/// to hold only blocks `>= size_pages`, then maps that to a bucket. Used
/// when searching for a block, never when inserting one.
fn mapping_for_search(size_pages: usize) -> (usize, usize) {
    if size_pages < SL_COUNT {
        return (0, size_pages);
    }
    let fl = fl_index(size_pages);
    let shift = fl as u32 - SLI_BITS;
    let round_mask = (1usize << shift) - 1;
    let rounded = if size_pages & round_mask != 0 { size_pages + (1 << shift) } else { size_pages };
    mapping(rounded)
}

fn bucket_of(fl: usize, sl: usize) -> usize {
    fl * SL_COUNT + sl
}

/// A TLSF heap managing one [`VirtualRange`].
pub struct TlsfHeap {
    managed: VirtualRange,
    /// start address -> size in pages, for every free block.
    free_by_addr: BTreeMap<VirtualAddress, usize>,
    /// (fl, sl) bucket -> free block start addresses.
    buckets: Vec<Vec<VirtualAddress>>,
    fl_bitmap: u64,
    sl_bitmap: [u32; FL_COUNT],
    /// start address -> size in pages, for every live allocation.
    allocations: BTreeMap<VirtualAddress, usize>,
}

impl TlsfHeap {
    /// Creates a heap managing all of `range`, rounded down to whole pages.
    pub fn new(range: VirtualRange) -> TlsfHeap {
        let total_pages = range.size_in_bytes() / PAGE_SIZE;
        let mut heap = TlsfHeap {
            managed: range,
            free_by_addr: BTreeMap::new(),
            buckets: vec![Vec::new(); FL_COUNT * SL_COUNT],
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            allocations: BTreeMap::new(),
        };
        if total_pages > 0 {
            heap.insert_free(range.front, total_pages);
        }
        heap
    }

    fn insert_free(&mut self, start: VirtualAddress, size_pages: usize) {
        if size_pages == 0 {
            return;
        }
        self.free_by_addr.insert(start, size_pages);
        let (fl, sl) = mapping(size_pages);
        self.buckets[bucket_of(fl, sl)].push(start);
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmap[fl] |= 1 << sl;
    }

    fn remove_free(&mut self, start: VirtualAddress, size_pages: usize) {
        self.free_by_addr.remove(&start);
        let (fl, sl) = mapping(size_pages);
        let bucket = &mut self.buckets[bucket_of(fl, sl)];
        if let Some(idx) = bucket.iter().position(|a| *a == start) {
            bucket.swap_remove(idx);
        }
        if bucket.is_empty() {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
    }

    /// Finds and removes the smallest free block that can satisfy
    /// `size_pages`, splitting off any leftover back into the free index.
    fn take_free_block(&mut self, size_pages: usize) -> Option<(VirtualAddress, usize)> {
        let (start_fl, start_sl) = mapping_for_search(size_pages);
        for fl in start_fl..FL_COUNT {
            if self.fl_bitmap & (1 << fl) == 0 {
                continue;
            }
            let sl_start = if fl == start_fl { start_sl } else { 0 };
            for sl in sl_start..SL_COUNT {
                if self.sl_bitmap[fl] & (1 << sl) == 0 {
                    continue;
                }
                let bucket = &self.buckets[bucket_of(fl, sl)];
                if let Some(&addr) = bucket.iter().find(|&&a| self.free_by_addr[&a] >= size_pages) {
                    let block_size = self.free_by_addr[&addr];
                    self.remove_free(addr, block_size);
                    return Some((addr, block_size));
                }
            }
        }
        None
    }

    fn split_and_allocate(&mut self, start: VirtualAddress, block_pages: usize, size_pages: usize) -> VirtualRange {
        if block_pages > size_pages {
            let remainder_start = start + size_pages * PAGE_SIZE;
            self.insert_free(remainder_start, block_pages - size_pages);
        }
        self.allocations.insert(start, size_pages);
        VirtualRange::new(start, start + size_pages * PAGE_SIZE)
    }

    /// Allocates at least `size` bytes, page-aligned.
    pub fn allocate(&mut self, size: usize) -> Result<VirtualRange> {
        if size == 0 {
            return Err(Error::invalid_input("allocate: size must be non-zero"));
        }
        let size_pages = to_pages(size);
        let (start, block_pages) = self
            .take_free_block(size_pages)
            .ok_or_else(|| Error::out_of_memory("allocate: no free block large enough"))?;
        Ok(self.split_and_allocate(start, block_pages, size_pages))
    }

    /// Allocates `size` bytes, trying to place the allocation at `hint` if
    /// that address currently falls within a free block large enough.
    pub fn allocate_with_hint(&mut self, size: usize, hint: VirtualAddress) -> Result<VirtualRange> {
        if size == 0 {
            return Err(Error::invalid_input("allocate_with_hint: size must be non-zero"));
        }
        let size_pages = to_pages(size);
        if let Some((block_start, block_pages)) = self.find_free_block_containing(hint) {
            let block_end_pages = block_start.value() / PAGE_SIZE + block_pages;
            let hint_page = hint.value() / PAGE_SIZE;
            if hint_page + size_pages <= block_end_pages {
                self.remove_free(block_start, block_pages);
                let before_pages = hint_page - block_start.value() / PAGE_SIZE;
                if before_pages > 0 {
                    self.insert_free(block_start, before_pages);
                }
                let after_pages = block_pages - before_pages - size_pages;
                if after_pages > 0 {
                    self.insert_free(hint + size_pages * PAGE_SIZE, after_pages);
                }
                self.allocations.insert(hint, size_pages);
                return Ok(VirtualRange::new(hint, hint + size_pages * PAGE_SIZE));
            }
        }
        self.allocate(size)
    }

    fn find_free_block_containing(&self, addr: VirtualAddress) -> Option<(VirtualAddress, usize)> {
        let (&start, &size_pages) = self.free_by_addr.range(..=addr).next_back()?;
        let end = start.value() / PAGE_SIZE + size_pages;
        if addr.value() / PAGE_SIZE < end {
            Some((start, size_pages))
        } else {
            None
        }
    }

    /// Permanently removes `range` from the managed space; it is never
    /// returned by `allocate` and can never be passed to `free`.
    pub fn reserve(&mut self, range: VirtualRange) -> Result<()> {
        if !range.is_valid() || range.size_in_bytes() == 0 {
            return Err(Error::invalid_input("reserve: range must be non-empty and well-formed"));
        }
        let reserve_start_page = range.front.value() / PAGE_SIZE;
        let reserve_end_page = (range.back.value() + PAGE_SIZE - 1) / PAGE_SIZE;
        let overlapping: Vec<(VirtualAddress, usize)> = self
            .free_by_addr
            .iter()
            .filter(|&(start, size_pages)| {
                let s = start.value() / PAGE_SIZE;
                let e = s + size_pages;
                s < reserve_end_page && reserve_start_page < e
            })
            .map(|(&s, &sz)| (s, sz))
            .collect();
        for (start, size_pages) in overlapping {
            self.remove_free(start, size_pages);
            let s = start.value() / PAGE_SIZE;
            let e = s + size_pages;
            if s < reserve_start_page {
                self.insert_free(start, reserve_start_page - s);
            }
            if e > reserve_end_page {
                self.insert_free(VirtualAddress::new_canonical(reserve_end_page * PAGE_SIZE), e - reserve_end_page);
            }
        }
        Ok(())
    }

    /// Frees a range previously returned by `allocate`/`allocate_with_hint`,
    /// coalescing with any adjacent free blocks.
    pub fn free(&mut self, range: VirtualRange) -> Result<()> {
        let size_pages = self
            .allocations
            .remove(&range.front)
            .ok_or_else(|| Error::invalid_input("free: range is not a live allocation"))?;
        let mut start = range.front;
        let mut total_pages = size_pages;

        if let Some((&prev_start, &prev_pages)) = self.free_by_addr.range(..start).next_back() {
            if prev_start.value() / PAGE_SIZE + prev_pages == start.value() / PAGE_SIZE {
                self.remove_free(prev_start, prev_pages);
                start = prev_start;
                total_pages += prev_pages;
            }
        }
        let end = range.front + size_pages * PAGE_SIZE;
        if let Some(&next_pages) = self.free_by_addr.get(&end) {
            self.remove_free(end, next_pages);
            total_pages += next_pages;
        }
        self.insert_free(start, total_pages);
        Ok(())
    }

    /// Total bytes currently held by live allocations.
    pub fn bytes_allocated(&self) -> usize {
        self.allocations.values().map(|pages| pages * PAGE_SIZE).sum()
    }

    /// Total free bytes remaining in the managed range.
    pub fn bytes_free(&self) -> usize {
        self.free_by_addr.values().map(|pages| pages * PAGE_SIZE).sum()
    }

    pub fn managed_range(&self) -> VirtualRange {
        self.managed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(pages: usize) -> TlsfHeap {
        let front = VirtualAddress::new_canonical(0x1000_0000);
        TlsfHeap::new(VirtualRange::new(front, front + pages * PAGE_SIZE))
    }

    #[test]
    fn allocate_and_free_restores_full_range() {
        let mut h = heap(16);
        let a = h.allocate(4 * PAGE_SIZE).unwrap();
        let b = h.allocate(4 * PAGE_SIZE).unwrap();
        assert_ne!(a.front, b.front);
        assert_eq!(h.bytes_free(), 8 * PAGE_SIZE);
        h.free(a).unwrap();
        h.free(b).unwrap();
        assert_eq!(h.bytes_free(), 16 * PAGE_SIZE);
        assert_eq!(h.bytes_allocated(), 0);
    }

    #[test]
    fn out_of_memory_when_exhausted() {
        let mut h = heap(4);
        h.allocate(4 * PAGE_SIZE).unwrap();
        assert!(h.allocate(PAGE_SIZE).is_err());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut h = heap(4);
        let a = h.allocate(2 * PAGE_SIZE).unwrap();
        h.free(a).unwrap();
        assert!(h.free(a).is_err());
    }

    #[test]
    fn coalescing_allows_full_reallocation() {
        let mut h = heap(8);
        let a = h.allocate(2 * PAGE_SIZE).unwrap();
        let b = h.allocate(2 * PAGE_SIZE).unwrap();
        let c = h.allocate(2 * PAGE_SIZE).unwrap();
        h.free(a).unwrap();
        h.free(b).unwrap();
        h.free(c).unwrap();
        let whole = h.allocate(8 * PAGE_SIZE).unwrap();
        assert_eq!(whole.size_in_bytes(), 8 * PAGE_SIZE);
    }

    #[test]
    fn reserve_removes_range_permanently() {
        let mut h = heap(8);
        let front = h.managed_range().front;
        h.reserve(VirtualRange::new(front, front + 2 * PAGE_SIZE)).unwrap();
        assert_eq!(h.bytes_free(), 6 * PAGE_SIZE);
        let a = h.allocate(8 * PAGE_SIZE);
        assert!(a.is_err());
    }

    #[test]
    fn hint_is_honored_when_free() {
        let mut h = heap(16);
        let front = h.managed_range().front;
        let hint = front + 4 * PAGE_SIZE;
        let r = h.allocate_with_hint(2 * PAGE_SIZE, hint).unwrap();
        assert_eq!(r.front, hint);
    }
}
