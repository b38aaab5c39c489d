//! The physical-frame allocator.
//!
//! Frames are vended from a fixed list of usable [`MemoryRegion`]s handed in
//! from the boot memory map. Allocation is first-fit, scanning regions from
//! lowest to highest physical address and skipping any region below 1 MiB
//! (see [`MemoryRegionKind::LowMemory`]) or too small to satisfy the
//! request. There is no merging of freed ranges back into neighboring free
//! space within a region; each region tracks its own sorted free list and a
//! freed range is simply reinserted into it.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use kernel_config::memory::PAGE_SIZE;
use kernel_errors::{Error, Result};
use memory_structs::{Frame, FrameRange, MemoryRange, MemoryRegion, MemoryRegionKind, PhysicalAddress};
use sync::IrqSafeMutex;

/// One contiguous run of free frames within a region's free list.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct FreeRun {
    start: Frame,
    frame_count: usize,
}

struct Region {
    kind: MemoryRegionKind,
    /// Sorted, non-overlapping, ascending by `start`.
    free: Vec<FreeRun>,
}

impl Region {
    fn from_memory_region(region: &MemoryRegion) -> Region {
        let free = if region.kind == MemoryRegionKind::Usable {
            let fr = region.range.to_frame_range();
            if fr.is_empty() { Vec::new() } else { alloc::vec![FreeRun { start: fr.start(), frame_count: fr.size_in_pages() }] }
        } else {
            Vec::new()
        };
        Region { kind: region.kind, free }
    }

    fn try_allocate(&mut self, n_pages: usize) -> Option<Frame> {
        let idx = self.free.iter().position(|run| run.frame_count >= n_pages)?;
        let run = self.free[idx];
        let allocated_start = run.start;
        if run.frame_count == n_pages {
            self.free.remove(idx);
        } else {
            self.free[idx] = FreeRun { start: run.start + n_pages, frame_count: run.frame_count - n_pages };
        }
        Some(allocated_start)
    }

    fn contains(&self, frame: Frame, frame_count: usize, region_range: &FrameRange) -> bool {
        let _ = frame_count;
        region_range.contains(frame)
    }

    fn free_run(&mut self, start: Frame, frame_count: usize) {
        let new_run = FreeRun { start, frame_count };
        let idx = self.free.partition_point(|r| r.start < start);
        self.free.insert(idx, new_run);
        self.coalesce_around(idx);
    }

    fn coalesce_around(&mut self, idx: usize) {
        if idx + 1 < self.free.len() {
            let cur = self.free[idx];
            let next = self.free[idx + 1];
            if cur.start + cur.frame_count == next.start {
                self.free[idx].frame_count += next.frame_count;
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let prev = self.free[idx - 1];
            let cur = self.free[idx];
            if prev.start + prev.frame_count == cur.start {
                self.free[idx - 1].frame_count += cur.frame_count;
                self.free.remove(idx);
            }
        }
    }

    /// Carves `range` out of this region's free list, used only during boot
    /// to mark reserved memory (kernel image, boot info, initrd) as used.
    fn mark_used(&mut self, range: FrameRange) {
        if range.is_empty() {
            return;
        }
        let cut_start = range.start().number();
        let cut_end = cut_start + range.size_in_pages();
        let mut result = Vec::with_capacity(self.free.len());
        for run in self.free.drain(..) {
            let run_start = run.start.number();
            let run_end = run_start + run.frame_count;
            if cut_end <= run_start || cut_start >= run_end {
                result.push(run);
                continue;
            }
            if cut_start > run_start {
                result.push(FreeRun { start: run.start, frame_count: cut_start - run_start });
            }
            if cut_end < run_end {
                result.push(FreeRun { start: run.start + (cut_end - run_start), frame_count: run_end - cut_end });
            }
        }
        result.sort_by_key(|r| r.start.number());
        self.free = result;
    }
}

/// The allocator's region table, built once from the boot memory map and
/// mutated thereafter only through `allocate`/`free`/`mark_used`.
pub struct FrameAllocator {
    regions: Vec<(FrameRange, Region)>,
}

impl FrameAllocator {
    /// Builds the allocator from the boot memory map. Regions are kept in
    /// the order given; `allocate` scans them in that order, so callers
    /// should supply `regions` sorted by ascending physical address.
    pub fn new(regions: &[MemoryRegion]) -> FrameAllocator {
        let mut table = Vec::with_capacity(regions.len());
        for region in regions {
            let frame_range = region.range.to_frame_range();
            table.push((frame_range, Region::from_memory_region(region)));
        }
        FrameAllocator { regions: table }
    }

    /// First-fit allocation of `n_pages` contiguous frames.
    pub fn allocate(&mut self, n_pages: usize) -> Result<PhysicalAddress> {
        if n_pages == 0 {
            return Err(Error::invalid_input("allocate: n_pages must be non-zero"));
        }
        for (range, region) in self.regions.iter_mut() {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            if range.size_in_pages() < n_pages {
                continue;
            }
            if let Some(frame) = region.try_allocate(n_pages) {
                return Ok(frame.start_address());
            }
        }
        Err(Error::out_of_memory("allocate: no usable region has a large enough free run"))
    }

    /// Returns `n_pages` frames starting at `addr` to their owning region.
    pub fn free(&mut self, addr: PhysicalAddress, n_pages: usize) -> Result<()> {
        if n_pages == 0 {
            return Err(Error::invalid_input("free: n_pages must be non-zero"));
        }
        let start = Frame::containing_address(addr);
        for (range, region) in self.regions.iter_mut() {
            if region.contains(start, n_pages, range) {
                region.free_run(start, n_pages);
                return Ok(());
            }
        }
        Err(Error::invalid_input("free: address does not belong to any tracked region"))
    }

    /// Boot-time only: carves `range` out of every region it intersects.
    pub fn mark_used(&mut self, range: MemoryRange) {
        let frame_range = range.to_frame_range();
        for (_region_range, region) in self.regions.iter_mut() {
            region.mark_used(frame_range.clone());
        }
    }
}

/// The global frame allocator, installed once at boot by `boot_info::init`.
pub static FRAME_ALLOCATOR: IrqSafeMutex<Option<FrameAllocator>> = IrqSafeMutex::new(None);

/// Installs the global allocator. Must be called exactly once, before any
/// other crate calls [`allocate_frames`].
pub fn init(regions: &[MemoryRegion]) {
    *FRAME_ALLOCATOR.lock() = Some(FrameAllocator::new(regions));
}

pub fn allocate_frames(n_pages: usize) -> Result<PhysicalAddress> {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .ok_or_else(|| Error::not_supported("allocate_frames: allocator not yet initialized"))?
        .allocate(n_pages)
}

pub fn free_frames(addr: PhysicalAddress, n_pages: usize) -> Result<()> {
    FRAME_ALLOCATOR
        .lock()
        .as_mut()
        .ok_or_else(|| Error::not_supported("free_frames: allocator not yet initialized"))?
        .free(addr, n_pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, size: usize) -> MemoryRegion {
        MemoryRegion {
            kind: MemoryRegionKind::Usable,
            range: MemoryRange::new(PhysicalAddress::new_canonical(start, 52), PhysicalAddress::new_canonical(start + size, 52)),
        }
    }

    #[test]
    fn allocate_and_free_round_trip() {
        let regions = [region(0x10_0000, 16 * PAGE_SIZE)];
        let mut alloc = FrameAllocator::new(&regions);
        let a = alloc.allocate(4).unwrap();
        let b = alloc.allocate(4).unwrap();
        assert_ne!(a, b);
        alloc.free(a, 4).unwrap();
        let c = alloc.allocate(4).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn allocate_fails_when_exhausted() {
        let regions = [region(0x10_0000, 4 * PAGE_SIZE)];
        let mut alloc = FrameAllocator::new(&regions);
        alloc.allocate(4).unwrap();
        assert!(alloc.allocate(1).is_err());
    }

    #[test]
    fn mark_used_carves_out_reserved_range() {
        let regions = [region(0x10_0000, 8 * PAGE_SIZE)];
        let mut alloc = FrameAllocator::new(&regions);
        alloc.mark_used(MemoryRange::new(
            PhysicalAddress::new_canonical(0x10_0000, 52),
            PhysicalAddress::new_canonical(0x10_0000 + 4 * PAGE_SIZE, 52),
        ));
        let a = alloc.allocate(4).unwrap();
        assert_eq!(a.value(), 0x10_0000 + 4 * PAGE_SIZE);
        assert!(alloc.allocate(1).is_err());
    }

    #[test]
    fn skips_too_small_regions() {
        let regions = [region(0x10_0000, 1 * PAGE_SIZE), region(0x20_0000, 8 * PAGE_SIZE)];
        let mut alloc = FrameAllocator::new(&regions);
        let a = alloc.allocate(4).unwrap();
        assert_eq!(a.value(), 0x20_0000);
    }
}
