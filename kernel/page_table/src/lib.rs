//! The four-level x86_64 page-table engine.
//!
//! Every mutator here follows the same atomicity principle: reserve every
//! table frame an operation could possibly need *before* writing a single
//! entry, so a failed allocation never leaves a half-built mapping behind.
//! Reservation escalates through three steps — a cheap upper bound, an
//! exact walk of the existing tables, and (if that still isn't enough) an
//! emergency [`compact`](PageTable::compact) — only returning `OutOfMemory`
//! once all three have failed.
//!
//! All table frames (L3/L2/L1) are drawn from `page_table_allocator`'s
//! fixed pool and are always identity-mapped, so this engine can read or
//! write any table in place without going through itself.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use core::mem::size_of;
use kernel_config::memory::{
    PAGE_SIZE, PAGE_SIZE_1GB, PAGE_SIZE_2MB, PAGE_TABLE_INDEX_BITS, PHYSICAL_MEMORY_OFFSET,
    P1_INDEX_SHIFT, P2_INDEX_SHIFT, P3_INDEX_SHIFT, P4_INDEX_SHIFT,
};
use kernel_errors::{Error, Result};
use memory_structs::{page_align_down, page_align_up, AddressMapping, Frame, PhysicalAddress, VirtualAddress, VirtualRange};
use page_table_allocator::PAGE_TABLE_ALLOCATOR;
use page_table_entry::{MemoryType, PageFlags, Pte};
use sync::IrqSafeMutex;

const ENTRIES: usize = 512;
const INDEX_MASK: usize = (1 << PAGE_TABLE_INDEX_BITS) - 1;

fn index_at(vaddr: VirtualAddress, shift: usize) -> usize {
    (vaddr.value() >> shift) & INDEX_MASK
}

fn identity_vaddr(frame: Frame) -> VirtualAddress {
    VirtualAddress::new_canonical(PHYSICAL_MEMORY_OFFSET + frame.start_address().value())
}

/// SAFETY: callers must hold the page-table lock and know `frame` is a live
/// table frame, identity-mapped, for the lifetime of the borrow.
unsafe fn table_of<'a>(frame: Frame) -> &'a mut [Pte; ENTRIES] {
    &mut *(identity_vaddr(frame).value() as *mut [Pte; ENTRIES])
}

/// The terminal page size a [`walk`](PageTable::walk) landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalSize {
    None,
    Page4K,
    Page2M,
    Page1G,
}

/// The raw entries a walk passed through, from L4 down to whichever level
/// terminated it, plus the terminal page size.
#[derive(Debug, Clone, Copy)]
pub struct PageWalk {
    pub l4_entry: u64,
    pub l3_entry: Option<u64>,
    pub l2_entry: Option<u64>,
    pub l1_entry: Option<u64>,
    pub terminal: TerminalSize,
}

fn phys_width() -> u8 {
    page_table_entry::default_physical_address_width()
}

/// Conservative worst-case table-frame count for mapping a range of
/// `size_in_bytes`: covers the L3/L2 entries a maximally-fragmented range
/// could need, plus two extra L1 tables for a non-2M-aligned head and tail.
fn max_pages_for_mapping(size_in_bytes: usize) -> usize {
    size_in_bytes / PAGE_SIZE_2MB + 2
}

/// The top-level page table (PML4) and the operations over it.
pub struct PageTable {
    root: Frame,
}

impl PageTable {
    /// Wraps an already-active, identity-mapped PML4 frame (supplied by the
    /// boot hand-off).
    pub fn from_root(root: Frame) -> PageTable {
        PageTable { root }
    }

    pub fn root_frame(&self) -> Frame {
        self.root
    }

    /// Reserves table frames using the three-step escalation policy. `hint`
    /// is the fast upper bound; `exact` is computed lazily only if the fast
    /// path fails.
    fn reserve(&self, hint: usize, exact: impl Fn() -> usize) -> Result<Vec<Frame>> {
        let mut pool = PAGE_TABLE_ALLOCATOR.lock();
        let pool = pool.as_mut().ok_or_else(|| Error::not_supported("reserve: page_table_allocator not initialized"))?;
        if let Ok(frames) = pool.allocate(hint) {
            return Ok(frames);
        }
        let exact_n = exact();
        if let Ok(frames) = pool.allocate(exact_n) {
            return Ok(frames);
        }
        drop(pool);
        self.compact();
        let mut pool = PAGE_TABLE_ALLOCATOR.lock();
        let pool = pool.as_mut().ok_or_else(|| Error::not_supported("reserve: page_table_allocator not initialized"))?;
        pool.allocate(exact_n).map_err(|_| Error::out_of_memory("reserve: page-table frame pool exhausted after compaction"))
    }

    /// Counts entries actually missing along the path to every page in
    /// `range`, used as the reservation protocol's step 2.
    fn exact_missing_table_frames(&self, range: &VirtualRange) -> usize {
        let mut missing = 0usize;
        let mut addr = range.front.page_align();
        while addr.value() < range.back.value() {
            let l4 = unsafe { table_of(self.root) };
            let l3_idx = index_at(addr, P4_INDEX_SHIFT);
            if !l4[l3_idx].is_present() {
                missing += 1;
                addr = addr + PAGE_SIZE_1GB * ENTRIES;
                continue;
            }
            let l3_frame = Frame::containing_address(l4[l3_idx].address_4k(phys_width()).unwrap());
            let l3 = unsafe { table_of(l3_frame) };
            let l2_idx = index_at(addr, P3_INDEX_SHIFT);
            if !l3[l2_idx].is_present() {
                missing += 1;
                addr = addr + PAGE_SIZE_2MB * ENTRIES;
                continue;
            }
            if l3[l2_idx].is_huge() {
                addr = addr + PAGE_SIZE_1GB;
                continue;
            }
            let l2_frame = Frame::containing_address(l3[l2_idx].address_4k(phys_width()).unwrap());
            let l2 = unsafe { table_of(l2_frame) };
            let l1_idx = index_at(addr, P2_INDEX_SHIFT);
            if !l2[l1_idx].is_present() {
                missing += 1;
                addr = addr + PAGE_SIZE_2MB;
                continue;
            }
            addr = addr + PAGE_SIZE;
        }
        missing
    }

    /// Reclaims any now-empty L1/L2 tables. Not performed automatically.
    pub fn compact(&self) -> usize {
        let mut pool = PAGE_TABLE_ALLOCATOR.lock();
        let reclaimed = match pool.as_mut() {
            Some(p) => p.compact(|vaddr| {
                let table = unsafe { &*(vaddr.value() as *const [Pte; ENTRIES]) };
                table.iter().all(Pte::is_unused)
            }),
            None => 0,
        };
        if reclaimed > 0 {
            log::debug!("page_table::compact: reclaimed {} table frame(s)", reclaimed);
        }
        reclaimed
    }

    /// Returns the existing next-level table frame at `table[index]`,
    /// allocating and linking a fresh one from `reserved` if absent.
    /// Returns an error if the slot is occupied by a huge leaf (the caller
    /// must split first).
    fn ensure_table(table: &mut [Pte; ENTRIES], index: usize, reserved: &mut Vec<Frame>) -> Result<Frame> {
        if table[index].is_present() {
            if table[index].is_huge() {
                return Err(Error::invalid_input("ensure_table: slot holds a huge leaf, split required"));
            }
            return Ok(Frame::containing_address(table[index].address_4k(phys_width()).unwrap()));
        }
        let frame = reserved.pop().ok_or_else(|| Error::out_of_memory("ensure_table: reservation exhausted mid-mutation"))?;
        table[index].set_entry_to_table(frame.start_address());
        Ok(frame)
    }

    /// Replaces the 2 MiB leaf at `l2[index]` with a table of 512 4 KiB
    /// entries that reproduce the same mapping, then returns the new L1
    /// frame. The new table is fully written before the L2 entry is
    /// rewritten, so no observer ever sees a torn mapping.
    fn split_2m(l2: &mut [Pte; ENTRIES], index: usize, reserved: &mut Vec<Frame>) -> Result<Frame> {
        let old = l2[index];
        let base = old.address_huge(phys_width(), PAGE_SIZE_2MB).ok_or_else(|| Error::invalid_input("split_2m: slot is not a present 2M leaf"))?;
        let flags = old.flags_huge();
        let l1_frame = reserved.pop().ok_or_else(|| Error::out_of_memory("split_2m: reservation exhausted"))?;
        let l1 = unsafe { table_of(l1_frame) };
        for i in 0..ENTRIES {
            let sub_addr = PhysicalAddress::new_canonical(base.value() + i * PAGE_SIZE, phys_width());
            l1[i].set_entry_4k(sub_addr, flags)?;
        }
        l2[index].set_entry_to_table(l1_frame.start_address());
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(base.value() as u64));
        Ok(l1_frame)
    }

    fn write_4k(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, flags: PageFlags, mem_type: MemoryType, reserved: &mut Vec<Frame>) -> Result<()> {
        let l4 = unsafe { table_of(self.root) };
        let l3_frame = Self::ensure_table(l4, index_at(vaddr, P4_INDEX_SHIFT), reserved)?;
        let l3 = unsafe { table_of(l3_frame) };
        let l2_idx = index_at(vaddr, P3_INDEX_SHIFT);
        if l3[l2_idx].is_present() && l3[l2_idx].is_huge() {
            return Err(Error::invalid_input("write_4k: 1G leaf split is not supported"));
        }
        let l2_frame = Self::ensure_table(l3, l2_idx, reserved)?;
        let l2 = unsafe { table_of(l2_frame) };
        let l1_idx = index_at(vaddr, P2_INDEX_SHIFT);
        let l1_frame = if l2[l1_idx].is_present() && l2[l1_idx].is_huge() {
            Self::split_2m(l2, l1_idx, reserved)?
        } else {
            Self::ensure_table(l2, l1_idx, reserved)?
        };
        let l1 = unsafe { table_of(l1_frame) };
        let idx = index_at(vaddr, P1_INDEX_SHIFT);
        let was_present = l1[idx].is_present();
        l1[idx].set_entry_4k(paddr, flags.memory_type(mem_type))?;
        if was_present {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.value() as u64));
        }
        Ok(())
    }

    fn write_2m(&self, vaddr: VirtualAddress, paddr: PhysicalAddress, flags: PageFlags, mem_type: MemoryType, reserved: &mut Vec<Frame>) -> Result<()> {
        let l4 = unsafe { table_of(self.root) };
        let l3_frame = Self::ensure_table(l4, index_at(vaddr, P4_INDEX_SHIFT), reserved)?;
        let l3 = unsafe { table_of(l3_frame) };
        let l2_idx = index_at(vaddr, P3_INDEX_SHIFT);
        if l3[l2_idx].is_present() && l3[l2_idx].is_huge() {
            return Err(Error::invalid_input("write_2m: 1G leaf split is not supported"));
        }
        let l2_frame = Self::ensure_table(l3, l2_idx, reserved)?;
        let l2 = unsafe { table_of(l2_frame) };
        let idx = index_at(vaddr, P2_INDEX_SHIFT);
        if l2[idx].is_present() && !l2[idx].is_huge() {
            return Err(Error::invalid_input("write_2m: slot already holds a 4K table"));
        }
        let was_present = l2[idx].is_present();
        l2[idx].set_entry_huge(paddr, flags.memory_type(mem_type), PAGE_SIZE_2MB)?;
        if was_present {
            x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.value() as u64));
        }
        Ok(())
    }

    /// Splits `size_in_bytes` at `vaddr`/`paddr` into a 4K head, a 2M-aligned
    /// body, and a 4K tail, per the large-page policy: eligible only when
    /// `vaddr` and `paddr` are congruent modulo 2 MiB and the aligned body
    /// is non-empty.
    fn plan_large_pages(vaddr: usize, paddr: usize, size: usize) -> (usize, usize, usize) {
        if size == 0 || vaddr % PAGE_SIZE_2MB != paddr % PAGE_SIZE_2MB {
            return (size, 0, 0);
        }
        let head = ((PAGE_SIZE_2MB - vaddr % PAGE_SIZE_2MB) % PAGE_SIZE_2MB).min(size);
        let remaining = size - head;
        let body = (remaining / PAGE_SIZE_2MB) * PAGE_SIZE_2MB;
        let tail = remaining - body;
        if body == 0 {
            (size, 0, 0)
        } else {
            (head, body, tail)
        }
    }

    /// Maps `m` with `flags`/`t`, splitting into 4K head, 2M body, and 4K
    /// tail where the large-page policy allows it.
    pub fn map(&mut self, m: AddressMapping, flags: PageFlags, t: MemoryType) -> Result<()> {
        if !m.is_valid() || !m.vaddr.is_canonical() {
            return Err(Error::invalid_input("map: malformed address mapping"));
        }
        let range = m.virtual_range();
        let hint = max_pages_for_mapping(m.size);
        let mut reserved = self.reserve(hint, || self.exact_missing_table_frames(&range))?;
        log::trace!("page_table::map: {:#X}..{:#X} -> {:#X}", m.vaddr.value(), m.vaddr.value() + m.size, m.paddr.value());

        let (head, body, tail) = Self::plan_large_pages(m.vaddr.value(), m.paddr.value(), m.size);
        let mut voff = 0usize;
        while voff < head {
            self.write_4k(m.vaddr + voff, m.paddr + voff, flags, t, &mut reserved)?;
            voff += PAGE_SIZE;
        }
        let mut boff = 0usize;
        while boff < body {
            self.write_2m(m.vaddr + head + boff, m.paddr + head + boff, flags, t, &mut reserved)?;
            boff += PAGE_SIZE_2MB;
        }
        let mut toff = 0usize;
        while toff < tail {
            self.write_4k(m.vaddr + head + body + toff, m.paddr + head + body + toff, flags, t, &mut reserved)?;
            toff += PAGE_SIZE;
        }
        if !reserved.is_empty() {
            PAGE_TABLE_ALLOCATOR.lock().as_mut().map(|p| p.free(reserved));
        }
        Ok(())
    }

    /// Strict 2 MiB-aligned mapping: `m.vaddr`, `m.paddr`, and `m.size` must
    /// all be multiples of 2 MiB.
    pub fn map_2m(&mut self, m: AddressMapping, flags: PageFlags, t: MemoryType) -> Result<()> {
        if !m.is_valid() || m.vaddr.value() % PAGE_SIZE_2MB != 0 || m.paddr.value() % PAGE_SIZE_2MB != 0 || m.size % PAGE_SIZE_2MB != 0 {
            return Err(Error::invalid_input("map_2m: vaddr/paddr/size must be 2 MiB-aligned"));
        }
        let range = m.virtual_range();
        let hint = m.size / PAGE_SIZE_2MB + 2;
        let mut reserved = self.reserve(hint, || self.exact_missing_table_frames(&range))?;
        let mut off = 0usize;
        while off < m.size {
            self.write_2m(m.vaddr + off, m.paddr + off, flags, t, &mut reserved)?;
            off += PAGE_SIZE_2MB;
        }
        if !reserved.is_empty() {
            PAGE_TABLE_ALLOCATOR.lock().as_mut().map(|p| p.free(reserved));
        }
        Ok(())
    }

    /// Unmaps every 4K page wholly contained in `range`, splitting any 2 MiB
    /// leaf whose boundary the range's endpoints fall inside. A page that
    /// only partially overlaps `range` (because an endpoint isn't page
    /// aligned) is left mapped, since unmapping it would also unmap the
    /// bytes outside `range` it still covers.
    pub fn unmap(&mut self, range: VirtualRange) -> Result<()> {
        if !range.is_valid() {
            return Err(Error::invalid_input("unmap: malformed range"));
        }
        let hint = max_pages_for_mapping(range.size_in_bytes());
        let mut reserved = self.reserve(hint, || self.exact_missing_table_frames(&range))?;

        let mut addr = VirtualAddress::new_canonical(page_align_up(range.front.value()));
        let end = VirtualAddress::new_canonical(page_align_down(range.back.value()));
        while addr.value() < end.value() {
            let walk = self.walk(addr);
            match walk.terminal {
                TerminalSize::None => {
                    addr = addr + PAGE_SIZE;
                }
                TerminalSize::Page4K => {
                    self.clear_4k(addr)?;
                    addr = addr + PAGE_SIZE;
                }
                TerminalSize::Page2M => {
                    let l2_base = VirtualAddress::new_canonical(addr.value() & !(PAGE_SIZE_2MB - 1));
                    let covers_whole_2m = range.front.value() <= l2_base.value() && range.back.value() >= l2_base.value() + PAGE_SIZE_2MB;
                    if covers_whole_2m {
                        self.clear_2m(l2_base)?;
                        addr = l2_base + PAGE_SIZE_2MB;
                    } else {
                        self.split_at(l2_base, &mut reserved)?;
                        self.clear_4k(addr)?;
                        addr = addr + PAGE_SIZE;
                    }
                }
                TerminalSize::Page1G => {
                    return Err(Error::invalid_input("unmap: 1G leaf split is not supported"));
                }
            }
        }
        if !reserved.is_empty() {
            PAGE_TABLE_ALLOCATOR.lock().as_mut().map(|p| p.free(reserved));
        }
        Ok(())
    }

    /// Strict 2 MiB-aligned unmap.
    pub fn unmap_2m(&mut self, range: VirtualRange) -> Result<()> {
        if !range.is_valid() || range.front.value() % PAGE_SIZE_2MB != 0 || range.size_in_bytes() % PAGE_SIZE_2MB != 0 {
            return Err(Error::invalid_input("unmap_2m: range must be 2 MiB-aligned"));
        }
        let mut addr = range.front;
        while addr.value() < range.back.value() {
            self.clear_2m(addr)?;
            addr = addr + PAGE_SIZE_2MB;
        }
        Ok(())
    }

    fn split_at(&self, l2_base: VirtualAddress, reserved: &mut Vec<Frame>) -> Result<()> {
        let l4 = unsafe { table_of(self.root) };
        let l3_idx = index_at(l2_base, P4_INDEX_SHIFT);
        if !l4[l3_idx].is_present() {
            return Err(Error::invalid_input("split_at: no L3 table present"));
        }
        let l3_frame = Frame::containing_address(l4[l3_idx].address_4k(phys_width()).unwrap());
        let l3 = unsafe { table_of(l3_frame) };
        let l2_idx = index_at(l2_base, P3_INDEX_SHIFT);
        let l2_frame = Frame::containing_address(l3[l2_idx].address_4k(phys_width()).unwrap());
        let l2 = unsafe { table_of(l2_frame) };
        let idx = index_at(l2_base, P2_INDEX_SHIFT);
        Self::split_2m(l2, idx, reserved)?;
        Ok(())
    }

    fn clear_4k(&self, vaddr: VirtualAddress) -> Result<()> {
        let walk_tables = self.descend_tables(vaddr)?;
        let l1 = unsafe { table_of(walk_tables.2.ok_or_else(|| Error::invalid_input("clear_4k: no L1 table"))?) };
        let idx = index_at(vaddr, P1_INDEX_SHIFT);
        l1[idx].set_unused();
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.value() as u64));
        Ok(())
    }

    fn clear_2m(&self, vaddr: VirtualAddress) -> Result<()> {
        let walk_tables = self.descend_tables(vaddr)?;
        let l2 = unsafe { table_of(walk_tables.1.ok_or_else(|| Error::invalid_input("clear_2m: no L2 table"))?) };
        let idx = index_at(vaddr, P2_INDEX_SHIFT);
        l2[idx].set_unused();
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.value() as u64));
        Ok(())
    }

    /// Returns `(l3_frame, l2_frame, l1_frame)` for whichever levels are
    /// present above `vaddr`'s terminal entry.
    fn descend_tables(&self, vaddr: VirtualAddress) -> Result<(Option<Frame>, Option<Frame>, Option<Frame>)> {
        let l4 = unsafe { table_of(self.root) };
        let l3_idx = index_at(vaddr, P4_INDEX_SHIFT);
        if !l4[l3_idx].is_present() {
            return Ok((None, None, None));
        }
        let l3_frame = Frame::containing_address(l4[l3_idx].address_4k(phys_width()).unwrap());
        let l3 = unsafe { table_of(l3_frame) };
        let l2_idx = index_at(vaddr, P3_INDEX_SHIFT);
        if !l3[l2_idx].is_present() || l3[l2_idx].is_huge() {
            return Ok((Some(l3_frame), None, None));
        }
        let l2_frame = Frame::containing_address(l3[l2_idx].address_4k(phys_width()).unwrap());
        let l2 = unsafe { table_of(l2_frame) };
        let l1_idx = index_at(vaddr, P2_INDEX_SHIFT);
        if !l2[l1_idx].is_present() || l2[l1_idx].is_huge() {
            return Ok((Some(l3_frame), Some(l2_frame), None));
        }
        let l1_frame = Frame::containing_address(l2[l1_idx].address_4k(phys_width()).unwrap());
        Ok((Some(l3_frame), Some(l2_frame), Some(l1_frame)))
    }

    /// Descends without mutation, returning the entries traversed and the
    /// terminal page size.
    pub fn walk(&self, vaddr: VirtualAddress) -> PageWalk {
        let l4 = unsafe { table_of(self.root) };
        let l3_idx = index_at(vaddr, P4_INDEX_SHIFT);
        let l4_entry = l4[l3_idx].raw();
        if !l4[l3_idx].is_present() {
            return PageWalk { l4_entry, l3_entry: None, l2_entry: None, l1_entry: None, terminal: TerminalSize::None };
        }
        let l3_frame = Frame::containing_address(l4[l3_idx].address_4k(phys_width()).unwrap());
        let l3 = unsafe { table_of(l3_frame) };
        let l2_idx = index_at(vaddr, P3_INDEX_SHIFT);
        let l3_entry = l3[l2_idx].raw();
        if !l3[l2_idx].is_present() {
            return PageWalk { l4_entry, l3_entry: Some(l3_entry), l2_entry: None, l1_entry: None, terminal: TerminalSize::None };
        }
        if l3[l2_idx].is_huge() {
            return PageWalk { l4_entry, l3_entry: Some(l3_entry), l2_entry: None, l1_entry: None, terminal: TerminalSize::Page1G };
        }
        let l2_frame = Frame::containing_address(l3[l2_idx].address_4k(phys_width()).unwrap());
        let l2 = unsafe { table_of(l2_frame) };
        let l1_idx = index_at(vaddr, P2_INDEX_SHIFT);
        let l2_entry = l2[l1_idx].raw();
        if !l2[l1_idx].is_present() {
            return PageWalk { l4_entry, l3_entry: Some(l3_entry), l2_entry: Some(l2_entry), l1_entry: None, terminal: TerminalSize::None };
        }
        if l2[l1_idx].is_huge() {
            return PageWalk { l4_entry, l3_entry: Some(l3_entry), l2_entry: Some(l2_entry), l1_entry: None, terminal: TerminalSize::Page2M };
        }
        let l1_frame = Frame::containing_address(l2[l1_idx].address_4k(phys_width()).unwrap());
        let l1 = unsafe { table_of(l1_frame) };
        let idx = index_at(vaddr, P1_INDEX_SHIFT);
        let l1_entry = l1[idx].raw();
        let terminal = if l1[idx].is_present() { TerminalSize::Page4K } else { TerminalSize::None };
        PageWalk { l4_entry, l3_entry: Some(l3_entry), l2_entry: Some(l2_entry), l1_entry: Some(l1_entry), terminal }
    }

    /// Translates `vaddr` to its backing physical address, or `InvalidInput`
    /// if it isn't currently mapped.
    pub fn get_backing_address(&self, vaddr: VirtualAddress) -> Result<PhysicalAddress> {
        let walk = self.walk(vaddr);
        match walk.terminal {
            TerminalSize::Page4K => {
                let l1_frame = self.descend_tables(vaddr)?.2.unwrap();
                let l1 = unsafe { table_of(l1_frame) };
                let idx = index_at(vaddr, P1_INDEX_SHIFT);
                let base = l1[idx].address_4k(phys_width()).ok_or_else(|| Error::invalid_input("get_backing_address: not present"))?;
                Ok(base + vaddr.page_offset())
            }
            TerminalSize::Page2M => {
                let l2_frame = self.descend_tables(vaddr)?.1.unwrap();
                let l2 = unsafe { table_of(l2_frame) };
                let idx = index_at(vaddr, P2_INDEX_SHIFT);
                let base = l2[idx].address_huge(phys_width(), PAGE_SIZE_2MB).ok_or_else(|| Error::invalid_input("get_backing_address: not present"))?;
                Ok(base + (vaddr.value() % PAGE_SIZE_2MB))
            }
            TerminalSize::Page1G => {
                let l3_frame = self.descend_tables(vaddr)?.0.unwrap();
                let l3 = unsafe { table_of(l3_frame) };
                let idx = index_at(vaddr, P3_INDEX_SHIFT);
                let base = l3[idx].address_huge(phys_width(), PAGE_SIZE_1GB).ok_or_else(|| Error::invalid_input("get_backing_address: not present"))?;
                Ok(base + (vaddr.value() % PAGE_SIZE_1GB))
            }
            TerminalSize::None => Err(Error::invalid_input("get_backing_address: address is not mapped")),
        }
    }

}

const _: () = assert!(size_of::<Pte>() == 8);

/// The kernel's own page table, installed once at boot.
pub static KERNEL_PAGE_TABLE: IrqSafeMutex<Option<PageTable>> = IrqSafeMutex::new(None);

pub fn init(root: Frame) {
    *KERNEL_PAGE_TABLE.lock() = Some(PageTable::from_root(root));
}

#[cfg(test)]
mod tests {
    use super::*;

    // These exercise the pure planning logic only: anything that walks real
    // tables needs an identity-mapped physical memory range this host test
    // process doesn't have.

    #[test]
    fn large_page_plan_for_fully_aligned_range() {
        let (head, body, tail) = PageTable::plan_large_pages(0, 0, 4 * PAGE_SIZE_2MB);
        assert_eq!((head, body, tail), (0, 4 * PAGE_SIZE_2MB, 0));
    }

    #[test]
    fn large_page_plan_with_head_and_tail() {
        let (head, body, tail) = PageTable::plan_large_pages(PAGE_SIZE, PAGE_SIZE, 2 * PAGE_SIZE_2MB);
        assert_eq!(head, PAGE_SIZE_2MB - PAGE_SIZE);
        assert_eq!(body, PAGE_SIZE_2MB);
        assert_eq!(tail, PAGE_SIZE);
    }

    #[test]
    fn large_page_plan_rejects_incongruent_addresses() {
        let (head, body, tail) = PageTable::plan_large_pages(0, PAGE_SIZE, 4 * PAGE_SIZE_2MB);
        assert_eq!((head, body, tail), (4 * PAGE_SIZE_2MB, 0, 0));
    }

    #[test]
    fn large_page_plan_falls_back_when_no_full_body() {
        let (head, body, tail) = PageTable::plan_large_pages(0, 0, PAGE_SIZE);
        assert_eq!((head, body, tail), (PAGE_SIZE, 0, 0));
    }

    #[test]
    fn max_pages_for_mapping_grows_with_size() {
        assert_eq!(max_pages_for_mapping(0), 2);
        assert!(max_pages_for_mapping(8 * PAGE_SIZE_2MB) >= 8);
    }
}
