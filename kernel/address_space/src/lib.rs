//! An address space: one page-table engine and one TLSF heap, composed
//! under a single lock so that `map`/`unmap` are all-or-nothing with
//! respect to both.
//!
//! This crate never talks to the page-table allocator or the physical
//! frame allocator directly (`page_table` and `tlsf_allocator` already own
//! those relationships); it only sequences the two together and undoes the
//! virtual-space side effect of a failed mapping.

#![no_std]

use kernel_config::memory::{PAGE_SIZE, STACK_GUARD_PAGES};
use kernel_errors::{Error, Result};
use memory_structs::{AddressMapping, MemoryRange, PhysicalAddress, VirtualAddress, VirtualRange};
use page_table::PageTable;
use page_table_entry::{MemoryType, PageFlags};
use sync::IrqSafeMutex;
use tlsf_allocator::TlsfHeap;

fn to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

/// The three pieces of a guarded stack mapping: an unmapped guard range on
/// each side of the usable, mapped middle.
#[derive(Debug, Clone, Copy)]
pub struct StackMapping {
    pub guard_low: VirtualRange,
    pub usable: VirtualRange,
    pub guard_high: VirtualRange,
}

impl StackMapping {
    /// The address a stack pointer should be initialized to: one past the
    /// last usable byte, since x86_64 stacks grow down.
    pub fn top(&self) -> VirtualAddress {
        self.usable.back
    }
}

/// One page-table engine and one TLSF heap over the same virtual range.
pub struct AddressSpace {
    page_table: PageTable,
    heap: TlsfHeap,
}

impl AddressSpace {
    pub fn new(page_table: PageTable, heap_range: VirtualRange) -> AddressSpace {
        AddressSpace { page_table, heap: TlsfHeap::new(heap_range) }
    }

    /// Maps `phys_range` at a freshly-chosen virtual address, returning that
    /// address. On page-table failure, the virtual space reservation is
    /// released so no leak survives a failed mapping.
    pub fn map(&mut self, phys_range: MemoryRange, flags: PageFlags, mem_type: MemoryType) -> Result<VirtualAddress> {
        let mapping = self.map_with_mapping(phys_range, None, flags, mem_type)?;
        Ok(mapping.vaddr)
    }

    /// Same as [`Self::map`], but tries to place the mapping at `hint` if
    /// that virtual address is currently free.
    pub fn map_at_hint(&mut self, phys_range: MemoryRange, hint: VirtualAddress, flags: PageFlags, mem_type: MemoryType) -> Result<AddressMapping> {
        self.map_with_mapping(phys_range, Some(hint), flags, mem_type)
    }

    fn map_with_mapping(&mut self, phys_range: MemoryRange, hint: Option<VirtualAddress>, flags: PageFlags, mem_type: MemoryType) -> Result<AddressMapping> {
        if !phys_range.is_valid() || phys_range.size_in_bytes() == 0 {
            return Err(Error::invalid_input("map: physical range must be non-empty and well-formed"));
        }
        let size = phys_range.size_in_bytes();
        let vrange = match hint {
            Some(h) => self.heap.allocate_with_hint(size, h)?,
            None => self.heap.allocate(size)?,
        };
        let mapping = AddressMapping { vaddr: vrange.front, paddr: phys_range.front, size };
        match self.page_table.map(mapping, flags, mem_type) {
            Ok(()) => Ok(mapping),
            Err(e) => {
                log::debug!("address_space::map: page_table::map failed ({}), releasing virtual reservation", e);
                let _ = self.heap.free(vrange);
                Err(e)
            }
        }
    }

    /// Maps `phys_range` with `STACK_GUARD_PAGES` unmapped guard pages on
    /// each side, returning only the middle as mapped.
    pub fn map_stack(&mut self, phys_range: MemoryRange, flags: PageFlags) -> Result<StackMapping> {
        if !phys_range.is_valid() || phys_range.size_in_bytes() == 0 {
            return Err(Error::invalid_input("map_stack: physical range must be non-empty and well-formed"));
        }
        let guard_bytes = STACK_GUARD_PAGES * PAGE_SIZE;
        let usable_bytes = phys_range.size_in_bytes();
        let total = usable_bytes + 2 * guard_bytes;
        let vrange = self.heap.allocate(total)?;
        let usable_start = vrange.front + guard_bytes;
        let mapping = AddressMapping { vaddr: usable_start, paddr: phys_range.front, size: usable_bytes };
        if let Err(e) = self.page_table.map(mapping, flags, MemoryType::WriteBack) {
            let _ = self.heap.free(vrange);
            return Err(e);
        }
        Ok(StackMapping {
            guard_low: VirtualRange::new(vrange.front, usable_start),
            usable: VirtualRange::new(usable_start, usable_start + usable_bytes),
            guard_high: VirtualRange::new(usable_start + usable_bytes, vrange.back),
        })
    }

    /// Unmaps `range`. The page table is updated first; the virtual range
    /// is only returned to the heap if that succeeds.
    pub fn unmap(&mut self, range: VirtualRange) -> Result<()> {
        self.page_table.unmap(range)?;
        self.heap.free(range)
    }

    /// Maps `m` at its caller-chosen virtual address, failing if any part
    /// of that range is already allocated.
    pub fn reserve_mapping(&mut self, m: AddressMapping, flags: PageFlags, mem_type: MemoryType) -> Result<()> {
        if !m.is_valid() {
            return Err(Error::invalid_input("reserve_mapping: malformed address mapping"));
        }
        self.heap.reserve(m.virtual_range())?;
        // `reserve` permanently removes the range from the heap's free
        // list, so a page-table failure here cannot be rolled back by
        // returning it; it surfaces to the caller as a fatal allocation
        // error instead of a silently reusable range.
        self.page_table.map(m, flags, mem_type)
    }

    /// Reserves `size` bytes of virtual address space without mapping it.
    pub fn reserve(&mut self, size: usize) -> Result<VirtualRange> {
        self.heap.allocate(size)
    }

    /// Maps one `T` at `phys_addr`, defaulting to a writable, non-executable
    /// mapping — the usual case for a kernel-owned data structure.
    pub fn map_object<T>(&mut self, phys_addr: PhysicalAddress) -> Result<*mut T> {
        let range = MemoryRange::new(phys_addr, phys_addr + to_pages(core::mem::size_of::<T>()) * PAGE_SIZE);
        let vaddr = self.map(range, PageFlags::data(), MemoryType::WriteBack)?;
        Ok(vaddr.value() as *mut T)
    }

    /// Maps one `T` at `phys_addr` as MMIO: uncached, no speculative reads.
    pub fn map_mmio<T>(&mut self, phys_addr: PhysicalAddress) -> Result<*mut T> {
        let range = MemoryRange::new(phys_addr, phys_addr + to_pages(core::mem::size_of::<T>()) * PAGE_SIZE);
        let vaddr = self.map(range, PageFlags::data(), MemoryType::Uncached)?;
        Ok(vaddr.value() as *mut T)
    }

    /// Maps one `T` at `phys_addr` read-only.
    pub fn map_const<T>(&mut self, phys_addr: PhysicalAddress) -> Result<*const T> {
        let range = MemoryRange::new(phys_addr, phys_addr + to_pages(core::mem::size_of::<T>()) * PAGE_SIZE);
        let vaddr = self.map(range, PageFlags::new(), MemoryType::WriteBack)?;
        Ok(vaddr.value() as *const T)
    }
}

/// The kernel's own address space, installed once at boot.
pub static KERNEL_ADDRESS_SPACE: IrqSafeMutex<Option<AddressSpace>> = IrqSafeMutex::new(None);

pub fn init(page_table: PageTable, heap_range: VirtualRange) {
    *KERNEL_ADDRESS_SPACE.lock() = Some(AddressSpace::new(page_table, heap_range));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_mapping_top_is_one_past_usable() {
        let front = VirtualAddress::new_canonical(0x2000_0000);
        let mapping = StackMapping {
            guard_low: VirtualRange::new(front, front + PAGE_SIZE),
            usable: VirtualRange::new(front + PAGE_SIZE, front + PAGE_SIZE + 4 * PAGE_SIZE),
            guard_high: VirtualRange::new(front + 5 * PAGE_SIZE, front + 6 * PAGE_SIZE),
        };
        assert_eq!(mapping.top(), front + 5 * PAGE_SIZE);
    }
}
