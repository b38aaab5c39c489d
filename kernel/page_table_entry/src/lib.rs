//! The page-flag and memory-type API used above the raw page table, and the
//! raw x86_64 entry encoding beneath it.
//!
//! [`PageFlags`] is architecture-neutral in spirit even though this crate
//! only targets x86_64: it never exposes `entryflags_x86_64::EntryFlags`
//! directly, so a caller building a mapping never has to know which
//! hardware bit happens to mean "writable" on this machine.

#![no_std]

use bit_field::BitField;
use entryflags_x86_64::EntryFlags;
use kernel_config::memory::{
    DEFAULT_PHYSICAL_ADDRESS_BITS, MAX_PHYSICAL_ADDRESS_BITS, MIN_PHYSICAL_ADDRESS_BITS,
    PAGE_SIZE, PAGE_SIZE_1GB, PAGE_SIZE_2MB,
};
use kernel_errors::{Error, Result};
use memory_structs::PhysicalAddress;
use static_assertions::const_assert_eq;

/// The memory types a page can be mapped with, in terms of the Page
/// Attribute Table rather than the raw PAT/PCD/PWT bit encoding.
///
/// This kernel reprograms the PAT MSR at boot (see `page_table::init_pat`)
/// so that PAT slot 1 holds Write-Combining instead of the Intel-default
/// Write-Through; the mapping from [`MemoryType`] to PAT slot below assumes
/// that reprogramming has already happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Cached, write-back. The default for ordinary RAM.
    WriteBack,
    /// Cached, write-through. Rarely used.
    WriteThrough,
    /// Uncached, but writes may be combined into larger bus transactions.
    /// Used for framebuffers and other streaming MMIO writes.
    WriteCombine,
    /// Fully uncached, speculative reads disallowed. Used for MMIO registers
    /// with read side effects.
    Uncached,
    /// Fully uncached, but speculative reads are allowed. Used for MMIO
    /// regions without read side effects.
    UncachedMinus,
}

impl MemoryType {
    /// The PAT slot (0-7) this memory type is programmed into.
    const fn pat_slot(self) -> u8 {
        match self {
            MemoryType::WriteBack => 0,
            MemoryType::WriteCombine => 1,
            MemoryType::UncachedMinus => 2,
            MemoryType::Uncached => 3,
            MemoryType::WriteThrough => 4,
        }
    }

    /// Decodes `(pwt, pcd, pat)` into a `MemoryType`, given the same PAT
    /// programming assumed by [`Self::pat_slot`].
    fn from_bits(pwt: bool, pcd: bool, pat: bool) -> MemoryType {
        let slot = (pat as u8) << 2 | (pcd as u8) << 1 | (pwt as u8);
        match slot {
            0 => MemoryType::WriteBack,
            1 => MemoryType::WriteCombine,
            2 => MemoryType::UncachedMinus,
            3 => MemoryType::Uncached,
            4 => MemoryType::WriteThrough,
            _ => MemoryType::Uncached,
        }
    }

    /// Encodes this memory type as `(pwt, pcd, pat)`.
    fn to_bits(self) -> (bool, bool, bool) {
        let slot = self.pat_slot();
        (slot & 0b001 != 0, slot & 0b010 != 0, slot & 0b100 != 0)
    }
}

/// The permission and caching attributes a mapping is created with.
///
/// Internally this is just a thin, intentionally smaller view onto
/// [`EntryFlags`]: [`PageFlags`] never exposes `ACCESSED`, `DIRTY`, or
/// `HUGE_PAGE`, which are managed by the page table engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags {
    flags: EntryFlags,
    memory_type: MemoryType,
}

impl PageFlags {
    fn base() -> PageFlags {
        PageFlags { flags: EntryFlags::PRESENT | EntryFlags::NO_EXECUTE, memory_type: MemoryType::WriteBack }
    }

    /// Read-only, non-executable, kernel-only, write-back. The safe default.
    pub fn new() -> PageFlags {
        Self::base()
    }

    /// Executable, read-only, kernel-only code mapping.
    pub fn code() -> PageFlags {
        let mut f = Self::base();
        f.flags.remove(EntryFlags::NO_EXECUTE);
        f
    }

    /// Writable, non-executable, kernel-only data mapping.
    pub fn data() -> PageFlags {
        Self::base().writable(true)
    }

    /// Readable, writable, executable, accessible to user mode. Used only by
    /// tests and by the (out-of-scope) process loader's placeholder.
    pub fn all() -> PageFlags {
        PageFlags { flags: EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE, memory_type: MemoryType::WriteBack }
    }

    pub fn writable(mut self, writable: bool) -> PageFlags {
        self.flags.set(EntryFlags::WRITABLE, writable);
        self
    }

    pub fn executable(mut self, executable: bool) -> PageFlags {
        self.flags.set(EntryFlags::NO_EXECUTE, !executable);
        self
    }

    pub fn user_accessible(mut self, accessible: bool) -> PageFlags {
        self.flags.set(EntryFlags::USER_ACCESSIBLE, accessible);
        self
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> PageFlags {
        self.memory_type = memory_type;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.flags.is_writable()
    }

    pub fn is_executable(&self) -> bool {
        self.flags.is_executable()
    }

    pub fn is_user_accessible(&self) -> bool {
        self.flags.contains(EntryFlags::USER_ACCESSIBLE)
    }

    pub fn get_memory_type(&self) -> MemoryType {
        self.memory_type
    }

    fn to_entry_flags(self, huge: bool) -> EntryFlags {
        let (pwt, pcd, pat) = self.memory_type.to_bits();
        let mut flags = self.flags;
        flags.set(EntryFlags::WRITE_THROUGH, pwt);
        flags.set(EntryFlags::NO_CACHE, pcd);
        if huge {
            flags.set(EntryFlags::HUGE_PAGE, true);
        }
        // The PAT bit shares bit position 7 with HUGE_PAGE for 4 KiB entries
        // and bit 12 for huge entries; bit 12 isn't representable in
        // `EntryFlags`, so huge-page PAT selection is folded in by the raw
        // `Pte` setters below rather than here.
        if pat && !huge {
            flags |= EntryFlags::HUGE_PAGE; // reused as the 4K PAT bit, see `Pte`
        }
        flags
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// A single raw x86_64 page table entry: present bit, flags, and a 4 KiB,
/// 2 MiB, or 1 GiB-aligned physical address packed into one 64-bit word.
#[derive(Clone, Copy, Default, zerocopy::FromBytes, zerocopy::AsBytes)]
#[repr(transparent)]
pub struct Pte(u64);

const_assert_eq!(core::mem::size_of::<Pte>(), 8);

/// Bit 12 in a huge-page (2 MiB / 1 GiB) leaf entry selects the PAT slot's
/// high bit, distinct from bit 7 used by 4 KiB entries.
const HUGE_PAT_BIT: usize = 12;
const ADDR_BITS_LOW: usize = 12;

impl Pte {
    pub const fn unused() -> Pte {
        Pte(0)
    }

    pub fn is_unused(&self) -> bool {
        self.0 == 0
    }

    pub fn is_present(&self) -> bool {
        self.0.get_bit(0)
    }

    pub fn is_huge(&self) -> bool {
        self.0.get_bit(7)
    }

    pub fn set_unused(&mut self) {
        self.0 = 0;
    }

    /// Decodes the address and flags of a non-huge (4 KiB) entry.
    pub fn address_4k(&self, phys_addr_width: u8) -> Option<PhysicalAddress> {
        if !self.is_present() {
            return None;
        }
        let addr_mask = (1u64 << phys_addr_width) - 1;
        let addr = (self.0 & addr_mask) & !((1u64 << ADDR_BITS_LOW) - 1);
        PhysicalAddress::new(addr as usize, phys_addr_width)
    }

    pub fn flags_4k(&self) -> PageFlags {
        self.decode_flags(false)
    }

    /// Decodes the address and flags of a huge entry, `page_size` being
    /// `PAGE_SIZE_2MB` or `PAGE_SIZE_1GB`.
    pub fn address_huge(&self, phys_addr_width: u8, page_size: usize) -> Option<PhysicalAddress> {
        if !self.is_present() || !self.is_huge() {
            return None;
        }
        let align_bits = page_size.trailing_zeros() as usize;
        let addr_mask = (1u64 << phys_addr_width) - 1;
        let addr = (self.0 & addr_mask) & !((1u64 << align_bits) - 1);
        PhysicalAddress::new(addr as usize, phys_addr_width)
    }

    pub fn flags_huge(&self) -> PageFlags {
        self.decode_flags(true)
    }

    fn decode_flags(&self, huge: bool) -> PageFlags {
        let raw = EntryFlags::from_bits_truncate(self.0);
        let pat = if huge { self.0.get_bit(HUGE_PAT_BIT) } else { raw.contains(EntryFlags::HUGE_PAGE) };
        let memory_type = MemoryType::from_bits(
            raw.contains(EntryFlags::WRITE_THROUGH),
            raw.contains(EntryFlags::NO_CACHE),
            pat,
        );
        let mut flags = raw;
        flags.remove(EntryFlags::WRITE_THROUGH | EntryFlags::NO_CACHE | EntryFlags::HUGE_PAGE | EntryFlags::ACCESSED | EntryFlags::DIRTY);
        PageFlags { flags, memory_type }
    }

    /// Writes a present 4 KiB leaf entry pointing at `addr` with `flags`.
    pub fn set_entry_4k(&mut self, addr: PhysicalAddress, flags: PageFlags) -> Result<()> {
        if !addr.is_aligned(PAGE_SIZE) {
            return Err(Error::invalid_input("set_entry_4k: address not 4 KiB-aligned"));
        }
        let mut bits = addr.value() as u64 | flags.to_entry_flags(false).bits();
        let (_, _, pat) = flags.memory_type.to_bits();
        bits.set_bit(7, pat); // 4K entries: PAT bit shares position 7
        self.0 = bits;
        Ok(())
    }

    /// Writes a present huge leaf entry (`page_size` = 2 MiB or 1 GiB).
    pub fn set_entry_huge(&mut self, addr: PhysicalAddress, flags: PageFlags, page_size: usize) -> Result<()> {
        if page_size != PAGE_SIZE_2MB && page_size != PAGE_SIZE_1GB {
            return Err(Error::invalid_input("set_entry_huge: page_size must be 2 MiB or 1 GiB"));
        }
        if !addr.is_aligned(page_size) {
            return Err(Error::invalid_input("set_entry_huge: address not aligned to page_size"));
        }
        let mut bits = addr.value() as u64 | flags.to_entry_flags(true).bits();
        let (_, _, pat) = flags.memory_type.to_bits();
        bits.set_bit(HUGE_PAT_BIT, pat);
        self.0 = bits;
        Ok(())
    }

    /// Writes an entry pointing at a next-level page table frame (always
    /// present, writable, and carrying neither huge-page nor cache bits).
    pub fn set_entry_to_table(&mut self, addr: PhysicalAddress) {
        let bits = addr.value() as u64 | (EntryFlags::PRESENT | EntryFlags::WRITABLE).bits();
        self.0 = bits;
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The physical-address width to assume until CPUID `0x8000_0008` has been
/// consulted. Clamped to the architecture's supported range.
pub fn default_physical_address_width() -> u8 {
    DEFAULT_PHYSICAL_ADDRESS_BITS.clamp(MIN_PHYSICAL_ADDRESS_BITS, MAX_PHYSICAL_ADDRESS_BITS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trip_4k() {
        let mut pte = Pte::unused();
        assert!(pte.is_unused());
        let addr = PhysicalAddress::new(0x1000 * 42, 52).unwrap();
        let flags = PageFlags::data();
        pte.set_entry_4k(addr, flags).unwrap();
        assert!(pte.is_present());
        assert!(!pte.is_huge());
        assert_eq!(pte.address_4k(52).unwrap(), addr);
        assert!(pte.flags_4k().is_writable());
    }

    #[test]
    fn entry_round_trip_huge() {
        let mut pte = Pte::unused();
        let addr = PhysicalAddress::new(PAGE_SIZE_2MB * 3, 52).unwrap();
        pte.set_entry_huge(addr, PageFlags::data(), PAGE_SIZE_2MB).unwrap();
        assert!(pte.is_huge());
        assert_eq!(pte.address_huge(52, PAGE_SIZE_2MB).unwrap(), addr);
    }

    #[test]
    fn rejects_misaligned_address() {
        let mut pte = Pte::unused();
        let addr = PhysicalAddress::new(0x1234, 52).unwrap();
        assert!(pte.set_entry_4k(addr, PageFlags::data()).is_err());
    }

    #[test]
    fn memory_type_round_trips_through_bits() {
        for mt in [
            MemoryType::WriteBack,
            MemoryType::WriteThrough,
            MemoryType::WriteCombine,
            MemoryType::Uncached,
            MemoryType::UncachedMinus,
        ] {
            let (pwt, pcd, pat) = mt.to_bits();
            assert_eq!(MemoryType::from_bits(pwt, pcd, pat), mt);
        }
    }
}
