//! Abstraction over the boot hand-off: whatever protocol loaded this kernel
//! (multiboot2 on BIOS, a UEFI loader elsewhere) hands it a protocol-specific
//! blob of memory-map, framebuffer, and module records. This crate turns
//! that blob into one [`BootInformation`] trait so the rest of the kernel
//! never has to know which loader it was handed.
#![feature(type_alias_impl_trait)]
#![no_std]

#[macro_use]
extern crate bitflags;

#[cfg(feature = "multiboot2")]
pub mod multiboot2;
#[cfg(feature = "uefi")]
pub mod uefi;

use core::{iter::Iterator, ops::Range};

use kernel_config::memory::KERNEL_OFFSET;
use memory_structs::{PhysicalAddress, VirtualAddress};

bitflags! {
    pub struct ElfSectionFlags: u64 {
        const WRITABLE = 1 << 0;
        const ALLOCATED = 1 << 1;
        const EXECUTABLE = 1 << 2;
    }
}

pub trait MemoryRegion {
    fn start(&self) -> PhysicalAddress;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn is_usable(&self) -> bool;
}

pub trait ElfSection {
    fn name(&self) -> &str;
    fn start(&self) -> VirtualAddress;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn flags(&self) -> ElfSectionFlags;
}

/// One color channel of a packed-pixel framebuffer: how many bits wide it
/// is and how far it's shifted from bit 0.
#[derive(Debug, Clone, Copy)]
pub struct ChannelInfo {
    pub mask_shift: u8,
    pub mask_size: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub physical_address: PhysicalAddress,
    pub virtual_address: Option<VirtualAddress>,
    pub width: usize,
    pub height: usize,
    /// Distance, in bytes, between the start of one scanline and the next.
    pub pitch: usize,
    pub bits_per_pixel: u8,
    pub red: ChannelInfo,
    pub green: ChannelInfo,
    pub blue: ChannelInfo,
}

/// The boot hand-off structure, abstracted over whichever loader produced
/// it. A `'static` bound reflects that this data is only valid until the
/// kernel tears down the loader's identity mappings, at which point nothing
/// may hold a borrow into it across that boundary.
pub trait BootInformation: 'static {
    type MemoryRegion<'a>: MemoryRegion;
    type MemoryRegions<'a>: Iterator<Item = Self::MemoryRegion<'a>>;

    type ElfSection<'a>: ElfSection;
    type ElfSections<'a>: Iterator<Item = Self::ElfSection<'a>>;

    /// The physical range of the loaded kernel image, derived from the
    /// allocated ELF sections. The virtual base is this range's start plus
    /// [`BootInformation::higher_half_offset`].
    fn kernel_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str>;

    /// The region the bootloader itself still occupies: its own page
    /// tables, the boot information structure, and any boot-time (bump)
    /// allocator bookkeeping. Reclaimed by the frame allocator only after
    /// every structure in this trait has been consumed.
    fn bootloader_info_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str>;

    /// The initial ramdisk, if one was loaded alongside the kernel.
    fn modules_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str>;

    fn memory_regions(&self) -> Result<Self::MemoryRegions<'_>, &'static str>;

    fn elf_sections(&self) -> Result<Self::ElfSections<'static>, &'static str>;

    /// The firmware root-system-description-table pointer, if the loader
    /// passed one through.
    fn rsdp(&self) -> Option<PhysicalAddress>;

    /// The first framebuffer the loader reports, if any.
    fn framebuffer(&self) -> Option<FramebufferInfo>;

    /// The kernel's own stack mapping, derived from the `.stack` section
    /// the linker script reserves for it.
    fn stack_range(&self) -> Result<Range<VirtualAddress>, &'static str> {
        let section = self
            .elf_sections()?
            .find(|s| s.name() == ".stack")
            .ok_or("no .stack section")?;
        let start = section.start();
        let end = start + section.len();
        Ok(start..end)
    }

    /// The virtual address at which the higher half begins. Fixed at
    /// compile time by this kernel's linker script rather than negotiated
    /// with the loader.
    fn higher_half_offset(&self) -> usize {
        KERNEL_OFFSET
    }
}
