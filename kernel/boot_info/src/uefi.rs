use bootloader_api::info;
use core::{iter::Iterator, ops::Range};
use kernel_config::memory::DEFAULT_PHYSICAL_ADDRESS_BITS;
use memory_structs::{PhysicalAddress, VirtualAddress};
use xmas_elf::ElfFile;

use crate::{ChannelInfo, ElfSectionFlags, FramebufferInfo};

impl<'a> crate::MemoryRegion for &'a info::MemoryRegion {
    fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.start as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
    }

    fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    fn is_usable(&self) -> bool {
        matches!(self.kind, info::MemoryRegionKind::Usable)
    }
}

pub struct ElfSection {
    name: Option<&'static str>,
    start: usize,
    size: usize,
    flags: ElfSectionFlags,
}

impl crate::ElfSection for ElfSection {
    fn name(&self) -> &str {
        self.name.unwrap_or_default()
    }

    fn start(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.start)
    }

    fn len(&self) -> usize {
        self.size
    }

    fn flags(&self) -> ElfSectionFlags {
        self.flags
    }
}

pub struct ElfSections {
    file: ElfFile<'static>,
    index: u16,
}

impl Iterator for ElfSections {
    type Item = ElfSection;

    fn next(&mut self) -> Option<Self::Item> {
        let count = self.file.header.pt2.sh_count();
        loop {
            if self.index >= count {
                return None;
            }
            let section = self.file.section_header(self.index).ok()?;
            self.index += 1;

            let raw_flags = section.flags();
            let is_allocated = raw_flags & 0x2 != 0; // SHF_ALLOC

            return Some(ElfSection {
                name: section.get_name(&self.file).ok(),
                start: section.address() as usize,
                size: section.size() as usize,
                flags: {
                    let mut flags = ElfSectionFlags::empty();
                    if raw_flags & 0x1 != 0 {
                        flags |= ElfSectionFlags::WRITABLE;
                    }
                    if is_allocated {
                        flags |= ElfSectionFlags::ALLOCATED;
                    }
                    if raw_flags & 0x4 != 0 {
                        flags |= ElfSectionFlags::EXECUTABLE;
                    }
                    flags
                },
            });
        }
    }
}

impl crate::BootInformation for &'static bootloader_api::BootInfo {
    type MemoryRegion<'a> = &'a info::MemoryRegion;
    type MemoryRegions<'a> = core::slice::Iter<'a, info::MemoryRegion>;

    type ElfSection<'a> = ElfSection;
    type ElfSections<'a> = ElfSections;

    // The bootloader creates two memory regions with the `Bootloader` kind. The
    // first always starts at 0x1000 and holds the page tables, boot info, and
    // other bookkeeping; the second holds the kernel ELF image and is the same
    // size as the nano_core binary.

    fn kernel_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str> {
        let mut iter = self
            .memory_regions
            .iter()
            .filter(|region| region.kind == info::MemoryRegionKind::Bootloader)
            .filter(|region| region.start != 0x1000);

        let kernel_memory_region = iter.next().ok_or("no kernel memory region")?;

        if iter.next().is_some() {
            Err("multiple potential kernel memory regions")
        } else {
            let start = PhysicalAddress::new(kernel_memory_region.start as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
                .ok_or("invalid kernel start address")?;
            let end = PhysicalAddress::new(kernel_memory_region.end as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
                .ok_or("invalid kernel end address")?;
            Ok(start..end)
        }
    }

    fn bootloader_info_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str> {
        let mut iter = self
            .memory_regions
            .iter()
            .filter(|region| region.kind == info::MemoryRegionKind::Bootloader)
            .filter(|region| region.start == 0x1000);

        let region = iter.next().ok_or("no bootloader info memory region")?;
        if iter.next().is_some() {
            Err("multiple potential bootloader info memory regions")
        } else {
            let start = PhysicalAddress::new(region.start as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
                .ok_or("invalid bootloader info start")?;
            let end = PhysicalAddress::new(region.end as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
                .ok_or("invalid bootloader info end")?;
            Ok(start..end)
        }
    }

    fn modules_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str> {
        let addr = self.ramdisk_addr.into_option().ok_or("no ramdisk present")?;
        let start = PhysicalAddress::new(addr as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
            .ok_or("invalid ramdisk start address")?;
        let end = PhysicalAddress::new(addr as usize + self.ramdisk_len as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
            .ok_or("invalid ramdisk end address")?;
        Ok(start..end)
    }

    fn memory_regions(&self) -> Result<Self::MemoryRegions<'_>, &'static str> {
        Ok(self.memory_regions.iter())
    }

    // Not `'static` in the strict sense: this slice aliases the kernel image
    // through the direct physical map and must not be read after that
    // mapping is torn down.
    fn elf_sections(&self) -> Result<Self::ElfSections<'static>, &'static str> {
        let kernel_memory_range = self.kernel_memory_range()?;
        let physical_memory_offset = self
            .physical_memory_offset
            .into_option()
            .ok_or("physical memory offset not given")?;

        let kernel_virtual_start = (kernel_memory_range.start.value() + physical_memory_offset as usize)
            as *const u8;
        let kernel_length = kernel_memory_range.end.value() - kernel_memory_range.start.value();

        let kernel_bytes: &'static [u8] =
            unsafe { core::slice::from_raw_parts(kernel_virtual_start, kernel_length) };

        let file = xmas_elf::ElfFile::new(kernel_bytes).map_err(|_| "malformed kernel ELF image")?;
        Ok(ElfSections { file, index: 0 })
    }

    fn rsdp(&self) -> Option<PhysicalAddress> {
        self.rsdp_addr
            .into_option()
            .and_then(|addr| PhysicalAddress::new(addr as usize, DEFAULT_PHYSICAL_ADDRESS_BITS))
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        let fb = self.framebuffer.as_ref()?;
        let info = fb.info();
        if info.pixel_format != bootloader_api::info::PixelFormat::Rgb {
            return None;
        }

        // `PixelFormat::Rgb` doesn't carry per-channel bit layout, just a
        // byte order; the standard 8-bit-per-channel packing is assumed.
        Some(FramebufferInfo {
            physical_address: PhysicalAddress::new_canonical(
                fb.buffer() as *const _ as *const u8 as usize,
                DEFAULT_PHYSICAL_ADDRESS_BITS,
            ),
            virtual_address: None,
            width: info.width,
            height: info.height,
            pitch: info.stride * info.bytes_per_pixel,
            bits_per_pixel: (info.bytes_per_pixel * 8) as u8,
            red: ChannelInfo {
                mask_shift: 0,
                mask_size: 8,
            },
            green: ChannelInfo {
                mask_shift: 8,
                mask_size: 8,
            },
            blue: ChannelInfo {
                mask_shift: 16,
                mask_size: 8,
            },
        })
    }
}
