use core::{cmp, iter::Iterator, ops::Range};

use kernel_config::memory::{DEFAULT_PHYSICAL_ADDRESS_BITS, KERNEL_OFFSET};
use memory_structs::{PhysicalAddress, VirtualAddress};

use crate::{ChannelInfo, ElfSectionFlags, FramebufferInfo};

impl<'a> crate::MemoryRegion for &'a multiboot2::MemoryArea {
    fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.start_address() as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
    }

    fn len(&self) -> usize {
        multiboot2::MemoryArea::size(self) as usize
    }

    fn is_usable(&self) -> bool {
        matches!(self.typ(), multiboot2::MemoryAreaType::Available)
    }
}

type MemoryRegionIterator<'a> = impl Iterator<Item = &'a multiboot2::MemoryArea>;

pub struct MemoryRegions<'a> {
    inner: MemoryRegionIterator<'a>,
}

impl<'a> Iterator for MemoryRegions<'a> {
    type Item = &'a multiboot2::MemoryArea;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl crate::ElfSection for multiboot2::ElfSection {
    fn name(&self) -> &str {
        multiboot2::ElfSection::name(self)
    }

    fn start(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.start_address() as usize)
    }

    fn len(&self) -> usize {
        multiboot2::ElfSection::size(self) as usize
    }

    fn flags(&self) -> ElfSectionFlags {
        let mut boot_info_flags = ElfSectionFlags::empty();
        let flags = multiboot2::ElfSection::flags(self);

        if flags.contains(multiboot2::ElfSectionFlags::WRITABLE) {
            boot_info_flags |= ElfSectionFlags::WRITABLE;
        }
        if flags.contains(multiboot2::ElfSectionFlags::ALLOCATED) {
            boot_info_flags |= ElfSectionFlags::ALLOCATED;
        }
        if flags.contains(multiboot2::ElfSectionFlags::EXECUTABLE) {
            boot_info_flags |= ElfSectionFlags::EXECUTABLE;
        }

        boot_info_flags
    }
}

impl crate::BootInformation for multiboot2::BootInformation {
    type MemoryRegion<'a> = &'a multiboot2::MemoryArea;
    type MemoryRegions<'a> = MemoryRegions<'a>;

    type ElfSection<'a> = multiboot2::ElfSection;
    type ElfSections<'a> = multiboot2::ElfSectionIter;

    fn kernel_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str> {
        // The linker script places `.init` at 1 MB physical and every other
        // kernel section at `KERNEL_OFFSET + 1 MB` virtual; they're remapped
        // onto their final physical frames later in `paging::init`. So the
        // start of the kernel image is already a physical address, but the
        // end is still expressed as a virtual one.
        let start = PhysicalAddress::new(
            self.elf_sections()?
                .filter(|section| {
                    multiboot2::ElfSection::flags(section).contains(multiboot2::ElfSectionFlags::ALLOCATED)
                })
                .map(|section| section.start_address())
                .min()
                .ok_or("couldn't find kernel start address")? as usize,
            DEFAULT_PHYSICAL_ADDRESS_BITS,
        )
        .ok_or("kernel physical start address was invalid")?;

        let virtual_end = VirtualAddress::new(
            self.elf_sections()?
                .filter(|section| {
                    multiboot2::ElfSection::flags(section).contains(multiboot2::ElfSectionFlags::ALLOCATED)
                })
                .map(|section| section.end_address())
                .max()
                .ok_or("couldn't find kernel end address")? as usize,
        )
        .ok_or("kernel virtual end address was invalid")?;
        let physical_end = PhysicalAddress::new(
            virtual_end.value() - KERNEL_OFFSET,
            DEFAULT_PHYSICAL_ADDRESS_BITS,
        )
        .ok_or("kernel physical end address was invalid")?;

        Ok(start..physical_end)
    }

    fn bootloader_info_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str> {
        let start = PhysicalAddress::new(self.start_address(), DEFAULT_PHYSICAL_ADDRESS_BITS)
            .ok_or("invalid bootloader info start address")?;
        let end = PhysicalAddress::new(self.end_address(), DEFAULT_PHYSICAL_ADDRESS_BITS)
            .ok_or("invalid bootloader info end address")?;
        Ok(start..end)
    }

    fn modules_memory_range(&self) -> Result<Range<PhysicalAddress>, &'static str> {
        let mut min = usize::MAX;
        let mut max = 0;

        for module in self.module_tags() {
            min = cmp::min(min, module.start_address() as usize);
            max = cmp::max(max, module.end_address() as usize);
        }

        if min > max {
            return Err("no modules present");
        }

        Ok(PhysicalAddress::new_canonical(min, DEFAULT_PHYSICAL_ADDRESS_BITS)
            ..PhysicalAddress::new_canonical(max, DEFAULT_PHYSICAL_ADDRESS_BITS))
    }

    fn memory_regions(&self) -> Result<Self::MemoryRegions<'_>, &'static str> {
        Ok(MemoryRegions {
            inner: self
                .memory_map_tag()
                .ok_or("no memory map tag")?
                .memory_areas(),
        })
    }

    fn elf_sections(&self) -> Result<Self::ElfSections<'static>, &'static str> {
        Ok(self
            .elf_sections_tag()
            .ok_or("no elf sections tag")?
            .sections())
    }

    fn rsdp(&self) -> Option<PhysicalAddress> {
        self.rsdp_v2_tag()
            .map(|tag| tag.signature())
            .or_else(|| self.rsdp_v1_tag().map(|tag| tag.signature()))
            .and_then(|utf8_result| utf8_result.ok())
            .map(|signature| signature as *const _ as *const () as usize)
            .and_then(PhysicalAddress::new)
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        let tag = self.framebuffer_tag()?.ok()?;
        let multiboot2::FramebufferType::RGB { red, green, blue } = tag.buffer_type().ok()? else {
            return None;
        };

        Some(FramebufferInfo {
            physical_address: PhysicalAddress::new_canonical(
                tag.address() as usize,
                DEFAULT_PHYSICAL_ADDRESS_BITS,
            ),
            virtual_address: None,
            width: tag.width() as usize,
            height: tag.height() as usize,
            pitch: tag.pitch() as usize,
            bits_per_pixel: tag.bpp(),
            red: ChannelInfo {
                mask_shift: red.position,
                mask_size: red.size,
            },
            green: ChannelInfo {
                mask_shift: green.position,
                mask_size: green.size,
            },
            blue: ChannelInfo {
                mask_shift: blue.position,
                mask_size: blue.size,
            },
        })
    }
}
