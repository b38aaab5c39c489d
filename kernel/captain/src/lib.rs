//! Boot orchestration: the single sequenced entry point that takes the
//! bootloader's hand-off information and brings the machine up to the
//! point where every core is running with interrupts, paging, and the
//! firmware-discovered topology in place.
//!
//! This mirrors the teacher's own `captain`, which drives `memory::init`,
//! `interrupts::init`, ACPI/APIC discovery, and AP bring-up in one ordered
//! sequence from `nano_core`. The per-subsystem logic lives in the crates
//! this one depends on; `init` below is just the order they must run in.

#![no_std]

extern crate alloc;

use alloc::vec::Vec;

use boot_info::BootInformation;
use kernel_config::memory::{DEFAULT_PHYSICAL_ADDRESS_BITS, HEAP_OFFSET, HEAP_SIZE_IN_BYTES};
use kernel_errors::{Error, Result};
use memory_structs::{
    Frame, MemoryRange, MemoryRegion, MemoryRegionKind, PhysicalAddress, VirtualAddress, VirtualRange,
};

/// How many frames to reserve for the page-table allocator's dedicated
/// pool. 256 frames (1 MiB) is enough for the several thousand page-table
/// entries a modestly sized address space needs before the pool would ever
/// need to grow; this core doesn't yet support growing it at runtime.
const PAGE_TABLE_POOL_FRAMES: usize = 256;

/// Classifies one boot-reported region into the frame allocator's coarser
/// [`MemoryRegionKind`]. `boot_info::MemoryRegion` only distinguishes usable
/// from non-usable; everything non-usable is folded into `Reserved` except
/// for the sub-1-MiB range, which the frame allocator always treats as
/// [`MemoryRegionKind::LowMemory`] regardless of what the firmware map
/// claims about it.
fn region_kind(region: &impl boot_info::MemoryRegion, _phys_addr_width: u8) -> MemoryRegionKind {
    const ONE_MIB: usize = 0x10_0000;
    if region.start().value() + region.len() <= ONE_MIB {
        MemoryRegionKind::LowMemory
    } else if region.is_usable() {
        MemoryRegionKind::Usable
    } else {
        MemoryRegionKind::Reserved
    }
}

fn collect_memory_regions<B: BootInformation>(info: &B) -> Result<Vec<MemoryRegion>> {
    let regions = info
        .memory_regions()
        .map_err(|_| Error::invalid_data("captain: boot information has no memory map"))?
        .map(|region| MemoryRegion {
            kind: region_kind(&region, DEFAULT_PHYSICAL_ADDRESS_BITS),
            range: MemoryRange::new(
                PhysicalAddress::new_canonical(region.start().value(), DEFAULT_PHYSICAL_ADDRESS_BITS),
                PhysicalAddress::new_canonical(
                    region.start().value() + region.len(),
                    DEFAULT_PHYSICAL_ADDRESS_BITS,
                ),
            ),
        })
        .collect();
    Ok(regions)
}

/// Registers every I/O APIC and legacy interrupt-source override the MADT
/// reports, and returns the BSP's `(processor_id, apic_id)` plus the
/// descriptors of every other enabled local APIC entry (the APs to bring
/// up next).
fn init_apics(madt: &acpi_tables::madt::Madt) -> Result<((u8, u8), Vec<smp::ApDescriptor>)> {
    use acpi_tables::madt::MadtEntry;

    let mut bsp = None;
    let mut aps = Vec::new();

    for entry in madt.entries() {
        match entry {
            MadtEntry::LocalApic(lapic) => {
                // Bit 0 of the processor-local APIC flags: "processor enabled".
                if lapic.flags & 0x1 == 0 {
                    continue;
                }
                if bsp.is_none() {
                    // The first enabled entry is treated as the BSP; this
                    // is the core `init` itself is running on, since the
                    // bootloader always hands off control on the BSP.
                    bsp = Some((lapic.processor_id, lapic.apic_id));
                } else {
                    aps.push(smp::ApDescriptor {
                        processor_id: lapic.processor_id,
                        apic_id: lapic.apic_id,
                    });
                }
            }
            MadtEntry::IoApic(ioapic) => {
                let phys_addr =
                    PhysicalAddress::new_canonical(ioapic.address as usize, DEFAULT_PHYSICAL_ADDRESS_BITS);
                ioapic::IoApic::new(ioapic.id, phys_addr, ioapic.gsi_base)?;
            }
            MadtEntry::IntSrcOverride(iso) => {
                ioapic::register_interrupt_source_override(ioapic::InterruptSourceOverride {
                    bus_source: iso.bus_source,
                    irq_source: iso.irq_source,
                    gsi: iso.gsi,
                    polarity_low: iso.flags & 0x2 != 0,
                    level_triggered: iso.flags & 0x8 != 0,
                });
            }
            MadtEntry::Unknown { kind, length } => {
                log::trace!("captain: skipping unrecognized MADT entry type {} (len {})", kind, length);
            }
        }
    }

    let bsp = bsp.ok_or_else(|| Error::invalid_data("captain: MADT reports no enabled BSP local APIC"))?;
    Ok((bsp, aps))
}

/// Brings every reported AP up using `trampoline_image`, an assembled
/// 16-bit real-mode stub that each core executes before jumping into this
/// kernel's long-mode entry point. That stub is produced by the
/// architecture-specific boot assembly this crate doesn't own; the caller
/// supplies it the same way the bootloader supplies the kernel image
/// itself.
fn bring_up_aps(aps: &[smp::ApDescriptor], trampoline_image: &[u8], trampoline_target: PhysicalAddress) -> usize {
    let vector = match smp::install_trampoline(trampoline_target, trampoline_image) {
        Ok(vector) => vector,
        Err(e) => {
            log::error!("captain: failed to install AP trampoline, leaving all APs parked: {}", e);
            return 0;
        }
    };

    let mut live = 0;
    for ap in aps {
        match smp::bring_up_ap(*ap, vector) {
            Ok(smp::BringUpOutcome::Live) => live += 1,
            Ok(smp::BringUpOutcome::Excluded) => {}
            Err(e) => log::error!("captain: bring-up attempt for apic id {} errored: {}", ap.apic_id, e),
        }
    }
    live
}

/// Reads the physical address of the currently loaded top-level page table
/// (CR3), as left by the bootloader.
fn current_page_table_root() -> PhysicalAddress {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    PhysicalAddress::new_canonical(frame.start_address().as_u64() as usize, DEFAULT_PHYSICAL_ADDRESS_BITS)
}

/// Runs the full boot sequence: memory map ingestion, paging, firmware
/// table discovery, local/IO APIC bring-up, and (if given a trampoline
/// image) the rest of the cores.
///
/// `ap_trampoline` is `None` on a single-core boot or whenever the caller
/// has no trampoline image to hand it; `init` then brings up only the BSP.
pub fn init<B: BootInformation>(info: &B, ap_trampoline: Option<(&[u8], PhysicalAddress)>) -> Result<()> {
    log::info!("captain: starting boot sequence");

    let regions = collect_memory_regions(info)?;
    frame_allocator::init(&regions);

    let pool_base = frame_allocator::allocate_frames(PAGE_TABLE_POOL_FRAMES)?;
    page_table_allocator::init(pool_base, PAGE_TABLE_POOL_FRAMES);

    let current_root = Frame::containing_address(current_page_table_root());
    page_table::init(current_root);
    let page_table = page_table::PageTable::from_root(current_root);

    let heap_range = VirtualRange::new(
        VirtualAddress::new_canonical(HEAP_OFFSET),
        VirtualAddress::new_canonical(HEAP_OFFSET + HEAP_SIZE_IN_BYTES),
    );
    address_space::init(page_table, heap_range);

    let rsdp = info
        .rsdp()
        .ok_or_else(|| Error::not_found("captain: boot information carries no RSDP"))?;
    let tables = acpi_tables::AcpiTables::discover(rsdp)?;
    let madt = tables.madt.ok_or_else(|| Error::not_found("captain: firmware tables have no MADT"))?;

    let ((bsp_processor_id, bsp_apic_id), aps) = init_apics(madt)?;
    apic::LocalApic::init(bsp_processor_id, bsp_apic_id, true)?;
    interrupts::init_per_cpu_table(bsp_apic_id);
    smp::mark_bsp_ready();

    let ap_count = match ap_trampoline {
        Some((image, target)) => bring_up_aps(&aps, image, target),
        None => {
            if !aps.is_empty() {
                log::warn!(
                    "captain: {} AP(s) reported by the MADT but no trampoline image was supplied; booting single-core",
                    aps.len()
                );
            }
            0
        }
    };
    smp::await_all_ready(1 + ap_count);

    // Touches the lazily-initialized notification stream so subscription
    // machinery is ready before any interrupt handler tries to publish to it.
    let _ = notification::stream();

    log::info!("captain: boot sequence complete, {} core(s) online", 1 + ap_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_config::memory::PAGE_SIZE;

    struct FakeRegion {
        start: usize,
        len: usize,
        usable: bool,
    }

    impl boot_info::MemoryRegion for FakeRegion {
        fn start(&self) -> PhysicalAddress {
            PhysicalAddress::new_canonical(self.start, DEFAULT_PHYSICAL_ADDRESS_BITS)
        }

        fn len(&self) -> usize {
            self.len
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    #[test]
    fn region_below_one_mib_is_low_memory_even_if_usable() {
        let region = FakeRegion { start: 0, len: 0x9000, usable: true };
        assert_eq!(region_kind(&region, 40), MemoryRegionKind::LowMemory);
    }

    #[test]
    fn usable_region_above_one_mib_is_usable() {
        let region = FakeRegion { start: 0x10_0000, len: PAGE_SIZE, usable: true };
        assert_eq!(region_kind(&region, 40), MemoryRegionKind::Usable);
    }

    #[test]
    fn non_usable_region_above_one_mib_is_reserved() {
        let region = FakeRegion { start: 0x20_0000, len: PAGE_SIZE, usable: false };
        assert_eq!(region_kind(&region, 40), MemoryRegionKind::Reserved);
    }
}
