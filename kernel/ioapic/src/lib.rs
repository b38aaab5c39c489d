//! I/O APIC set: one instance per I/O APIC reported by the interrupt
//! controller table, each remembering the `{id, gsi_base, input_count}`
//! triple that its version register derives. Redirect-entry programming
//! and legacy-IRQ remapping via MADT interrupt-source overrides.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use apic::IvtConfig;
use kernel_errors::{Error, Result};
use memory_structs::PhysicalAddress;
use sync::{IrqSafeMutex, IrqSafeMutexGuard, IrqSafeRwLock};

/// Every I/O APIC supports a fixed number of redirection-table entries,
/// independent of what its version register reports for `input_count`
/// on implementations that clamp the field.
const MAX_REDIRECTION_ENTRIES: u32 = 24;

const IOAPICID: u32 = 0x0;
const IOAPICVER: u32 = 0x1;
const IOREDTBL_BASE: u32 = 0x10;

/// One MADT interrupt-source-override record (type 2): the legacy ISA IRQ
/// `irq_source` is actually wired to GSI `gsi`, with the given polarity and
/// trigger mode instead of the ISA defaults (active-high, edge-triggered).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptSourceOverride {
    pub bus_source: u8,
    pub irq_source: u8,
    pub gsi: u32,
    pub polarity_low: bool,
    pub level_triggered: bool,
}

static INTERRUPT_SOURCE_OVERRIDES: IrqSafeRwLock<Vec<InterruptSourceOverride>> =
    IrqSafeRwLock::new(Vec::new());

/// Registers a MADT interrupt-source-override record. Called while parsing
/// the MADT; harmless to call more than once for the same `irq_source` as
/// long as the firmware table itself doesn't (the last one registered wins).
pub fn register_interrupt_source_override(iso: InterruptSourceOverride) {
    INTERRUPT_SOURCE_OVERRIDES.write().push(iso);
}

fn find_override_for_legacy_irq(legacy_irq: u8) -> Option<InterruptSourceOverride> {
    INTERRUPT_SOURCE_OVERRIDES
        .read()
        .iter()
        .find(|iso| iso.irq_source == legacy_irq)
        .copied()
}

static IOAPICS: IrqSafeRwLock<BTreeMap<u8, IrqSafeMutex<IoApic>>> = IrqSafeRwLock::new(BTreeMap::new());

pub fn get_ioapic(id: u8) -> Option<IrqSafeMutexGuard<'static, IoApic>> {
    // `IOAPICS` is append-only for the lifetime of the kernel (the same
    // contract the teacher's `atomic_linked_list::AtomicMap` makes), so a
    // `'static` reference into one of its values outlives the read guard
    // taken to find it.
    let map = IOAPICS.read();
    let entry = map.get(&id)?;
    let ptr: *const IrqSafeMutex<IoApic> = entry;
    drop(map);
    Some(unsafe { &*ptr }.lock())
}

/// Finds the I/O APIC whose `[gsi_base, gsi_base + input_count)` contains
/// `gsi`, if any.
fn ioapic_for_gsi(gsi: u32) -> Option<IrqSafeMutexGuard<'static, IoApic>> {
    let map = IOAPICS.read();
    for entry in map.values() {
        let guard = entry.lock();
        if guard.handles_gsi(gsi) {
            let ptr: *const IrqSafeMutex<IoApic> = entry;
            drop(guard);
            drop(map);
            return Some(unsafe { &*ptr }.lock());
        }
    }
    None
}

/// Chooses which I/O APIC register the next access targets, then reads or
/// writes the data window one register over. Both registers live on the
/// same 4 KiB MMIO page.
struct IoApicRegs {
    base: *mut u32,
}

impl IoApicRegs {
    unsafe fn read(&mut self, register_index: u32) -> u32 {
        core::ptr::write_volatile(self.base, register_index);
        core::ptr::read_volatile(self.base.add(4))
    }

    unsafe fn write(&mut self, register_index: u32, value: u32) {
        core::ptr::write_volatile(self.base, register_index);
        core::ptr::write_volatile(self.base.add(4), value)
    }
}

/// One I/O APIC chip.
pub struct IoApic {
    regs: IoApicRegs,
    pub id: u8,
    gsi_base: u32,
    input_count: u32,
}

// SAFETY: the MMIO page is exclusively owned by this `IoApic` and every
// access goes through the `IrqSafeMutex` wrapping it.
unsafe impl Send for IoApic {}

impl IoApic {
    /// Maps the I/O APIC's register page and registers it under `id`.
    pub fn new(id: u8, phys_addr: PhysicalAddress, gsi_base: u32) -> Result<()> {
        let ptr = address_space::KERNEL_ADDRESS_SPACE
            .lock()
            .as_mut()
            .ok_or_else(|| Error::not_supported("ioapic: kernel address space not initialized"))?
            .map_mmio::<u32>(phys_addr)?;

        let mut regs = IoApicRegs { base: ptr };
        let version_reg = unsafe { regs.read(IOAPICVER) };
        let input_count = ((version_reg >> 16) & 0xFF) + 1;
        let input_count = input_count.min(MAX_REDIRECTION_ENTRIES);

        let ioapic = IoApic { regs, id, gsi_base, input_count };
        log::debug!("ioapic: registered id={} gsi_base={} input_count={}", id, gsi_base, input_count);
        IOAPICS.write().insert(id, IrqSafeMutex::new(ioapic));
        Ok(())
    }

    pub fn handles_gsi(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.input_count
    }

    fn redirection_table_index(&self, gsi: u32) -> u32 {
        IOREDTBL_BASE + 2 * (gsi - self.gsi_base)
    }

    /// Writes the 64-bit redirection entry for `gsi`: low dword from `ivt`,
    /// high dword's top byte set to `target_lapic`.
    pub fn set_redirect(&mut self, ivt: IvtConfig, gsi: u32, target_lapic: u8) -> Result<()> {
        if !self.handles_gsi(gsi) {
            return Err(Error::invalid_input("ioapic: gsi not handled by this I/O APIC"));
        }
        let low_index = self.redirection_table_index(gsi);
        let high_index = low_index + 1;

        let mut high = unsafe { self.regs.read(high_index) };
        high &= !0xFF00_0000;
        high |= (target_lapic as u32) << 24;
        unsafe { self.regs.write(high_index, high) };

        let low = ivt.as_lvt_bits();
        unsafe { self.regs.write(low_index, low) };
        Ok(())
    }

    pub fn mask_gsi(&mut self, gsi: u32) -> Result<()> {
        if !self.handles_gsi(gsi) {
            return Err(Error::invalid_input("ioapic: gsi not handled by this I/O APIC"));
        }
        let low_index = self.redirection_table_index(gsi);
        let current = unsafe { self.regs.read(low_index) };
        unsafe { self.regs.write(low_index, current | (1 << 16)) };
        Ok(())
    }
}

/// Writes a redirection entry for `gsi` on whichever I/O APIC's range
/// contains it. Unknown GSI is a soft warning, per the spec.
pub fn set_redirect(ivt: IvtConfig, gsi: u32, target_lapic: u8) -> Result<()> {
    match ioapic_for_gsi(gsi) {
        Some(mut ioapic) => ioapic.set_redirect(ivt, gsi, target_lapic),
        None => {
            log::warn!("ioapic: no I/O APIC handles gsi {}", gsi);
            Err(Error::not_found("ioapic: no I/O APIC handles this gsi"))
        }
    }
}

/// Remaps `legacy_irq` to its actual GSI via any registered
/// interrupt-source-override, fixing up polarity/trigger to match, then
/// calls [`set_redirect`].
pub fn set_legacy_redirect(mut ivt: IvtConfig, legacy_irq: u8, target_lapic: u8) -> Result<()> {
    let gsi = match find_override_for_legacy_irq(legacy_irq) {
        Some(iso) => {
            ivt.polarity_low = iso.polarity_low;
            ivt.trigger_mode = if iso.level_triggered {
                apic::TriggerMode::Level
            } else {
                apic::TriggerMode::Edge
            };
            iso.gsi
        }
        None => legacy_irq as u32,
    };
    set_redirect(ivt, gsi, target_lapic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_remaps_legacy_irq_to_its_gsi() {
        INTERRUPT_SOURCE_OVERRIDES.write().clear();
        register_interrupt_source_override(InterruptSourceOverride {
            bus_source: 0,
            irq_source: 0,
            gsi: 2,
            polarity_low: false,
            level_triggered: false,
        });
        assert_eq!(find_override_for_legacy_irq(0).map(|iso| iso.gsi), Some(2));
        assert_eq!(find_override_for_legacy_irq(5), None);
    }

    #[test]
    fn redirection_table_index_is_two_words_per_gsi() {
        let regs = IoApicRegs { base: core::ptr::null_mut() };
        let ioapic = IoApic { regs, id: 0, gsi_base: 0, input_count: 24 };
        assert_eq!(ioapic.redirection_table_index(0), IOREDTBL_BASE);
        assert_eq!(ioapic.redirection_table_index(3), IOREDTBL_BASE + 6);
    }

    #[test]
    fn handles_gsi_respects_input_count_window() {
        let regs = IoApicRegs { base: core::ptr::null_mut() };
        let ioapic = IoApic { regs, id: 0, gsi_base: 16, input_count: 8 };
        assert!(ioapic.handles_gsi(16));
        assert!(ioapic.handles_gsi(23));
        assert!(!ioapic.handles_gsi(24));
        assert!(!ioapic.handles_gsi(15));
    }
}
