//! Firmware table discovery: walks the RSDT/XSDT entry array rooted at the
//! RSDP the boot hand-off gives the kernel, validating and classifying each
//! table by signature. No AML is interpreted and no ACPI namespace is
//! built — only the record fields the kernel core itself consumes.
#![no_std]

extern crate alloc;

#[macro_use]
extern crate bitflags;

pub mod fadt;
pub mod hpet;
pub mod madt;
pub mod mcfg;
pub mod rsdp;
pub mod sdt;

use kernel_config::memory::{DEFAULT_PHYSICAL_ADDRESS_BITS, PHYSICAL_MEMORY_OFFSET};
use kernel_errors::Result;
use memory_structs::PhysicalAddress;

pub use fadt::Fadt;
pub use hpet::Hpet;
pub use madt::Madt;
pub use mcfg::Mcfg;
pub use rsdp::Rsdp;
pub use sdt::SdtHeader;

fn phys_to_direct_map<T>(paddr: PhysicalAddress) -> &'static T {
    let vaddr = PHYSICAL_MEMORY_OFFSET + paddr.value();
    unsafe { &*(vaddr as *const T) }
}

/// Every firmware table the kernel core has located and validated during
/// boot. `madt`, `fadt`, `hpet`, and `mcfg` are each optional: a platform
/// without an IOMMU or PCIe ECAM region simply omits MCFG, for example.
pub struct AcpiTables {
    pub madt: Option<&'static Madt>,
    pub fadt: Option<&'static Fadt>,
    pub hpet: Option<&'static Hpet>,
    pub mcfg: Option<&'static Mcfg>,
}

impl AcpiTables {
    /// Validates the RSDP at `rsdp_paddr`, then walks its root table (RSDT
    /// if revision 0, XSDT if revision 2+) looking for the MADT, FADT,
    /// HPET, and MCFG by signature. Any firmware table found but failing
    /// its own checksum is logged and skipped rather than treated as fatal
    /// for the whole scan.
    pub fn discover(rsdp_paddr: PhysicalAddress) -> Result<AcpiTables> {
        let rsdp: &'static Rsdp = phys_to_direct_map(rsdp_paddr);
        rsdp.validate()?;

        let root_paddr = rsdp.root_table_address();
        let root_header: &'static SdtHeader = phys_to_direct_map(root_paddr);
        let expected_signature = if rsdp.uses_xsdt() { b"XSDT" } else { b"RSDT" };
        root_header.validate(expected_signature)?;

        let mut tables = AcpiTables {
            madt: None,
            fadt: None,
            hpet: None,
            mcfg: None,
        };

        for entry_paddr in RootEntries::new(root_header, rsdp.uses_xsdt()) {
            let header: &'static SdtHeader = phys_to_direct_map(entry_paddr);
            let signature = header.signature;
            let result = match &signature {
                b"APIC" => header.validate(b"APIC").and_then(|()| {
                    let madt = leak(Madt::from_header(header)?);
                    tables.madt = Some(madt);
                    Ok(())
                }),
                b"FACP" => header.validate(b"FACP").and_then(|()| {
                    let fadt = leak(Fadt::from_header(header)?);
                    tables.fadt = Some(fadt);
                    Ok(())
                }),
                b"HPET" => header.validate(b"HPET").and_then(|()| {
                    let hpet = leak(Hpet::from_header(header)?);
                    tables.hpet = Some(hpet);
                    Ok(())
                }),
                b"MCFG" => header.validate(b"MCFG").map(|()| {
                    tables.mcfg = Some(leak(Mcfg::from_header(header)));
                }),
                _ => Ok(()),
            };
            if let Err(e) = result {
                log::warn!(
                    "acpi_tables: skipping table {:?}: {}",
                    core::str::from_utf8(&signature).unwrap_or("????"),
                    e
                );
            }
        }

        Ok(tables)
    }
}

fn leak<T>(value: T) -> &'static T {
    use alloc::boxed::Box;
    Box::leak(Box::new(value))
}

/// Iterates the RSDT/XSDT's entry array, yielding each referenced table's
/// physical address. RSDT entries are 32-bit pointers; XSDT entries are
/// 64-bit.
struct RootEntries {
    data: usize,
    offset: usize,
    len: usize,
    entry_size: usize,
}

impl RootEntries {
    fn new(header: &SdtHeader, uses_xsdt: bool) -> RootEntries {
        RootEntries {
            data: header.data_address(),
            offset: 0,
            len: header.data_len(),
            entry_size: if uses_xsdt { 8 } else { 4 },
        }
    }
}

impl Iterator for RootEntries {
    type Item = PhysicalAddress;

    fn next(&mut self) -> Option<PhysicalAddress> {
        if self.offset + self.entry_size > self.len {
            return None;
        }
        let ptr = (self.data + self.offset) as *const u8;
        let addr = if self.entry_size == 8 {
            unsafe { core::ptr::read_unaligned(ptr as *const u64) as usize }
        } else {
            unsafe { core::ptr::read_unaligned(ptr as *const u32) as usize }
        };
        self.offset += self.entry_size;
        Some(PhysicalAddress::new_canonical(addr, DEFAULT_PHYSICAL_ADDRESS_BITS))
    }
}

#[cfg(test)]
mod tests {
    use super::sdt::validate_checksum;

    #[test]
    fn checksum_of_all_zero_bytes_is_valid() {
        let bytes = [0u8; 16];
        assert!(validate_checksum(bytes.as_ptr(), bytes.len()).is_ok());
    }

    #[test]
    fn checksum_rejects_a_tampered_byte() {
        let mut bytes = [0u8; 16];
        bytes[0] = 1;
        assert!(validate_checksum(bytes.as_ptr(), bytes.len()).is_err());
    }

    #[test]
    fn checksum_accepts_a_correct_nonzero_sum() {
        // Bytes summing to 256 wrap to 0 mod 256.
        let bytes = [0xFFu8, 0x01];
        assert!(validate_checksum(bytes.as_ptr(), bytes.len()).is_ok());
    }
}
