//! The root system description pointer. The boot hand-off gives the kernel
//! this table's physical address directly, so unlike the teacher's
//! `acpi::rsdp`, there is no BIOS-area scan (`0xE_0000..0xF_FFFF`) here.

use kernel_config::memory::DEFAULT_PHYSICAL_ADDRESS_BITS;
use kernel_errors::{Error, Result};
use memory_structs::PhysicalAddress;

use crate::sdt::validate_checksum;

#[repr(C, packed)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

impl Rsdp {
    /// Revision 0 only covers the first 20 (v1) bytes with one 8-byte sum;
    /// revision 2 and above covers the full `length`-byte structure with
    /// the extended sum. Anything else is logged and treated as an XSDT,
    /// matching `original_source`'s `validateRsdpLocator`.
    pub fn validate(&self) -> Result<()> {
        if &self.signature != b"RSD PTR " {
            return Err(Error::invalid_data("acpi_tables: RSDP signature mismatch"));
        }
        let len = match self.revision {
            0 => 20,
            2 => self.length as usize,
            other => {
                log::warn!("acpi_tables: unknown RSDP revision {}, treating as an XSDT", other);
                self.length as usize
            }
        };
        validate_checksum(self as *const _ as *const u8, len)
    }

    pub fn uses_xsdt(&self) -> bool {
        self.revision >= 2
    }

    pub fn root_table_address(&self) -> PhysicalAddress {
        let addr = if self.uses_xsdt() {
            self.xsdt_address as usize
        } else {
            self.rsdt_address as usize
        };
        PhysicalAddress::new_canonical(addr, DEFAULT_PHYSICAL_ADDRESS_BITS)
    }
}
