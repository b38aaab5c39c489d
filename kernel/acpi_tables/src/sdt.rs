//! The generic ACPI system-description-table header every table below
//! starts with, plus the single-byte-sum checksum every one of them is
//! validated against.

use core::{mem, slice};

use kernel_errors::{Error, Result};

/// Common to every ACPI table: RSDT/XSDT entries, MADT, FADT, HPET, MCFG all
/// start with one of these.
#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

impl SdtHeader {
    pub fn data_address(&self) -> usize {
        self as *const _ as usize + mem::size_of::<SdtHeader>()
    }

    pub fn data_len(&self) -> usize {
        let total = self.length as usize;
        let header = mem::size_of::<SdtHeader>();
        total.saturating_sub(header)
    }

    pub fn data(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.data_address() as *const u8, self.data_len()) }
    }

    /// Confirms the signature matches and the whole table (header plus
    /// data, `length` bytes starting at this header) sums to zero.
    pub fn validate(&self, signature: &[u8; 4]) -> Result<()> {
        if &self.signature != signature {
            return Err(Error::invalid_data("acpi_tables: table signature mismatch"));
        }
        validate_checksum(self as *const _ as *const u8, self.length as usize)
    }
}

/// Every ACPI structural checksum (RSDP v1, every SDT) is this same rule:
/// the byte-wide sum of the whole region, including the checksum byte
/// itself, must wrap around to zero.
pub fn validate_checksum(start: *const u8, length: usize) -> Result<()> {
    let bytes = unsafe { slice::from_raw_parts(start, length) };
    let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum == 0 {
        Ok(())
    } else {
        Err(Error::invalid_data("acpi_tables: checksum did not sum to zero"))
    }
}
