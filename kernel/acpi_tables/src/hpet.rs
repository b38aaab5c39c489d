//! The ACPI HPET description table — distinct from the runtime MMIO
//! register block it points at. This only carries enough to locate and
//! size that block; the register layout itself lives elsewhere.

use core::ptr;

use kernel_errors::{Error, Result};

use crate::sdt::SdtHeader;

#[repr(C, packed)]
struct HpetFields {
    event_timer_block_id: u32,
    base_address: GenericAddress,
    hpet_number: u8,
    minimum_tick: u16,
    page_protection: u8,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GenericAddress {
    pub address_space_id: u8,
    pub register_bit_width: u8,
    pub register_bit_offset: u8,
    pub reserved: u8,
    pub address: u64,
}

pub struct Hpet {
    pub event_timer_block_id: u32,
    pub base_address: GenericAddress,
    pub hpet_number: u8,
    pub minimum_tick: u16,
}

impl Hpet {
    pub(crate) fn from_header(header: &'static SdtHeader) -> Result<Hpet> {
        if header.data_len() < core::mem::size_of::<HpetFields>() {
            return Err(Error::invalid_data("acpi_tables: HPET table shorter than its fixed fields"));
        }
        let fields = unsafe { ptr::read_unaligned(header.data_address() as *const HpetFields) };
        Ok(Hpet {
            event_timer_block_id: fields.event_timer_block_id,
            base_address: fields.base_address,
            hpet_number: fields.hpet_number,
            minimum_tick: fields.minimum_tick,
        })
    }

    /// Bit 13 of `event_timer_block_id` (COUNT_SIZE_CAP) says whether the
    /// main counter this block exposes is 64 bits wide or only 32.
    pub fn counter_size_is_64_bit(&self) -> bool {
        self.event_timer_block_id & (1 << 13) != 0
    }
}
