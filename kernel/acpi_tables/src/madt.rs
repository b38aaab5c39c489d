//! The Multiple APIC Description Table: local-APIC address/flags plus the
//! variable-length entry stream §6 names — local APIC, I/O APIC, and
//! interrupt-source-override records; every other entry type is walked
//! past but not interpreted.

use core::{mem, ptr};

use kernel_errors::{Error, Result};

use crate::sdt::SdtHeader;

bitflags! {
    pub struct MadtFlags: u32 {
        /// The system also has a PC-AT-compatible dual 8259 PIC, which must
        /// be masked off before the APICs are programmed.
        const PCAT_COMPAT = 1 << 0;
    }
}

pub struct Madt {
    header: &'static SdtHeader,
    pub local_apic_address: u32,
    pub flags: MadtFlags,
}

impl Madt {
    pub(crate) fn from_header(header: &'static SdtHeader) -> Result<Madt> {
        if header.data_len() < 8 {
            return Err(Error::invalid_data("acpi_tables: MADT has no local APIC address/flags"));
        }
        let data = header.data_address();
        let local_apic_address = unsafe { ptr::read_unaligned(data as *const u32) };
        let flags_raw = unsafe { ptr::read_unaligned((data as *const u32).add(1)) };
        Ok(Madt {
            header,
            local_apic_address,
            flags: MadtFlags::from_bits_truncate(flags_raw),
        })
    }

    pub fn entries(&self) -> MadtIter {
        MadtIter {
            data: self.header.data_address(),
            offset: 8,
            len: self.header.data_len(),
        }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MadtLocalApic {
    pub processor_id: u8,
    pub apic_id: u8,
    pub flags: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MadtIoApic {
    pub id: u8,
    reserved: u8,
    pub address: u32,
    pub gsi_base: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct MadtIntSrcOverride {
    pub bus_source: u8,
    pub irq_source: u8,
    pub gsi: u32,
    pub flags: u16,
}

pub enum MadtEntry {
    LocalApic(MadtLocalApic),
    IoApic(MadtIoApic),
    IntSrcOverride(MadtIntSrcOverride),
    /// Every other entry type (x2APIC, NMI source, local x2APIC NMI, ...)
    /// that §6 doesn't name. Carries its type and length so a caller can
    /// at least log what was skipped.
    Unknown { kind: u8, length: u8 },
}

pub struct MadtIter {
    data: usize,
    offset: usize,
    len: usize,
}

impl Iterator for MadtIter {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        if self.offset + 2 > self.len {
            return None;
        }

        let kind = unsafe { ptr::read((self.data + self.offset) as *const u8) };
        let length = unsafe { ptr::read((self.data + self.offset + 1) as *const u8) } as usize;

        if length < 2 || self.offset + length > self.len {
            return None;
        }

        let body = self.data + self.offset + 2;
        let entry = match kind {
            0 if length == mem::size_of::<MadtLocalApic>() + 2 => {
                MadtEntry::LocalApic(unsafe { ptr::read_unaligned(body as *const MadtLocalApic) })
            }
            1 if length == mem::size_of::<MadtIoApic>() + 2 => {
                MadtEntry::IoApic(unsafe { ptr::read_unaligned(body as *const MadtIoApic) })
            }
            2 if length == mem::size_of::<MadtIntSrcOverride>() + 2 => MadtEntry::IntSrcOverride(unsafe {
                ptr::read_unaligned(body as *const MadtIntSrcOverride)
            }),
            other => MadtEntry::Unknown {
                kind: other,
                length: length as u8,
            },
        };

        self.offset += length;
        Some(entry)
    }
}
