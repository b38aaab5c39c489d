//! The Fixed ACPI Description Table. Only `century`, `iapc_boot_arch`, and
//! `dsdt` are consumed, but every field ahead of them is modeled so the
//! struct's offsets line up with the real on-disk layout — the checksum
//! still covers the whole table via the header's `length`, independent of
//! how far this struct's fields go.

use core::ptr;

use kernel_errors::{Error, Result};

use crate::sdt::SdtHeader;

bitflags! {
    pub struct IapcBootArch: u16 {
        const LEGACY_DEVICES = 1 << 0;
        const I8042 = 1 << 1;
        const NO_VGA = 1 << 2;
        const NO_MSI = 1 << 3;
        const NO_ASPM = 1 << 4;
    }
}

#[repr(C, packed)]
struct FadtFields {
    firmware_ctrl: u32,
    dsdt: u32,
    reserved0: u8,
    preferred_pm_profile: u8,
    sci_int: u16,
    smi_cmd: u32,
    acpi_enable: u8,
    acpi_disable: u8,
    s4bios_req: u8,
    pstate_cnt: u8,
    pm1a_evt_blk: u32,
    pm1b_evt_blk: u32,
    pm1a_cnt_blk: u32,
    pm1b_cnt_blk: u32,
    pm2_cnt_blk: u32,
    pm_tmr_blk: u32,
    gpe0_blk: u32,
    gpe1_blk: u32,
    pm1_evt_len: u8,
    pm1_cnt_len: u8,
    pm2_cnt_len: u8,
    pm_tmr_len: u8,
    gpe0_blk_len: u8,
    gpe1_blk_len: u8,
    gpe1_base: u8,
    cst_cnt: u8,
    p_lvl2_lat: u16,
    p_lvl3_lat: u16,
    flush_size: u16,
    flush_stride: u16,
    duty_offset: u8,
    duty_width: u8,
    day_alrm: u8,
    mon_alrm: u8,
    century: u8,
    iapc_boot_arch: u16,
    reserved1: u8,
    flags: u32,
}

pub struct Fadt {
    pub century: u8,
    pub iapc_boot_arch: IapcBootArch,
    pub dsdt: u32,
}

impl Fadt {
    pub(crate) fn from_header(header: &'static SdtHeader) -> Result<Fadt> {
        if header.data_len() < core::mem::size_of::<FadtFields>() {
            return Err(Error::invalid_data("acpi_tables: FADT shorter than its fixed fields"));
        }
        let fields = unsafe { ptr::read_unaligned(header.data_address() as *const FadtFields) };
        Ok(Fadt {
            century: fields.century,
            iapc_boot_arch: IapcBootArch::from_bits_truncate(fields.iapc_boot_arch),
            dsdt: fields.dsdt,
        })
    }

    pub fn has_8042(&self) -> bool {
        self.iapc_boot_arch.contains(IapcBootArch::I8042)
    }
}
