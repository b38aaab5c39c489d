//! Local APIC: one per core, in either xAPIC (memory-mapped) or x2APIC
//! (MSR-based) form. Both forms answer to the same [`LocalApic`] interface,
//! which is the only thing callers outside this crate ever see.
//!
//! `eoi()` and the IPI senders are reentrant-safe and non-blocking, since
//! they are called from the interrupt-dispatch path (see the `interrupts`
//! crate): no allocation, no lock that could be held by the interrupted
//! context.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use bit_field::BitField;
use core::fmt;
use kernel_errors::{Error, Result};
use memory_structs::PhysicalAddress;
use spin::Once;
use sync::{IrqSafeMutex, IrqSafeRwLock, IrqSafeRwLockReadGuard, IrqSafeRwLockWriteGuard};
use x86_64::registers::model_specific::Msr;

const IA32_APIC_BASE: u32 = 0x1B;
const IA32_X2APIC_VERSION: u32 = 0x803;
const IA32_X2APIC_TPR: u32 = 0x808;
const IA32_X2APIC_EOI: u32 = 0x80B;
const IA32_X2APIC_SIVR: u32 = 0x80F;
const IA32_X2APIC_ISR0: u32 = 0x810;
const IA32_X2APIC_ESR: u32 = 0x828;
const IA32_X2APIC_ICR: u32 = 0x830;
const IA32_X2APIC_LVT_TIMER: u32 = 0x832;
const IA32_X2APIC_LVT_PMI: u32 = 0x834;
const IA32_X2APIC_LVT_LINT0: u32 = 0x835;
const IA32_X2APIC_LVT_LINT1: u32 = 0x836;
const IA32_X2APIC_INIT_COUNT: u32 = 0x838;
const IA32_X2APIC_CUR_COUNT: u32 = 0x839;
const IA32_X2APIC_DIV_CONF: u32 = 0x83E;

const APIC_BASE_MSR_IS_BSP: u64 = 1 << 8;
const APIC_BASE_MSR_XAPIC_ENABLE: u64 = 1 << 11;
const APIC_BASE_MSR_X2APIC_ENABLE: u64 = 1 << 10;

/// Recommended by the OSDev wiki: keep the spurious vector at the top of the
/// allocatable range so it never collides with a real device vector.
pub const DEFAULT_SPURIOUS_VECTOR: u8 = 0xFF;
const SW_ENABLE_BIT: u32 = 1 << 8;

// Byte offsets of the xAPIC's memory-mapped registers, per Intel SDM Vol.
// 3A Table 10-1. Every register occupies 16 bytes of address space but only
// the low 4 bytes are defined; the rest is reserved padding.
const REG_LAPIC_VERSION: usize = 0x30;
const REG_TASK_PRIORITY: usize = 0x80;
const REG_EOI: usize = 0xB0;
const REG_DESTINATION_FORMAT: usize = 0xE0;
const REG_SPURIOUS_INTERRUPT_VECTOR: usize = 0xF0;
const REG_IN_SERVICE: usize = 0x100;
const REG_ERROR_STATUS: usize = 0x280;
const REG_INTERRUPT_COMMAND_LOW: usize = 0x300;
const REG_INTERRUPT_COMMAND_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_LVT_PERF_MONITOR: usize = 0x340;
const REG_LVT_LINT0: usize = 0x350;
const REG_LVT_LINT1: usize = 0x360;
const REG_TIMER_INITIAL_COUNT: usize = 0x380;
const REG_TIMER_CURRENT_COUNT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3E0;

fn rdmsr(msr: u32) -> u64 {
    unsafe { Msr::new(msr).read() }
}

unsafe fn wrmsr(msr: u32, value: u64) {
    Msr::new(msr).write(value)
}

/// Which interrupt controller is active on this machine. Starts at `Pic`
/// and is advanced once during boot by whichever core first programs its
/// local APIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptChip {
    Pic,
    Apic,
    X2Apic,
}

static INTERRUPT_CHIP: IrqSafeMutex<InterruptChip> = IrqSafeMutex::new(InterruptChip::Pic);

pub fn interrupt_chip() -> InterruptChip {
    *INTERRUPT_CHIP.lock()
}

/// Returns `true` if CPUID reports x2APIC support. Cached after the first call.
pub fn has_x2apic() -> bool {
    static IS_X2APIC: Once<bool> = Once::new();
    *IS_X2APIC.call_once(|| {
        raw_cpuid::CpuId::new()
            .get_feature_info()
            .map(|f| f.has_x2apic())
            .unwrap_or(false)
    })
}

/// `true` if the currently executing core is the bootstrap processor.
pub fn is_bsp() -> bool {
    rdmsr(IA32_APIC_BASE) & APIC_BASE_MSR_IS_BSP != 0
}

const IA32_TSC_AUX: u32 = 0xC0000103;

/// Returns the APIC id of the currently executing core. Relies on
/// `LocalApic::init` having stashed it in `IA32_TSC_AUX`, the same MSR the
/// teacher's `apic` crate repurposes for this since there is no dedicated
/// "which core am I" register.
pub fn my_apic_id() -> u8 {
    rdmsr(IA32_TSC_AUX) as u8
}

/// Returns this core's own `LocalApic`, if `LocalApic::init` has run on it.
pub fn my_apic() -> Option<IrqSafeRwLockReadGuard<'static, LocalApic>> {
    let id = my_apic_id();
    let map = LOCAL_APICS.read();
    let entry = map.get(&id)?;
    let ptr: *const IrqSafeRwLock<LocalApic> = entry;
    drop(map);
    Some(unsafe { &*ptr }.read())
}

/// Same as [`my_apic`], but for callers that need to send an IPI or
/// otherwise mutate the register set.
pub fn my_apic_mut() -> Option<IrqSafeRwLockWriteGuard<'static, LocalApic>> {
    let id = my_apic_id();
    let map = LOCAL_APICS.read();
    let entry = map.get(&id)?;
    let ptr: *const IrqSafeRwLock<LocalApic> = entry;
    drop(map);
    Some(unsafe { &*ptr }.write())
}

static LOCAL_APICS: IrqSafeRwLock<BTreeMap<u8, IrqSafeRwLock<LocalApic>>> =
    IrqSafeRwLock::new(BTreeMap::new());
static BSP_APIC_ID: Once<u8> = Once::new();

pub fn bsp_apic_id() -> Option<u8> {
    BSP_APIC_ID.get().copied()
}

pub fn local_apics() -> IrqSafeRwLockReadGuard<'static, BTreeMap<u8, IrqSafeRwLock<LocalApic>>> {
    LOCAL_APICS.read()
}

fn local_apics_mut() -> IrqSafeRwLockWriteGuard<'static, BTreeMap<u8, IrqSafeRwLock<LocalApic>>> {
    LOCAL_APICS.write()
}

pub fn core_count() -> usize {
    LOCAL_APICS.read().len()
}

/// The delivery mode field of an IPI alert or an LVT/redirection-entry
/// low dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    Fixed = 0b000,
    Lowest = 0b001,
    Smi = 0b010,
    Nmi = 0b100,
    Init = 0b101,
    Sipi = 0b110,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Physical,
    Logical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// Which cores an IPI targets: either a single physical APIC id or one of
/// the ICR's destination shorthands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiDestination {
    Physical(u8),
    Shorthand(Shorthand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shorthand {
    SelfOnly,
    All,
    AllButSelf,
}

/// One IPI, ready to be packed into the low dword of the interrupt command
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpiAlert {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub destination_mode: DestinationMode,
    pub level_assert: bool,
    pub trigger_mode: TriggerMode,
}

impl IpiAlert {
    pub fn fixed(vector: u8) -> IpiAlert {
        IpiAlert {
            vector,
            delivery_mode: DeliveryMode::Fixed,
            destination_mode: DestinationMode::Physical,
            level_assert: true,
            trigger_mode: TriggerMode::Edge,
        }
    }

    fn low_dword(&self, destination: IpiDestination) -> u32 {
        let mut low: u32 = self.vector as u32;
        low.set_bits(8..11, self.delivery_mode as u32);
        if self.destination_mode == DestinationMode::Logical {
            low.set_bit(11, true);
        }
        if self.level_assert {
            low.set_bit(14, true);
        }
        if self.trigger_mode == TriggerMode::Level {
            low.set_bit(15, true);
        }
        let shorthand_bits: u32 = match destination {
            IpiDestination::Physical(_) => 0b00,
            IpiDestination::Shorthand(Shorthand::SelfOnly) => 0b01,
            IpiDestination::Shorthand(Shorthand::All) => 0b10,
            IpiDestination::Shorthand(Shorthand::AllButSelf) => 0b11,
        };
        low.set_bits(18..20, shorthand_bits);
        low
    }
}

/// An LVT entry configuration, shared by the timer LVT, the LINT pins, and
/// (via `ioapic`) the I/O APIC's redirection table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvtConfig {
    pub vector: u8,
    pub delivery_mode: DeliveryMode,
    pub polarity_low: bool,
    pub trigger_mode: TriggerMode,
    pub masked: bool,
}

impl IvtConfig {
    pub fn masked_entry() -> IvtConfig {
        IvtConfig {
            vector: 0,
            delivery_mode: DeliveryMode::Fixed,
            polarity_low: false,
            trigger_mode: TriggerMode::Edge,
            masked: true,
        }
    }

    pub fn as_lvt_bits(&self) -> u32 {
        let mut bits: u32 = self.vector as u32;
        bits.set_bits(8..11, self.delivery_mode as u32);
        if self.polarity_low {
            bits.set_bit(13, true);
        }
        if self.trigger_mode == TriggerMode::Level {
            bits.set_bit(15, true);
        }
        if self.masked {
            bits.set_bit(16, true);
        }
        bits
    }
}

/// Timer mode for the LVT timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    OneShot,
    Periodic,
}

/// The decoded error-status register (ESR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApicStatus {
    pub send_checksum_error: bool,
    pub receive_checksum_error: bool,
    pub send_accept_error: bool,
    pub receive_accept_error: bool,
    pub redirectable_ipi: bool,
    pub send_illegal_vector: bool,
    pub received_illegal_vector: bool,
    pub illegal_register_address: bool,
}

impl ApicStatus {
    fn from_esr(esr: u32) -> ApicStatus {
        ApicStatus {
            send_checksum_error: esr.get_bit(0),
            receive_checksum_error: esr.get_bit(1),
            send_accept_error: esr.get_bit(2),
            receive_accept_error: esr.get_bit(3),
            redirectable_ipi: esr.get_bit(4),
            send_illegal_vector: esr.get_bit(5),
            received_illegal_vector: esr.get_bit(6),
            illegal_register_address: esr.get_bit(7),
        }
    }
}

/// Lifecycle of one [`LocalApic`]; `eoi()` is only legal once `Enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LapicState {
    Disabled,
    Enabling,
    Enabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDivide {
    By1 = 0b1011,
    By2 = 0b0000,
    By4 = 0b0001,
    By8 = 0b0010,
    By16 = 0b0011,
    By32 = 0b1000,
    By64 = 0b1001,
    By128 = 0b1010,
}

enum LvtEntry {
    Timer,
    Lint0,
    Lint1,
}

fn lvt_disabled() -> u32 {
    1 << 16
}

/// One Local APIC, in either xAPIC or x2APIC form.
pub struct LocalApic {
    /// Base of the mapped xAPIC register page; `None` for x2APIC cores.
    regs: Option<*mut u8>,
    processor: u8,
    apic_id: u8,
    is_bsp: bool,
    x2: bool,
    state: LapicState,
}

// SAFETY: `regs` is an MMIO pointer exclusively owned by this `LocalApic`;
// every local APIC's register block is only ever touched by its own core.
unsafe impl Send for LocalApic {}
unsafe impl Sync for LocalApic {}

impl fmt::Debug for LocalApic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalApic")
            .field("processor", &self.processor)
            .field("apic_id", &self.apic_id)
            .field("is_bsp", &self.is_bsp)
            .field("x2", &self.x2)
            .field("state", &self.state)
            .finish()
    }
}

impl LocalApic {
    /// Creates and enables the local APIC for the core this is called on.
    /// Must be invoked by each core for itself (a core cannot initialize
    /// another core's APIC).
    pub fn init(processor: u8, apic_id: u8, is_bsp: bool) -> Result<()> {
        let x2 = has_x2apic();
        if is_bsp {
            BSP_APIC_ID.call_once(|| apic_id);
        }
        unsafe { wrmsr(IA32_TSC_AUX, apic_id as u64) };

        let mut lapic = LocalApic {
            regs: None,
            processor,
            apic_id,
            is_bsp,
            x2,
            state: LapicState::Disabled,
        };

        lapic.state = LapicState::Enabling;
        if x2 {
            lapic.enable_x2apic();
        } else {
            lapic.enable_xapic()?;
        }
        lapic.state = LapicState::Enabled;

        log::info!("apic: initialized {:?}", lapic);
        local_apics_mut().insert(apic_id, IrqSafeRwLock::new(lapic));
        Ok(())
    }

    fn enable_xapic(&mut self) -> Result<()> {
        let phys_width = page_table_entry::default_physical_address_width();
        let phys_base = (rdmsr(IA32_APIC_BASE) & 0xFFFF_F000) as usize;
        let phys = PhysicalAddress::new_canonical(phys_base, phys_width);

        let ptr = address_space::KERNEL_ADDRESS_SPACE
            .lock()
            .as_mut()
            .ok_or_else(|| Error::not_supported("apic: kernel address space not initialized"))?
            .map_mmio::<u8>(phys)?;
        self.regs = Some(ptr);

        unsafe {
            wrmsr(IA32_APIC_BASE, rdmsr(IA32_APIC_BASE) | APIC_BASE_MSR_XAPIC_ENABLE);
        }
        if self.is_bsp {
            *INTERRUPT_CHIP.lock() = InterruptChip::Apic;
        }

        unsafe {
            self.reg_write(REG_DESTINATION_FORMAT, 0xFFFF_FFFF);
            self.reg_write(REG_LVT_TIMER, lvt_disabled());
            self.reg_write(REG_LVT_PERF_MONITOR, DeliveryMode::Nmi as u32);
            self.reg_write(REG_LVT_LINT0, lvt_disabled());
            self.reg_write(REG_LVT_LINT1, lvt_disabled());
            self.reg_write(REG_TASK_PRIORITY, 0);
            self.reg_write(
                REG_SPURIOUS_INTERRUPT_VECTOR,
                DEFAULT_SPURIOUS_VECTOR as u32 | SW_ENABLE_BIT,
            );
        }
        Ok(())
    }

    fn enable_x2apic(&mut self) {
        unsafe {
            wrmsr(
                IA32_APIC_BASE,
                rdmsr(IA32_APIC_BASE) | APIC_BASE_MSR_XAPIC_ENABLE | APIC_BASE_MSR_X2APIC_ENABLE,
            );
        }
        if self.is_bsp {
            *INTERRUPT_CHIP.lock() = InterruptChip::X2Apic;
        }
        unsafe {
            wrmsr(IA32_X2APIC_LVT_TIMER, lvt_disabled() as u64);
            wrmsr(IA32_X2APIC_LVT_PMI, DeliveryMode::Nmi as u64);
            wrmsr(IA32_X2APIC_LVT_LINT0, lvt_disabled() as u64);
            wrmsr(IA32_X2APIC_LVT_LINT1, lvt_disabled() as u64);
            wrmsr(IA32_X2APIC_TPR, 0);
            wrmsr(IA32_X2APIC_SIVR, (DEFAULT_SPURIOUS_VECTOR as u64) | (SW_ENABLE_BIT as u64));
        }
    }

    /// Reads the 32-bit register at xAPIC byte offset `offset`. Only valid
    /// for xAPIC cores (`self.regs.is_some()`).
    unsafe fn reg_read(&self, offset: usize) -> u32 {
        let base = self.regs.expect("reg_read on an x2APIC core") as *const u32;
        core::ptr::read_volatile(base.add(offset / 4))
    }

    unsafe fn reg_write(&mut self, offset: usize, value: u32) {
        let base = self.regs.expect("reg_write on an x2APIC core") as *mut u32;
        core::ptr::write_volatile(base.add(offset / 4), value)
    }

    pub fn id(&self) -> u8 {
        self.apic_id
    }

    pub fn version(&self) -> u32 {
        if self.x2 {
            (rdmsr(IA32_X2APIC_VERSION) & 0xFFFF_FFFF) as u32
        } else {
            unsafe { self.reg_read(REG_LAPIC_VERSION) }
        }
    }

    /// Decodes the error-status register. Reading it first latches the
    /// current errors; callers that want a fresh read should `clear_error`
    /// first, then read again.
    pub fn status(&self) -> ApicStatus {
        let raw = if self.x2 {
            (rdmsr(IA32_X2APIC_ESR) & 0xFFFF_FFFF) as u32
        } else {
            unsafe { self.reg_read(REG_ERROR_STATUS) }
        };
        ApicStatus::from_esr(raw)
    }

    pub fn clear_error(&mut self) {
        if self.x2 {
            unsafe { wrmsr(IA32_X2APIC_ESR, 0) };
        }
        // xAPIC's error-status register is read-only; errors clear on the
        // next latching read instead.
    }

    fn set_icr(&mut self, value: u64) {
        const DELIVERY_STATUS: u32 = 1 << 12;
        if self.x2 {
            unsafe { wrmsr(IA32_X2APIC_ICR, value) };
        } else {
            unsafe {
                while self.reg_read(REG_INTERRUPT_COMMAND_LOW) & DELIVERY_STATUS != 0 {}
                self.reg_write(REG_INTERRUPT_COMMAND_HIGH, (value >> 32) as u32);
                self.reg_write(REG_INTERRUPT_COMMAND_LOW, value as u32);
                while self.reg_read(REG_INTERRUPT_COMMAND_LOW) & DELIVERY_STATUS != 0 {}
            }
        }
    }

    /// Sends `alert` to `destination`. Reentrant-safe: no allocation, the
    /// only spin is on the hardware delivery-status bit.
    pub fn send_ipi(&mut self, destination: IpiDestination, alert: IpiAlert) {
        let low = alert.low_dword(destination);
        let high: u32 = match destination {
            IpiDestination::Physical(apic_id) => {
                if self.x2 {
                    apic_id as u32
                } else {
                    (apic_id as u32) << 24
                }
            }
            IpiDestination::Shorthand(_) => 0,
        };
        self.set_icr(((high as u64) << 32) | low as u64);
    }

    /// Sends `vector` to this same core via the `Self` shorthand.
    pub fn self_ipi(&mut self, vector: u8) {
        self.send_ipi(IpiDestination::Shorthand(Shorthand::SelfOnly), IpiAlert::fixed(vector));
    }

    /// Programs the timer LVT entry with `ivt.vector` and `mode`.
    pub fn configure_timer(&mut self, ivt: IvtConfig, mode: TimerMode) {
        let mut bits = ivt.as_lvt_bits();
        if mode == TimerMode::Periodic {
            bits.set_bits(17..19, 0b01);
        }
        self.write_lvt(LvtEntry::Timer, bits);
    }

    pub fn configure_lint(&mut self, lint: u8, ivt: IvtConfig) -> Result<()> {
        match lint {
            0 => Ok(self.write_lvt(LvtEntry::Lint0, ivt.as_lvt_bits())),
            1 => Ok(self.write_lvt(LvtEntry::Lint1, ivt.as_lvt_bits())),
            _ => Err(Error::invalid_input("apic: lint must be 0 or 1")),
        }
    }

    fn write_lvt(&mut self, which: LvtEntry, bits: u32) {
        if self.x2 {
            let msr = match which {
                LvtEntry::Timer => IA32_X2APIC_LVT_TIMER,
                LvtEntry::Lint0 => IA32_X2APIC_LVT_LINT0,
                LvtEntry::Lint1 => IA32_X2APIC_LVT_LINT1,
            };
            unsafe { wrmsr(msr, bits as u64) };
        } else {
            let offset = match which {
                LvtEntry::Timer => REG_LVT_TIMER,
                LvtEntry::Lint0 => REG_LVT_LINT0,
                LvtEntry::Lint1 => REG_LVT_LINT1,
            };
            unsafe { self.reg_write(offset, bits) };
        }
    }

    pub fn set_timer_divisor(&mut self, divide_value: TimerDivide) {
        if self.x2 {
            unsafe { wrmsr(IA32_X2APIC_DIV_CONF, divide_value as u64) };
        } else {
            unsafe { self.reg_write(REG_TIMER_DIVIDE, divide_value as u32) };
        }
    }

    pub fn set_initial_count(&mut self, count: u32) {
        if self.x2 {
            unsafe { wrmsr(IA32_X2APIC_INIT_COUNT, count as u64) };
        } else {
            unsafe { self.reg_write(REG_TIMER_INITIAL_COUNT, count) };
        }
    }

    pub fn current_count(&self) -> u32 {
        if self.x2 {
            rdmsr(IA32_X2APIC_CUR_COUNT) as u32
        } else {
            unsafe { self.reg_read(REG_TIMER_CURRENT_COUNT) }
        }
    }

    pub fn enable_spurious_int(&mut self, vector: u8) {
        self.set_spurious_vector(vector);
    }

    pub fn set_spurious_vector(&mut self, vector: u8) {
        let value = vector as u32 | SW_ENABLE_BIT;
        if self.x2 {
            unsafe { wrmsr(IA32_X2APIC_SIVR, value as u64) };
        } else {
            unsafe { self.reg_write(REG_SPURIOUS_INTERRUPT_VECTOR, value) };
        }
    }

    /// Signals end-of-interrupt. Must only be called from `Enabled` state;
    /// legal to call from within the ISR it acknowledges.
    pub fn eoi(&mut self) {
        if self.state != LapicState::Enabled {
            kernel_errors::bugcheck("apic: eoi() called before the local APIC finished enabling");
        }
        if self.x2 {
            unsafe { wrmsr(IA32_X2APIC_EOI, 0) };
        } else {
            unsafe { self.reg_write(REG_EOI, 0) };
        }
    }

    /// Returns the 8 in-service-register dwords: which interrupt lines are
    /// currently being serviced by this core.
    pub fn in_service(&self) -> [u32; 8] {
        if self.x2 {
            core::array::from_fn(|i| rdmsr(IA32_X2APIC_ISR0 + i as u32 * 0x10) as u32)
        } else {
            core::array::from_fn(|i| unsafe { self.reg_read(REG_IN_SERVICE + i * 0x10) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipi_low_dword_packs_vector_and_mode() {
        let alert = IpiAlert::fixed(0x40);
        let low = alert.low_dword(IpiDestination::Shorthand(Shorthand::AllButSelf));
        assert_eq!(low.get_bits(0..8), 0x40);
        assert_eq!(low.get_bits(8..11), DeliveryMode::Fixed as u32);
        assert_eq!(low.get_bits(18..20), 0b11);
    }

    #[test]
    fn ivt_masked_entry_sets_mask_bit() {
        let ivt = IvtConfig::masked_entry();
        assert!(ivt.as_lvt_bits() & (1 << 16) != 0);
    }

    #[test]
    fn apic_status_decodes_each_bit_independently() {
        let status = ApicStatus::from_esr(0b0000_0101);
        assert!(status.send_checksum_error);
        assert!(!status.receive_checksum_error);
        assert!(status.send_accept_error);
    }

    #[test]
    fn timer_lvt_periodic_bit_set() {
        let ivt = IvtConfig { vector: 0x22, delivery_mode: DeliveryMode::Fixed, polarity_low: false, trigger_mode: TriggerMode::Edge, masked: false };
        let mut bits = ivt.as_lvt_bits();
        bits.set_bits(17..19, 0b01);
        assert_eq!(bits.get_bits(17..19), 0b01);
        assert_eq!(bits.get_bits(0..8), 0x22);
    }
}
