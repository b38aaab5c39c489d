//! Platform-wide constants shared by every crate in the virtual-memory,
//! interrupt/APIC, and notification cores.
//!
//! Kept deliberately small: a value belongs here only if more than one
//! component needs to agree on it.

#![no_std]

pub mod memory;
pub mod time;
pub mod interrupts;

/// The chosen interrupt frequency (in Hertz) of the legacy PIT clock, used only
/// to calibrate the LAPIC timer during boot (see `apic::LocalApic::init_timer`).
pub const CONFIG_PIT_FREQUENCY_HZ: u32 = 1000;

/// How long the LAPIC timer LVT is programmed to fire, once calibrated.
pub const CONFIG_TIMESLICE_PERIOD_MICROSECONDS: u32 = 10_000;
