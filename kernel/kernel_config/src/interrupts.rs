//! Constants that govern the ISR dispatch table and interrupt-stack-table layout.

/// Vectors 0-31 are reserved by the CPU for exceptions; the allocatable pool
/// for device/MSI interrupts starts here.
pub const FIRST_ALLOCATABLE_VECTOR: u8 = 32;
/// The last allocatable vector; 255 is conventionally reserved as the APIC
/// spurious-interrupt vector.
pub const LAST_ALLOCATABLE_VECTOR: u8 = 239;

/// IST index used by trap handlers (e.g. double fault, page fault re-entry).
pub const IST_INDEX_TRAP: u8 = 1;
/// IST index used by the scheduler's timer interrupt.
pub const IST_INDEX_TIMER: u8 = 2;
/// IST index used by NMI and machine-check handlers.
pub const IST_INDEX_NMI_MCE: u8 = 3;

/// Number of IST stacks a per-CPU TSS reserves.
pub const IST_STACK_COUNT: usize = 3;
