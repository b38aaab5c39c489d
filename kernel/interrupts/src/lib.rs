//! ISR dispatch: one shared (process-wide) table for exceptions and global
//! NMI/MCE, one per-CPU table for everything else. Vectors 32-239 are the
//! allocatable pool; the rest are reserved by the CPU or by `apic`'s
//! spurious vector.
//!
//! The hardware vector itself is handled by a single assembly trampoline
//! (not part of this crate — it lives alongside the boot/GDT/TSS setup)
//! that saves the full register file into an [`IsrContext`], switches GS
//! base on a ring3->ring0 transition, and calls [`dispatch`]. This crate
//! owns the table the trampoline calls into, not the trampoline itself.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use kernel_config::interrupts::{
    FIRST_ALLOCATABLE_VECTOR, IST_INDEX_NMI_MCE, IST_INDEX_TIMER, IST_INDEX_TRAP,
    LAST_ALLOCATABLE_VECTOR,
};
use kernel_errors::{Error, Result};
use sync::{IrqSafeMutex, IrqSafeRwLock};

/// The full machine state a trampoline saves on entry and restores before
/// `iret`. Field order matches what the trampoline pushes, highest address
/// (pushed first) last.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct IsrContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A callback installed at one ISR slot. Declared reentrant: must not
/// block or allocate, and must call `apic`'s `eoi()` itself before
/// returning when the interrupt requires acknowledgement.
pub type IsrCallback = fn(&mut IsrContext) -> IsrContext;

/// Wraps a bare function pointer so that only something with no captured
/// heap state can be installed as a handler — a closure that captures by
/// move cannot coerce to `fn(...)`, so this type cannot be constructed
/// from one. Matches the non-blocking/non-allocating contract every ISR
/// slot carries.
#[derive(Clone, Copy)]
pub struct ReentrantHandler(IsrCallback);

impl ReentrantHandler {
    pub const fn new(f: IsrCallback) -> ReentrantHandler {
        ReentrantHandler(f)
    }

    fn call(&self, ctx: &mut IsrContext) -> IsrContext {
        (self.0)(ctx)
    }
}

impl PartialEq for ReentrantHandler {
    fn eq(&self, other: &Self) -> bool {
        self.0 as usize == other.0 as usize
    }
}

/// Which interrupt-stack-table slot a handler's stack runs on. Trap
/// handlers and the scheduler timer get dedicated stacks so an
/// asynchronous NMI/MCE can't corrupt whichever stack a fault is already
/// using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IstSlot {
    Trap,
    Timer,
    NmiOrMce,
    None,
}

impl IstSlot {
    fn index(self) -> Option<u8> {
        match self {
            IstSlot::Trap => Some(IST_INDEX_TRAP),
            IstSlot::Timer => Some(IST_INDEX_TIMER),
            IstSlot::NmiOrMce => Some(IST_INDEX_NMI_MCE),
            IstSlot::None => None,
        }
    }
}

struct Slot {
    handler: ReentrantHandler,
    ist: IstSlot,
}

/// A handle to an installed ISR slot. Opaque outside this crate except for
/// `index()`, which recovers the hardware vector.
#[derive(Clone, Copy)]
pub struct Entry {
    vector: u8,
    table: TableId,
}

impl Entry {
    pub fn index(&self) -> u8 {
        self.vector
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum TableId {
    Shared,
    PerCpu(u8),
}

struct IsrTable {
    slots: BTreeMap<u8, Slot>,
}

impl IsrTable {
    const fn new() -> IsrTable {
        IsrTable { slots: BTreeMap::new() }
    }

    fn allocate(&mut self, handler: ReentrantHandler, ist: IstSlot) -> Option<u8> {
        for vector in FIRST_ALLOCATABLE_VECTOR..=LAST_ALLOCATABLE_VECTOR {
            if !self.slots.contains_key(&vector) {
                self.slots.insert(vector, Slot { handler, ist });
                return Some(vector);
            }
        }
        None
    }

    fn install(&mut self, vector: u8, handler: ReentrantHandler, ist: IstSlot) -> Option<ReentrantHandler> {
        self.slots
            .insert(vector, Slot { handler, ist })
            .map(|previous| previous.handler)
    }

    fn release(&mut self, vector: u8, expected: ReentrantHandler) -> bool {
        match self.slots.get(&vector) {
            Some(slot) if slot.handler == expected => {
                self.slots.remove(&vector);
                true
            }
            // Idempotent: a vector that's already gone, or that now holds a
            // different handler (a racing re-install), is not an error.
            _ => false,
        }
    }
}

static SHARED_TABLE: IrqSafeRwLock<IsrTable> = IrqSafeRwLock::new(IsrTable::new());
static PER_CPU_TABLES: IrqSafeRwLock<BTreeMap<u8, IrqSafeMutex<IsrTable>>> =
    IrqSafeRwLock::new(BTreeMap::new());

/// Registers the calling core's per-CPU table. Must be called once per
/// core during that core's bring-up, before `allocate`/`install` target it.
pub fn init_per_cpu_table(apic_id: u8) {
    PER_CPU_TABLES.write().entry(apic_id).or_insert_with(|| IrqSafeMutex::new(IsrTable::new()));
}

fn with_per_cpu<R>(apic_id: u8, f: impl FnOnce(&mut IsrTable) -> R) -> Result<R> {
    let tables = PER_CPU_TABLES.read();
    let table = tables
        .get(&apic_id)
        .ok_or_else(|| Error::not_found("interrupts: per-CPU table not initialized for this core"))?;
    Ok(f(&mut table.lock()))
}

/// Finds a free vector in the current core's per-CPU table and installs
/// `handler` there.
pub fn allocate(handler: ReentrantHandler, ist: IstSlot) -> Result<Entry> {
    let apic_id = apic::my_apic_id();
    let vector = with_per_cpu(apic_id, |table| table.allocate(handler, ist))?
        .ok_or_else(|| Error::out_of_vectors("interrupts: no free vector in the per-CPU allocatable pool"))?;
    Ok(Entry { vector, table: TableId::PerCpu(apic_id) })
}

/// Finds a free vector in the shared, process-wide table.
pub fn allocate_shared(handler: ReentrantHandler, ist: IstSlot) -> Result<Entry> {
    let vector = SHARED_TABLE
        .write()
        .allocate(handler, ist)
        .ok_or_else(|| Error::out_of_vectors("interrupts: no free vector in the shared allocatable pool"))?;
    Ok(Entry { vector, table: TableId::Shared })
}

/// Installs `handler` directly at `vector`, returning whatever handler was
/// there before (if any). Used for exceptions and other fixed vectors that
/// don't go through `allocate`.
pub fn install(vector: u8, handler: ReentrantHandler, ist: IstSlot) -> Result<Option<ReentrantHandler>> {
    Ok(SHARED_TABLE.write().install(vector, handler, ist))
}

pub fn install_per_cpu(apic_id: u8, vector: u8, handler: ReentrantHandler, ist: IstSlot) -> Result<Option<ReentrantHandler>> {
    with_per_cpu(apic_id, |table| table.install(vector, handler, ist))
}

/// Releases `entry`, but only if its currently-installed handler still
/// matches `expected` — guards against releasing a slot a racing caller
/// has already reused (ABA).
pub fn release(entry: Entry, expected: ReentrantHandler) -> Result<()> {
    let released = match entry.table {
        TableId::Shared => SHARED_TABLE.write().release(entry.vector, expected),
        TableId::PerCpu(apic_id) => with_per_cpu(apic_id, |table| table.release(entry.vector, expected))?,
    };
    let _ = released; // idempotent either way, per the spec's release contract
    Ok(())
}

/// Called by the trampoline with the saved register state. Looks up
/// `ctx.vector` first in the calling core's per-CPU table, then in the
/// shared table, and invokes whichever slot matches. Non-blocking,
/// non-allocating past the table lookup itself.
pub fn dispatch(ctx: &mut IsrContext) -> IsrContext {
    let vector = ctx.vector as u8;
    let apic_id = apic::my_apic_id();

    if let Some(tables) = PER_CPU_TABLES.try_read() {
        if let Some(table) = tables.get(&apic_id) {
            if let Some(table) = table.try_lock() {
                if let Some(slot) = table.slots.get(&vector) {
                    return slot.handler.call(ctx);
                }
            }
        }
    }
    if let Some(table) = SHARED_TABLE.try_read() {
        if let Some(slot) = table.slots.get(&vector) {
            return slot.handler.call(ctx);
        }
    }
    kernel_errors::bugcheck("interrupts: no handler installed for vector");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(ctx: &mut IsrContext) -> IsrContext {
        *ctx
    }

    #[test]
    fn allocate_finds_vectors_within_allocatable_range() {
        let mut table = IsrTable::new();
        let v = table.allocate(ReentrantHandler::new(noop), IstSlot::None).unwrap();
        assert!((FIRST_ALLOCATABLE_VECTOR..=LAST_ALLOCATABLE_VECTOR).contains(&v));
    }

    #[test]
    fn allocate_exhaustion_returns_none() {
        let mut table = IsrTable::new();
        let handler = ReentrantHandler::new(noop);
        let count = (LAST_ALLOCATABLE_VECTOR - FIRST_ALLOCATABLE_VECTOR + 1) as usize;
        for _ in 0..count {
            assert!(table.allocate(handler, IstSlot::None).is_some());
        }
        assert!(table.allocate(handler, IstSlot::None).is_none());
    }

    #[test]
    fn release_requires_matching_handler() {
        fn other(ctx: &mut IsrContext) -> IsrContext {
            *ctx
        }
        let mut table = IsrTable::new();
        let handler = ReentrantHandler::new(noop);
        let vector = table.allocate(handler, IstSlot::None).unwrap();
        assert!(!table.release(vector, ReentrantHandler::new(other)));
        assert!(table.release(vector, handler));
        assert!(table.slots.get(&vector).is_none());
    }

    #[test]
    fn release_is_idempotent_on_an_already_released_vector() {
        let mut table = IsrTable::new();
        let handler = ReentrantHandler::new(noop);
        assert!(!table.release(FIRST_ALLOCATABLE_VECTOR, handler));
    }

    #[test]
    fn install_returns_the_previous_handler() {
        fn other(ctx: &mut IsrContext) -> IsrContext {
            *ctx
        }
        let mut table = IsrTable::new();
        let first = ReentrantHandler::new(noop);
        let second = ReentrantHandler::new(other);
        assert!(table.install(32, first, IstSlot::None).is_none());
        let previous = table.install(32, second, IstSlot::None);
        assert!(previous.is_some());
    }
}
