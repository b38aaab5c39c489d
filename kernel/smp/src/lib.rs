//! Brings up application processors (APs) from the bootstrap processor (BSP).
//!
//! The BSP-side sequencing lives here; the AP-side entry point (what runs
//! once a core actually starts executing Rust, analogous to the teacher's
//! `ap_start::kstart_ap`) is out of this crate's scope, since it depends on
//! per-CPU GDT/TSS/stack machinery this workspace doesn't carry. What this
//! crate owns is: copying a trampoline image into low memory, driving the
//! INIT/SIPI handshake against one target core, tracking each core's
//! liveness, and the barrier the BSP waits on before dispatching work.
//!
//! The teacher's own `multicore_bringup` crate covers the same ground (its
//! `Cargo.toml` depends on `apic`, `ap_start`, `pit_clock_basic`, `mod_mgmt`,
//! `acpi`, `madt`, `pause`), but its source was not available to ground on
//! directly — only the shape of its dependency list. The INIT/SIPI sequence
//! and retry/timeout numbers below instead follow the Intel MP
//! specification's standard bring-up protocol and `kernel_config::time`'s
//! constants.

#![no_std]

extern crate alloc;

use alloc::collections::BTreeMap;
use apic::{DeliveryMode, IpiAlert, IpiDestination};
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use kernel_config::memory::{PAGE_SIZE, PHYSICAL_MEMORY_OFFSET};
use kernel_config::time::{SMP_AP_LIVENESS_TIMEOUT_MS, SMP_INIT_IPI_WAIT_MS, SMP_SIPI_WAIT_US};
use kernel_errors::{Error, Result};
use memory_structs::PhysicalAddress;
use sync::IrqSafeRwLock;

mod delay {
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Conservative fallback for CPUs (mostly older hypervisors) whose
    /// CPUID doesn't report leaf 0x15, so `calibrate` has something to
    /// store other than zero. Deliberately low: a delay computed against
    /// too-slow a clock runs longer than intended, never shorter.
    const FALLBACK_TSC_HZ: u64 = 1_000_000_000;

    static TSC_HZ: AtomicU64 = AtomicU64::new(0);

    /// Reads the TSC frequency out of CPUID leaf 0x15/0x16 and caches it.
    /// Idempotent; safe to call from every core that might need to delay.
    pub fn calibrate() {
        if TSC_HZ.load(Ordering::Relaxed) != 0 {
            return;
        }
        let hz = raw_cpuid::CpuId::new()
            .get_tsc_info()
            .and_then(|info| info.tsc_frequency())
            .unwrap_or(FALLBACK_TSC_HZ);
        TSC_HZ.store(hz, Ordering::Relaxed);
    }

    fn hz() -> u64 {
        match TSC_HZ.load(Ordering::Relaxed) {
            0 => FALLBACK_TSC_HZ,
            hz => hz,
        }
    }

    #[inline]
    fn rdtsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    /// Busy-waits for at least `micros` microseconds.
    pub fn spin_micros(micros: u64) {
        let ticks = hz() / 1_000_000 * micros;
        let start = rdtsc();
        while rdtsc().wrapping_sub(start) < ticks {
            core::hint::spin_loop();
        }
    }
}

/// Identifies one application processor by the two ids the MADT and the
/// local APIC each use for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApDescriptor {
    pub processor_id: u8,
    pub apic_id: u8,
}

/// 1 MiB: the highest address a core executing in 16-bit real mode can
/// address with a single segment, which is where bring-up starts.
const REAL_MODE_LIMIT: usize = 0x10_0000;

/// Copies `image` into the identity-mapped low-memory frame at `target`,
/// via the kernel's direct physical-memory map, and returns the SIPI
/// vector that points at it (a SIPI vector is the target frame number,
/// since the AP begins executing at `vector << 12` in real mode).
///
/// `image` is supplied by the caller (the boot-orchestration crate) rather
/// than assembled here; the actual 16-bit real-mode-to-long-mode trampoline
/// is hand-written assembly that lives alongside the rest of the boot
/// sequence, not in this crate.
pub fn install_trampoline(target: PhysicalAddress, image: &[u8]) -> Result<u8> {
    if target.value() % PAGE_SIZE != 0 {
        return Err(Error::invalid_input("smp: trampoline target frame must be page-aligned"));
    }
    if image.len() > PAGE_SIZE {
        return Err(Error::invalid_input("smp: trampoline image must fit in one page"));
    }
    if target.value() + image.len() > REAL_MODE_LIMIT {
        return Err(Error::invalid_input("smp: trampoline target must stay below 1 MiB"));
    }
    let dst = (PHYSICAL_MEMORY_OFFSET + target.value()) as *mut u8;
    unsafe { core::ptr::copy_nonoverlapping(image.as_ptr(), dst, image.len()) };
    Ok((target.value() >> 12) as u8)
}

/// Where one AP stands in the bring-up sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApStatus {
    /// Never targeted by `bring_up_ap`.
    Pending,
    /// INIT/SIPI sent; waiting on the liveness signal.
    Started,
    /// Signaled liveness via [`signal_liveness`].
    Live,
    /// Did not signal liveness within the retry window; excluded.
    Failed,
}

impl ApStatus {
    fn from_u8(v: u8) -> ApStatus {
        match v {
            1 => ApStatus::Started,
            2 => ApStatus::Live,
            3 => ApStatus::Failed,
            _ => ApStatus::Pending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ApStatus::Pending => 0,
            ApStatus::Started => 1,
            ApStatus::Live => 2,
            ApStatus::Failed => 3,
        }
    }
}

static AP_STATUS: IrqSafeRwLock<BTreeMap<u8, AtomicU8>> = IrqSafeRwLock::new(BTreeMap::new());

fn set_status(apic_id: u8, status: ApStatus) {
    if let Some(cell) = AP_STATUS.read().get(&apic_id) {
        cell.store(status.as_u8(), Ordering::SeqCst);
        return;
    }
    AP_STATUS
        .write()
        .entry(apic_id)
        .or_insert_with(|| AtomicU8::new(status.as_u8()))
        .store(status.as_u8(), Ordering::SeqCst);
}

/// Returns the current bring-up status of `apic_id`, or `Pending` if it has
/// never been targeted.
pub fn status_of(apic_id: u8) -> ApStatus {
    AP_STATUS
        .read()
        .get(&apic_id)
        .map(|cell| ApStatus::from_u8(cell.load(Ordering::SeqCst)))
        .unwrap_or(ApStatus::Pending)
}

/// Called by the AP's own early boot code once it has run far enough to
/// prove it's alive — the per-core equivalent of the teacher's shared
/// `AP_READY_FLAG` that `kstart_ap` sets as soon as it enters Rust.
pub fn signal_liveness(apic_id: u8) {
    set_status(apic_id, ApStatus::Live);
    READY_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Outcome of one bring-up attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpOutcome {
    Live,
    Excluded,
}

/// How many times to poll for liveness, spaced `SMP_SIPI_WAIT_US` apart,
/// after the retry SIPI and before giving up at the timeout.
fn poll_count() -> u64 {
    let timeout_us = SMP_AP_LIVENESS_TIMEOUT_MS.saturating_mul(1000);
    (timeout_us / SMP_SIPI_WAIT_US).max(1)
}

/// Runs the INIT/SIPI bring-up sequence against `ap`: INIT IPI, a 10 ms
/// wait, a startup IPI at `trampoline_vector`, a 200 us wait, one resend of
/// the SIPI if liveness hasn't appeared yet, then polling at the same
/// cadence up to the overall liveness timeout. An AP that never signals
/// liveness is logged and marked `Failed`; the caller is expected to
/// proceed with the remaining cores rather than treat this as fatal.
pub fn bring_up_ap(ap: ApDescriptor, trampoline_vector: u8) -> Result<BringUpOutcome> {
    delay::calibrate();
    set_status(ap.apic_id, ApStatus::Started);

    let mut bsp = apic::my_apic_mut()
        .ok_or_else(|| Error::not_supported("smp: no local apic initialized on this core"))?;

    let init = IpiAlert { delivery_mode: DeliveryMode::Init, ..IpiAlert::fixed(0) };
    bsp.send_ipi(IpiDestination::Physical(ap.apic_id), init);
    delay::spin_micros(SMP_INIT_IPI_WAIT_MS.saturating_mul(1000));

    let sipi = IpiAlert::fixed(trampoline_vector);
    let startup = IpiAlert { delivery_mode: DeliveryMode::Sipi, ..sipi };
    bsp.send_ipi(IpiDestination::Physical(ap.apic_id), startup);
    delay::spin_micros(SMP_SIPI_WAIT_US);

    if status_of(ap.apic_id) != ApStatus::Live {
        bsp.send_ipi(IpiDestination::Physical(ap.apic_id), startup);
        for _ in 0..poll_count() {
            delay::spin_micros(SMP_SIPI_WAIT_US);
            if status_of(ap.apic_id) == ApStatus::Live {
                break;
            }
        }
    }

    if status_of(ap.apic_id) == ApStatus::Live {
        log::info!("smp: AP {} (apic id {}) is live", ap.processor_id, ap.apic_id);
        Ok(BringUpOutcome::Live)
    } else {
        log::error!(
            "smp: AP {} (apic id {}) did not signal liveness within {} ms, excluding it",
            ap.processor_id,
            ap.apic_id,
            SMP_AP_LIVENESS_TIMEOUT_MS,
        );
        set_status(ap.apic_id, ApStatus::Failed);
        Ok(BringUpOutcome::Excluded)
    }
}

static READY_COUNT: AtomicUsize = AtomicUsize::new(0);

/// How many cores have signaled liveness so far, BSP included (the BSP
/// counts itself in via [`mark_bsp_ready`]).
pub fn ready_count() -> usize {
    READY_COUNT.load(Ordering::SeqCst)
}

/// The BSP calls this once it has finished its own bring-up-adjacent init,
/// so that it's counted alongside every AP that calls `signal_liveness`.
pub fn mark_bsp_ready() {
    READY_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Spins until `ready_count() >= expected`, i.e. every core the caller
/// brought up (successfully or not — a `Failed` AP is excluded from
/// `expected` by the caller, per the failure semantics above) has reached
/// the point of calling `signal_liveness`/`mark_bsp_ready`. This is the
/// "shared atomic flag" the BSP awaits before dispatching work so that all
/// cores reach the scheduler together.
pub fn await_all_ready(expected: usize) {
    while ready_count() < expected {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset() {
        AP_STATUS.write().clear();
        READY_COUNT.store(0, Ordering::SeqCst);
    }

    #[test]
    fn status_of_unknown_apic_id_is_pending() {
        reset();
        assert_eq!(status_of(7), ApStatus::Pending);
    }

    #[test]
    fn signal_liveness_marks_live_and_advances_ready_count() {
        reset();
        set_status(3, ApStatus::Started);
        assert_eq!(status_of(3), ApStatus::Started);
        signal_liveness(3);
        assert_eq!(status_of(3), ApStatus::Live);
        assert_eq!(ready_count(), 1);
    }

    #[test]
    fn mark_bsp_ready_and_signal_liveness_both_advance_the_same_counter() {
        reset();
        mark_bsp_ready();
        signal_liveness(1);
        signal_liveness(2);
        assert_eq!(ready_count(), 3);
    }

    #[test]
    fn install_trampoline_rejects_unaligned_target() {
        let target = PhysicalAddress::new_canonical(0x1001, 40);
        assert!(install_trampoline(target, &[0u8; 16]).is_err());
    }

    #[test]
    fn install_trampoline_rejects_targets_above_one_megabyte() {
        let target = PhysicalAddress::new_canonical(0x10_0000, 40);
        assert!(install_trampoline(target, &[0u8; 16]).is_err());
    }

    #[test]
    fn install_trampoline_rejects_oversized_image() {
        let target = PhysicalAddress::new_canonical(0x8000, 40);
        let oversized = alloc::vec![0u8; PAGE_SIZE + 1];
        assert!(install_trampoline(target, &oversized).is_err());
    }

    #[test]
    fn poll_count_is_at_least_one() {
        assert!(poll_count() >= 1);
    }
}
