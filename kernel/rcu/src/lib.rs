//! Joint strong/weak reference counting (a single atomic word carries both
//! counts so they move together) plus an epoch-based quiescence domain that
//! defers the actual drop of a reclaimed value until every reader pinned
//! before the release has unpinned.
//!
//! The counter packing is deliberately exact: high 32 bits strong, low 32
//! bits weak, bit 63 a strong-is-zero sticky bit, bit 31 a weak-is-zero
//! sticky bit. Once a sticky bit is set it never clears — retain calls
//! against an already-zeroed count fail instead of resurrecting it.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use sync::IrqSafeMutex;

const STRONG_ZERO_STICKY: u64 = 1 << 63;
const WEAK_ZERO_STICKY: u64 = 1 << 31;
const STRONG_MASK: u64 = 0xFFFF_FFFF_0000_0000;
const WEAK_MASK: u64 = 0x0000_0000_FFFF_FFFF;
const STRONG_ONE: u64 = 1 << 32;
const WEAK_ONE: u64 = 1;

/// Which count(s) a release operation brought to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Release {
    pub strong_reached_zero: bool,
    pub weak_reached_zero: bool,
}

/// The joint strong/weak counter. `strongRetain`/`strongRelease` move both
/// counts together (every strong reference is also counted as a weak one);
/// `weakRetain`/`weakRelease` move only the weak count.
pub struct JointCount(AtomicU64);

impl JointCount {
    pub const fn new(strong: u32, weak: u32) -> JointCount {
        JointCount(AtomicU64::new(((strong as u64) << 32) | weak as u64))
    }

    /// Increments the weak count. Fails, leaving the count unchanged in
    /// effect (the caller must undo), iff the weak-zero-sticky bit is set.
    pub fn weak_retain(&self) -> bool {
        (self.0.fetch_add(WEAK_ONE, Ordering::AcqRel) & WEAK_ZERO_STICKY) == 0
    }

    /// Decrements the weak count. Returns `true` iff this call brought it
    /// to zero, in which case the weak-zero-sticky bit is now set.
    pub fn weak_release(&self) -> bool {
        let count = self.0.fetch_sub(WEAK_ONE, Ordering::AcqRel);
        if (count & WEAK_MASK) != WEAK_ONE {
            return false;
        }
        let expected = count & !WEAK_MASK;
        self.0
            .compare_exchange(expected, expected | WEAK_ZERO_STICKY, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Increments both counts. Fails iff the strong-zero-sticky bit is set;
    /// on success also increments the weak count via [`weak_retain`].
    pub fn strong_retain(&self) -> bool {
        if (self.0.fetch_add(STRONG_ONE, Ordering::AcqRel) & STRONG_ZERO_STICKY) == 0 {
            self.weak_retain();
            true
        } else {
            false
        }
    }

    /// Decrements both counts. A CAS loop sets whichever sticky bit(s) a
    /// count newly reaching zero requires; the loop re-derives which counts
    /// are zero from each failed attempt's actual value, since a concurrent
    /// release on the other count can race it.
    pub fn strong_release(&self) -> Release {
        let count = self.0.fetch_sub(STRONG_ONE | WEAK_ONE, Ordering::AcqRel);
        let mut weak_cleared = (count & WEAK_MASK) == WEAK_ONE;
        let mut strong_cleared = (count & STRONG_MASK) == STRONG_ONE;
        if !weak_cleared && !strong_cleared {
            return Release::default();
        }

        let mut expected = count;
        let mut value = expected;
        if weak_cleared {
            expected = (expected & !WEAK_MASK) | WEAK_ZERO_STICKY;
            value |= WEAK_ZERO_STICKY;
        }
        if strong_cleared {
            expected = (expected & !STRONG_MASK) | STRONG_ZERO_STICKY;
            value |= STRONG_ZERO_STICKY;
        }

        while let Err(actual) = self.0.compare_exchange_weak(expected, value, Ordering::AcqRel, Ordering::Relaxed) {
            weak_cleared = (actual & WEAK_MASK) == 0;
            strong_cleared = (actual & STRONG_MASK) == 0;
            expected = actual;
            value = expected;
            if weak_cleared {
                expected &= !WEAK_MASK;
                value |= WEAK_ZERO_STICKY;
            }
            if strong_cleared {
                expected &= !STRONG_MASK;
                value |= STRONG_ZERO_STICKY;
            }
        }

        Release { strong_reached_zero: strong_cleared, weak_reached_zero: weak_cleared }
    }
}

/// Apic ids are `u8`, so 256 is every core this kernel can ever bring up.
const MAX_CORES: usize = 256;
const UNPINNED: u64 = u64::MAX;

/// An epoch-based quiescence domain. Readers pin the domain's current epoch
/// for the duration of their access; writers defer reclamation closures
/// against the epoch active when they released, and those closures only run
/// once [`Domain::try_advance`] observes no pinned reader is still behind
/// that epoch.
pub struct Domain {
    epoch: AtomicU64,
    pinned: [AtomicU64; MAX_CORES],
    deferred: IrqSafeMutex<BTreeMap<u64, Vec<Box<dyn FnOnce() + Send>>>>,
}

impl Domain {
    pub fn new() -> Domain {
        Domain {
            epoch: AtomicU64::new(0),
            pinned: core::array::from_fn(|_| AtomicU64::new(UNPINNED)),
            deferred: IrqSafeMutex::new(BTreeMap::new()),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Pins `core`'s view of the domain to the current epoch. Non-blocking
    /// and non-allocating: a single atomic store into a fixed-size,
    /// already-allocated table.
    pub fn enter(&self, core: u8) -> Guard<'_> {
        self.pinned[core as usize].store(self.current_epoch(), Ordering::Release);
        Guard { domain: self, core }
    }

    /// Queues `callback` to run once the domain's epoch has advanced past
    /// the one active right now.
    pub fn defer(&self, callback: impl FnOnce() + Send + 'static) {
        let epoch = self.current_epoch();
        self.deferred.lock().entry(epoch).or_insert_with(Vec::new).push(Box::new(callback));
    }

    /// Advances the global epoch by one if no pinned reader still
    /// references an epoch behind it, then runs every closure deferred
    /// against an epoch the new one has left behind. A no-op, not an error,
    /// if a reader is still pinned to the current epoch.
    pub fn try_advance(&self) {
        let current = self.current_epoch();
        let still_behind = self
            .pinned
            .iter()
            .map(|core| core.load(Ordering::Acquire))
            .any(|pinned| pinned != UNPINNED && pinned <= current);
        if still_behind {
            return;
        }
        if self.epoch.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed).is_err() {
            return;
        }
        log::trace!("rcu: domain advanced past epoch {}", current);
        self.run_expired(current);
    }

    fn run_expired(&self, up_to_epoch: u64) {
        let ready: Vec<Box<dyn FnOnce() + Send>> = {
            let mut deferred = self.deferred.lock();
            let expired_epochs: Vec<u64> = deferred.range(..=up_to_epoch).map(|(epoch, _)| *epoch).collect();
            let mut ready = Vec::new();
            for epoch in expired_epochs {
                if let Some(mut callbacks) = deferred.remove(&epoch) {
                    ready.append(&mut callbacks);
                }
            }
            ready
        };
        for callback in ready {
            callback();
        }
    }
}

impl Default for Domain {
    fn default() -> Domain {
        Domain::new()
    }
}

/// Unpins the core's epoch on drop.
pub struct Guard<'d> {
    domain: &'d Domain,
    core: u8,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.domain.pinned[self.core as usize].store(UNPINNED, Ordering::Release);
    }
}

struct ControlBlock<T> {
    count: JointCount,
    domain: &'static Domain,
    value: UnsafeCell<Option<T>>,
}

/// A strong, RCU-reclaimed reference to a heap-allocated `T`.
pub struct RcuArc<T> {
    ptr: *mut ControlBlock<T>,
}

unsafe impl<T: Send + Sync> Send for RcuArc<T> {}
unsafe impl<T: Send + Sync> Sync for RcuArc<T> {}

impl<T> RcuArc<T> {
    pub fn new(domain: &'static Domain, value: T) -> RcuArc<T> {
        let control = Box::new(ControlBlock {
            count: JointCount::new(1, 1),
            domain,
            value: UnsafeCell::new(Some(value)),
        });
        RcuArc { ptr: Box::into_raw(control) }
    }

    fn control(&self) -> &ControlBlock<T> {
        unsafe { &*self.ptr }
    }

    pub fn downgrade(&self) -> RcuWeak<T> {
        let ok = self.control().count.weak_retain();
        debug_assert!(ok, "rcu: downgraded a shared pointer whose weak count had already reached zero");
        RcuWeak { ptr: self.ptr }
    }

    pub fn get(&self) -> &T {
        // SAFETY: a live `RcuArc` guarantees the strong count hasn't
        // reached zero, so the deferred closure that takes `value` to
        // `None` cannot have run yet.
        unsafe { (*self.control().value.get()).as_ref() }
            .expect("rcu: RcuArc value accessed after its strong count reached zero")
    }
}

impl<T> Clone for RcuArc<T> {
    fn clone(&self) -> RcuArc<T> {
        let ok = self.control().count.strong_retain();
        debug_assert!(ok, "rcu: cloned a shared pointer whose strong count had already reached zero");
        RcuArc { ptr: self.ptr }
    }
}

impl<T> Drop for RcuArc<T> {
    fn drop(&mut self) {
        let released = self.control().count.strong_release();
        if released.strong_reached_zero {
            let ptr = self.ptr;
            let free_control_block = released.weak_reached_zero;
            let domain = self.control().domain;
            domain.defer(move || {
                // Drop the value first; only then, if this was also the
                // last weak reference, free the control block itself.
                unsafe { *(*ptr).value.get() = None };
                if free_control_block {
                    unsafe { drop(Box::from_raw(ptr)) };
                }
            });
            domain.try_advance();
        }
    }
}

/// A weak reference: does not keep the value alive, but keeps the control
/// block's allocation alive until it is dropped.
pub struct RcuWeak<T> {
    ptr: *mut ControlBlock<T>,
}

unsafe impl<T: Send + Sync> Send for RcuWeak<T> {}
unsafe impl<T: Send + Sync> Sync for RcuWeak<T> {}

impl<T> RcuWeak<T> {
    fn control(&self) -> &ControlBlock<T> {
        unsafe { &*self.ptr }
    }

    /// Attempts to upgrade to a strong reference. Fails if the value has
    /// already been reclaimed.
    pub fn lock(&self) -> Option<RcuArc<T>> {
        if self.control().count.strong_retain() {
            Some(RcuArc { ptr: self.ptr })
        } else {
            None
        }
    }
}

impl<T> Clone for RcuWeak<T> {
    fn clone(&self) -> RcuWeak<T> {
        let ok = self.control().count.weak_retain();
        debug_assert!(ok, "rcu: cloned a weak pointer whose weak count had already reached zero");
        RcuWeak { ptr: self.ptr }
    }
}

impl<T> Drop for RcuWeak<T> {
    fn drop(&mut self) {
        if self.control().count.weak_release() {
            let ptr = self.ptr;
            let domain = self.control().domain;
            domain.defer(move || unsafe { drop(Box::from_raw(ptr)) });
            domain.try_advance();
        }
    }
}

/// Implemented by a type that wants to hand out `RcuArc`/`RcuWeak`
/// references to itself without an extra allocation: the shared pointer
/// that first wraps it stores a weak self-reference here at construction
/// time via [`RcuArc::new_intrusive`].
pub trait RcuIntrusive: Sized {
    fn weak_self(&self) -> &RcuSelfCell<Self>;
}

/// Storage for a type's weak self-reference. Starts empty; populated once,
/// by the `RcuArc` that first wraps the owning value.
pub struct RcuSelfCell<T>(IrqSafeMutex<Option<RcuWeak<T>>>);

impl<T> RcuSelfCell<T> {
    pub const fn empty() -> RcuSelfCell<T> {
        RcuSelfCell(IrqSafeMutex::new(None))
    }
}

impl<T: RcuIntrusive> RcuArc<T> {
    /// Like [`RcuArc::new`], but also initializes `value`'s weak
    /// self-pointer so that [`loan_shared`]/[`loan_weak`] work on it
    /// afterward.
    pub fn new_intrusive(domain: &'static Domain, value: T) -> RcuArc<T> {
        let arc = RcuArc::new(domain, value);
        let weak = arc.downgrade();
        *arc.get().weak_self().0.lock() = Some(weak);
        arc
    }
}

/// Hands out a new strong reference to `value` without needing the
/// original `RcuArc` that created it, via its intrusive self-pointer.
/// Returns `None` if the value's strong count has already reached zero.
pub fn loan_shared<T: RcuIntrusive>(value: &T) -> Option<RcuArc<T>> {
    value.weak_self().0.lock().as_ref().and_then(|weak| weak.lock())
}

/// Hands out a new weak reference to `value` via its intrusive self-pointer.
pub fn loan_weak<T: RcuIntrusive>(value: &T) -> Option<RcuWeak<T>> {
    value.weak_self().0.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn strong_retain_and_release_round_trip() {
        let count = JointCount::new(1, 1);
        assert!(count.strong_retain());
        let released = count.strong_release();
        assert_eq!(released, Release::default());
        let released = count.strong_release();
        assert!(released.strong_reached_zero);
        assert!(released.weak_reached_zero);
    }

    #[test]
    fn strong_retain_fails_after_strong_reaches_zero() {
        let count = JointCount::new(1, 1);
        let released = count.strong_release();
        assert!(released.strong_reached_zero);
        assert!(!count.strong_retain());
    }

    #[test]
    fn weak_retain_fails_after_weak_reaches_zero() {
        let count = JointCount::new(0, 1);
        assert!(count.weak_release());
        assert!(!count.weak_retain());
    }

    #[test]
    fn extra_weak_ref_outlives_strong_release() {
        let count = JointCount::new(1, 2);
        let released = count.strong_release();
        assert!(released.strong_reached_zero);
        assert!(!released.weak_reached_zero);
        assert!(count.weak_release());
    }

    #[test]
    fn domain_defers_reclamation_until_no_reader_is_pinned() {
        let domain = Box::leak(Box::new(Domain::new()));
        let guard = domain.enter(0);
        let ran = Box::leak(Box::new(AtomicUsize::new(0)));
        domain.defer(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        domain.try_advance();
        assert_eq!(ran.load(Ordering::SeqCst), 0, "reader still pinned, must not reclaim yet");
        drop(guard);
        domain.try_advance();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rcu_arc_clone_and_drop_decrement_together() {
        let domain = Box::leak(Box::new(Domain::new()));
        let a = RcuArc::new(domain, 42u32);
        let b = a.clone();
        assert_eq!(*a.get(), 42);
        drop(a);
        assert_eq!(*b.get(), 42);
        drop(b);
    }

    #[test]
    fn dropping_the_last_strong_ref_reclaims_without_an_explicit_try_advance_call() {
        struct Marker(&'static AtomicUsize);
        impl Drop for Marker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let domain = Box::leak(Box::new(Domain::new()));
        let dropped = Box::leak(Box::new(AtomicUsize::new(0)));
        let arc = RcuArc::new(domain, Marker(dropped));
        drop(arc);
        assert_eq!(dropped.load(Ordering::SeqCst), 1, "no reader was ever pinned, so the drop itself should advance the epoch and reclaim");
    }

    #[test]
    fn weak_upgrade_fails_once_every_strong_ref_is_gone() {
        let domain = Box::leak(Box::new(Domain::new()));
        let a = RcuArc::new(domain, 7u32);
        let weak = a.downgrade();
        assert!(weak.lock().is_some());
        drop(a);
        assert!(weak.lock().is_none());
    }

    struct Node {
        value: u32,
        weak_self: RcuSelfCell<Node>,
    }

    impl RcuIntrusive for Node {
        fn weak_self(&self) -> &RcuSelfCell<Node> {
            &self.weak_self
        }
    }

    #[test]
    fn intrusive_self_pointer_loans_a_working_shared_ref() {
        let domain = Box::leak(Box::new(Domain::new()));
        let arc = RcuArc::new_intrusive(domain, Node { value: 9, weak_self: RcuSelfCell::empty() });
        let loaned = loan_shared(arc.get()).expect("weak self-pointer should still be live");
        assert_eq!(loaned.get().value, 9);
    }
}
