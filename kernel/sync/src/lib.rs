//! IRQ-safe synchronization primitives.
//!
//! A lock that can be taken from both regular kernel code and from an ISR
//! must disable interrupts on the current core while held, otherwise an
//! interrupt that fires mid-critical-section and tries to retake the same
//! lock deadlocks the core against itself. These wrappers save the
//! interrupt flag, disable interrupts, and restore the saved flag (not
//! unconditionally re-enable) when the guard drops, so nested acquisitions
//! compose correctly.

#![no_std]

use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use x86_64::instructions::interrupts;

/// RAII token that restores the saved interrupt flag on drop.
struct HeldInterrupts(bool);

fn hold_interrupts() -> HeldInterrupts {
    let were_enabled = interrupts::are_enabled();
    interrupts::disable();
    HeldInterrupts(were_enabled)
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        if self.0 {
            interrupts::enable();
        }
    }
}

/// A mutex that disables interrupts on the current core for as long as it
/// is held. Safe to use from any context, including ISR slots, as long as
/// the critical section itself is non-blocking.
pub struct IrqSafeMutex<T: ?Sized> {
    inner: Mutex<T>,
}

pub struct IrqSafeMutexGuard<'a, T: ?Sized + 'a> {
    _held: HeldInterrupts,
    guard: MutexGuard<'a, T>,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> Self {
        IrqSafeMutex { inner: Mutex::new(value) }
    }
}

impl<T: ?Sized> IrqSafeMutex<T> {
    pub fn lock(&self) -> IrqSafeMutexGuard<'_, T> {
        let held = hold_interrupts();
        let guard = self.inner.lock();
        IrqSafeMutexGuard { _held: held, guard }
    }

    pub fn try_lock(&self) -> Option<IrqSafeMutexGuard<'_, T>> {
        let held = hold_interrupts();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSafeMutexGuard { _held: held, guard }),
            None => None,
        }
    }
}

impl<'a, T: ?Sized> Deref for IrqSafeMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}
impl<'a, T: ?Sized> DerefMut for IrqSafeMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A reader-writer lock with the same IRQ-safety as [`IrqSafeMutex`]. Used by
/// the notification subscriber set: shared during `process`, exclusive
/// during `subscribe`/`unsubscribe`.
pub struct IrqSafeRwLock<T: ?Sized> {
    inner: RwLock<T>,
}

pub struct IrqSafeRwLockReadGuard<'a, T: ?Sized + 'a> {
    _held: HeldInterrupts,
    guard: RwLockReadGuard<'a, T>,
}

pub struct IrqSafeRwLockWriteGuard<'a, T: ?Sized + 'a> {
    _held: HeldInterrupts,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> IrqSafeRwLock<T> {
    pub const fn new(value: T) -> Self {
        IrqSafeRwLock { inner: RwLock::new(value) }
    }
}

impl<T: ?Sized> IrqSafeRwLock<T> {
    pub fn read(&self) -> IrqSafeRwLockReadGuard<'_, T> {
        let held = hold_interrupts();
        let guard = self.inner.read();
        IrqSafeRwLockReadGuard { _held: held, guard }
    }

    pub fn write(&self) -> IrqSafeRwLockWriteGuard<'_, T> {
        let held = hold_interrupts();
        let guard = self.inner.write();
        IrqSafeRwLockWriteGuard { _held: held, guard }
    }
}

impl<'a, T: ?Sized> Deref for IrqSafeRwLockReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}
impl<'a, T: ?Sized> Deref for IrqSafeRwLockWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}
impl<'a, T: ?Sized> DerefMut for IrqSafeRwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
