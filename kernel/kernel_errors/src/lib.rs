//! The error taxonomy shared by the virtual-memory, interrupt/APIC, and
//! notification cores.
//!
//! There is no exception machinery here, only a status value: every fallible
//! operation in this workspace returns `Result<T, Error>`. A component that
//! violates its own non-blocking/non-allocating contract (for example,
//! running out of memory inside `eoi()`) does not return an `Error` at all;
//! it calls [`bugcheck`], which is fatal by design.

#![no_std]

use core::fmt;

/// One of the six error kinds named by the spec's error-handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misaligned or empty address, non-canonical virtual address, a range
    /// with `back < front`, or an unmap of an unmapped range for a strict
    /// variant (e.g. `unmap2m` on a range that isn't 2 MiB-aligned).
    InvalidInput,
    /// The frame allocator, TLSF heap, or page-table allocator is exhausted.
    /// Returned only after the three-step reservation protocol has failed.
    OutOfMemory,
    /// A topic UUID or subscriber was not registered.
    NotFound,
    /// A firmware table's signature or checksum did not validate.
    InvalidData,
    /// The requested capability is not present on this CPU or platform,
    /// e.g. x2APIC requested without CPUID support.
    NotSupported,
    /// The per-CPU ISR table has no free vector left to allocate.
    OutOfVectors,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidData => "invalid data",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::OutOfVectors => "out of vectors",
        };
        f.write_str(s)
    }
}

/// A structured error: a [`ErrorKind`] plus the static context message that
/// produced it. Carrying only a `&'static str` keeps this allocation-free,
/// so it can be constructed from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: &'static str,
}

impl Error {
    pub const fn new(kind: ErrorKind, context: &'static str) -> Self {
        Error { kind, context }
    }

    pub const fn invalid_input(context: &'static str) -> Self {
        Self::new(ErrorKind::InvalidInput, context)
    }

    pub const fn out_of_memory(context: &'static str) -> Self {
        Self::new(ErrorKind::OutOfMemory, context)
    }

    pub const fn not_found(context: &'static str) -> Self {
        Self::new(ErrorKind::NotFound, context)
    }

    pub const fn invalid_data(context: &'static str) -> Self {
        Self::new(ErrorKind::InvalidData, context)
    }

    pub const fn not_supported(context: &'static str) -> Self {
        Self::new(ErrorKind::NotSupported, context)
    }

    pub const fn out_of_vectors(context: &'static str) -> Self {
        Self::new(ErrorKind::OutOfVectors, context)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.context)
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Reports a violation of a reentrancy or atomicity contract that this core
/// cannot recover from, then halts the current core.
///
/// Examples: out-of-memory inside an ISR slot, a kernel-mode page fault on a
/// page mapped with the wrong flags. A full symbolicated stack walk needs the
/// loader/debug-info machinery that is out of scope for this core, so this
/// logs what it can and parks the core with interrupts disabled.
#[cold]
#[inline(never)]
pub fn bugcheck(message: &str) -> ! {
    log::error!("BUGCHECK: {}", message);
    x86_64::instructions::interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}
