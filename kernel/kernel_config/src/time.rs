//! Timing-related constants.

/// Microseconds the SMP bring-up protocol waits after sending the INIT IPI
/// before sending the startup IPI (SIPI), per the Intel MP spec.
pub const SMP_INIT_IPI_WAIT_MS: u64 = 10;

/// Microseconds the SMP bring-up protocol waits after sending the first SIPI
/// before either observing AP liveness or sending a second SIPI.
pub const SMP_SIPI_WAIT_US: u64 = 200;

/// Total time the BSP waits for an AP to signal liveness before giving up on it.
pub const SMP_AP_LIVENESS_TIMEOUT_MS: u64 = 500;
