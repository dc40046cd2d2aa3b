//! HeliosHV Test Suite
//!
//! This crate tests hypervisor code by directly including its source files.
//! This bypasses no_std restrictions while testing the actual logic.
//!
//! # How it works
//! 1. We define stub macros (kinfo!, kwarn!, etc.) that map to eprintln! or no-op
//! 2. We use `#[path = "..."]` to include hypervisor source files directly
//! 3. The `core::` references in hypervisor code work because std re-exports core
//!
//! This allows testing the real crash shutdown sequence without QEMU: the
//! `CrashPlatform` seam is filled by a thread-backed mock instead of hardware.

// ===========================================================================
// Macro stubs - these replace the hypervisor's logging macros for testing
// ===========================================================================

/// Stub for the kinfo! macro - prints to stderr in tests
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[INFO] {}", format_args!($($arg)*));
    }};
}

/// Stub for the kwarn! macro - prints to stderr in tests
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[WARN] {}", format_args!($($arg)*));
    }};
}

/// Stub for the kerror! macro - prints to stderr in tests
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[ERROR] {}", format_args!($($arg)*));
    }};
}

/// Stub for the kfatal! macro - prints to stderr in tests
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        #[cfg(test)]
        eprintln!("[FATAL] {}", format_args!($($arg)*));
    }};
}

/// Stub for the kdebug! macro - no-op in tests
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{}};
}

/// Stub for the ktrace! macro - no-op in tests (too verbose)
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{}};
}

// ===========================================================================
// Environment stubs - constants the included source files need
// ===========================================================================

/// ACPI stub - provides MAX_CPUS constant
pub mod acpi {
    /// Maximum number of CPUs supported (same as the hypervisor)
    pub const MAX_CPUS: usize = 256;
}

// ===========================================================================
// Import hypervisor source files directly using #[path]
// ===========================================================================



// Crash shutdown core (coordinator, remote handler, platform trait)
pub mod crash;

// ===========================================================================
// Hardware-level mocks (simulate the platform, NOT the shutdown logic)
// ===========================================================================


// ===========================================================================
// Test modules
// ===========================================================================

#[cfg(test)]
mod tests;
