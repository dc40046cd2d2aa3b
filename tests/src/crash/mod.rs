//! Crash shutdown core (coordinator, remote handler, platform trait),
//! included directly from the hypervisor source.

#[path = "../../../src/crash/core.rs"]
pub mod core;
