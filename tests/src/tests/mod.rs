//! Crash shutdown tests.
//!
//! Scenario tests drive the real coordinator and remote-handler code against
//! the thread-backed mock platform; unit tests cover the CPU set types and
//! the APIC addressing-mode decoding.

mod cpumask;
mod crash;
