//! SMP Type Definitions
//!
//! Processor identifiers and CPU set types shared between the online-CPU
//! bookkeeping and the crash shutdown core. `CpuMask` is the concurrent
//! variant (disjoint per-CPU writers, any reader); `CpuSet` is a plain value
//! used for snapshots and reports.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::acpi;

/// Maximum number of CPUs supported
pub const MAX_CPUS: usize = acpi::MAX_CPUS;

const MASK_WORDS: usize = MAX_CPUS / 64;

/// Atomic CPU bitmap.
///
/// The crash pending-set relies on its write pattern: every CPU clears only
/// its own bit, so no lock is needed around the many-writer/single-reader
/// traffic during a shootdown.
pub struct CpuMask {
    words: [AtomicU64; MASK_WORDS],
}

impl CpuMask {
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            words: [ZERO; MASK_WORDS],
        }
    }

    pub fn set(&self, cpu: usize) {
        self.words[cpu / 64].fetch_or(1 << (cpu % 64), Ordering::SeqCst);
    }

    pub fn clear(&self, cpu: usize) {
        self.words[cpu / 64].fetch_and(!(1 << (cpu % 64)), Ordering::SeqCst);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.words[cpu / 64].load(Ordering::SeqCst) & (1 << (cpu % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::SeqCst) == 0)
    }

    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::SeqCst).count_ones() as usize)
            .sum()
    }

    /// Replace the whole mask with the given value.
    pub fn reset_to(&self, set: &CpuSet) {
        for (word, value) in self.words.iter().zip(set.words.iter()) {
            word.store(*value, Ordering::SeqCst);
        }
    }

    pub fn snapshot(&self) -> CpuSet {
        let mut words = [0u64; MASK_WORDS];
        for (dst, src) in words.iter_mut().zip(self.words.iter()) {
            *dst = src.load(Ordering::SeqCst);
        }
        CpuSet { words }
    }
}

/// Plain-value CPU set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSet {
    words: [u64; MASK_WORDS],
}

impl CpuSet {
    pub const fn empty() -> Self {
        Self {
            words: [0; MASK_WORDS],
        }
    }

    pub fn set(&mut self, cpu: usize) {
        self.words[cpu / 64] |= 1 << (cpu % 64);
    }

    pub fn clear(&mut self, cpu: usize) {
        self.words[cpu / 64] &= !(1 << (cpu % 64));
    }

    /// Copy of this set with one CPU removed.
    pub fn without(mut self, cpu: usize) -> Self {
        self.clear(cpu);
        self
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.words[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |cpu| self.contains(*cpu))
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cpu in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", cpu)?;
            first = false;
        }
        Ok(())
    }
}
