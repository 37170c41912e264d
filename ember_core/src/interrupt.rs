//! Per-context interrupt words.
//!
//! An execution context owns a pending word and a mask word. Any thread
//! (or a signal handler) may set pending bits; the owning interpreter
//! thread polls them at safe points and consumes the unmasked ones. Both
//! words are plain atomics so setting a bit is async-signal-safe.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Interrupt kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InterruptBits: u32 {
        /// Time slice expired.
        const TIMER         = 1 << 0;
        /// Another thread requested attention.
        const PENDING       = 1 << 1;
        /// Postponed jobs or work-queue jobs are waiting.
        const POSTPONED_JOB = 1 << 2;
        /// A signal trap handler is waiting.
        const TRAP          = 1 << 3;
        /// The context must terminate.
        const TERMINATE     = 1 << 4;
    }
}

/// Pending and mask words of one execution context.
#[derive(Debug, Default)]
pub struct InterruptFlags {
    pending: AtomicU32,
    mask: AtomicU32,
}

impl InterruptFlags {
    /// No pending bits, nothing masked.
    pub const fn new() -> Self {
        Self {
            pending: AtomicU32::new(0),
            mask: AtomicU32::new(0),
        }
    }

    /// Raise interrupt bits. Async-signal-safe.
    #[inline]
    pub fn set(&self, bits: InterruptBits) {
        self.pending.fetch_or(bits.bits(), Ordering::Release);
    }

    /// Bits currently pending, masked or not.
    #[inline]
    pub fn pending(&self) -> InterruptBits {
        InterruptBits::from_bits_retain(self.pending.load(Ordering::Acquire))
    }

    /// Whether any unmasked bit is pending.
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        let pending = self.pending.load(Ordering::Acquire);
        let mask = self.mask.load(Ordering::Acquire);
        pending & !mask != 0
    }

    /// Consume every pending bit that is not masked, leaving masked bits
    /// pending for later.
    pub fn take_pending(&self) -> InterruptBits {
        let mask = self.mask.load(Ordering::Acquire);
        let previous = self.pending.fetch_and(mask, Ordering::AcqRel);
        InterruptBits::from_bits_retain(previous & !mask)
    }

    /// Drop pending bits without handling them.
    #[inline]
    pub fn clear(&self, bits: InterruptBits) {
        self.pending.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Bits currently masked.
    #[inline]
    pub fn masked(&self) -> InterruptBits {
        InterruptBits::from_bits_retain(self.mask.load(Ordering::Acquire))
    }

    /// Add bits to the mask.
    #[inline]
    pub fn mask(&self, bits: InterruptBits) {
        self.mask.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    /// Remove bits from the mask.
    #[inline]
    pub fn unmask(&self, bits: InterruptBits) {
        self.mask.fetch_and(!bits.bits(), Ordering::AcqRel);
    }
}
