//! Interrupt-to-thread wakeups.
//!
//! A [`Completion`] is a one-shot latch: the submitter arms it before
//! handing work to the device, the interrupt handler latches it, and the
//! submitter waits for the latch. Because the latch is armed before the
//! device can possibly complete, a completion that fires before the
//! waiter starts waiting is never lost.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{Error, Result};

/// One-shot completion latch with a payload.
#[derive(Debug)]
pub struct Completion {
    done: AtomicBool,
    value: AtomicU32,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            value: AtomicU32::new(0),
        }
    }

    /// Clear the latch. Call before publishing the request.
    pub fn arm(&self) {
        self.done.store(false, Ordering::Release);
    }

    /// Latch the completion with `value`. Interrupt context safe.
    pub fn complete(&self, value: u32) {
        self.value.store(value, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
    }

    /// Whether the latch is set.
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait for the latch, returning the payload.
    ///
    /// With `spin_limit` set, gives up with [`Error::Timeout`] after that
    /// many polls.
    pub fn wait(&self, spin_limit: Option<u64>) -> Result<u32> {
        let mut spins: u64 = 0;
        while !self.done.load(Ordering::Acquire) {
            if let Some(limit) = spin_limit {
                if spins >= limit {
                    return Err(Error::Timeout);
                }
            }
            spins += 1;
            spin_loop();
        }
        Ok(self.value.load(Ordering::Relaxed))
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
