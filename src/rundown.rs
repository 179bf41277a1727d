//! Rundown protection: a refcounted "don't tear this device down while
//! someone is still using it" guard.
//!
//! Every operation that touches a device (a dispatched CDB, a control
//! command targeting it) must `acquire()` before reading device state and
//! `release()` when done. `Remove` calls `begin_rundown()` then
//! `wait_for_rundown()`, which blocks until the refcount drains to zero
//! and no further `acquire()` can succeed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Shared rundown state for one device. Cloned as an `Arc` wherever the
/// device itself is shared.
#[derive(Debug)]
pub struct RundownProtection {
    refcount: AtomicUsize,
    rundown_initiated: AtomicBool,
    drained: Mutex<bool>,
    drained_cv: Condvar,
}

impl Default for RundownProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl RundownProtection {
    pub fn new() -> Self {
        RundownProtection {
            refcount: AtomicUsize::new(0),
            rundown_initiated: AtomicBool::new(false),
            drained: Mutex::new(false),
            drained_cv: Condvar::new(),
        }
    }

    /// Attempts to take a reference. Fails once rundown has begun so no
    /// new operation can start against a device that is being torn down.
    /// Must be called while holding the registry lock so the check and
    /// the increment happen atomically with respect to `begin_rundown`.
    pub fn acquire(&self) -> bool {
        if self.rundown_initiated.load(Ordering::Acquire) {
            return false;
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);
        if self.rundown_initiated.load(Ordering::Acquire) {
            self.release();
            return false;
        }
        true
    }

    /// Releases a reference taken by `acquire()`. Never needs the
    /// registry lock held.
    pub fn release(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "rundown refcount underflow");
        if prev == 1 && self.rundown_initiated.load(Ordering::Acquire) {
            let mut drained = self.drained.lock().unwrap();
            *drained = true;
            self.drained_cv.notify_all();
        }
    }

    /// Latches rundown: from this point on, `acquire()` always fails.
    /// Must be called while holding the registry lock.
    pub fn begin_rundown(&self) {
        self.rundown_initiated.store(true, Ordering::Release);
        if self.refcount.load(Ordering::Acquire) == 0 {
            let mut drained = self.drained.lock().unwrap();
            *drained = true;
            self.drained_cv.notify_all();
        }
    }

    /// Blocks until the refcount has drained to zero after rundown was
    /// initiated. Must be called without the registry lock held.
    pub fn wait_for_rundown(&self) {
        let mut drained = self.drained.lock().unwrap();
        while !*drained {
            drained = self.drained_cv.wait(drained).unwrap();
        }
    }

    pub fn is_rundown_initiated(&self) -> bool {
        self.rundown_initiated.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_succeeds_before_rundown() {
        let rp = RundownProtection::new();
        assert!(rp.acquire());
        rp.release();
    }

    #[test]
    fn acquire_fails_after_rundown_begins() {
        let rp = RundownProtection::new();
        rp.begin_rundown();
        assert!(!rp.acquire());
    }

    #[test]
    fn wait_for_rundown_returns_immediately_with_zero_refs() {
        let rp = RundownProtection::new();
        rp.begin_rundown();
        rp.wait_for_rundown();
    }

    #[test]
    fn wait_for_rundown_blocks_until_last_reference_released() {
        let rp = Arc::new(RundownProtection::new());
        assert!(rp.acquire());

        let waiter = Arc::clone(&rp);
        let handle = thread::spawn(move || {
            waiter.begin_rundown();
            waiter.wait_for_rundown();
        });

        thread::sleep(Duration::from_millis(50));
        rp.release();
        handle.join().unwrap();
    }
}
