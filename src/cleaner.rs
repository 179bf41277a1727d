//! The adapter-wide cleaner task: a single housekeeping loop that
//! periodically reaps devices whose loops have already exited on their
//! own, and unconditionally reaps everything at shutdown.
//!
//! The original driver wakes this task off an explicit "device reported
//! missing" event; this crate's `ControlPlane::reap_orphaned` walks the
//! registry on a timer instead (`AdapterConfig::cleaner_interval_secs`),
//! since nothing here needs sub-second reap latency and a timer avoids a
//! second wake-up primitive alongside the per-device work signal.

use crate::control::ControlPlane;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Owns the background thread that periodically calls
/// `ControlPlane::reap_orphaned`. Constructed once per adapter; `stop`
/// wakes the thread immediately instead of waiting out its interval and
/// performs one final unconditional reap before returning.
pub struct CleanerThread {
    stop: Arc<(Mutex<bool>, Condvar)>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CleanerThread {
    /// Spawns the cleaner loop against `control`, waking every
    /// `interval` to reap devices whose loops already exited
    /// (`HardTerminating`/`LoopsExited`) without anyone calling `Remove`.
    pub fn start(control: Arc<ControlPlane>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_for_thread = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let (lock, cv) = &*stop_for_thread;
            loop {
                let mut stopped = lock.lock().unwrap();
                if *stopped {
                    break;
                }
                let (guard, timeout) = cv.wait_timeout(stopped, interval).unwrap();
                stopped = guard;
                if *stopped {
                    break;
                }
                drop(stopped);
                let reaped = control.reap_orphaned(false);
                if reaped > 0 {
                    debug!("cleaner reaped {reaped} orphaned device(s)");
                }
                let _ = timeout;
            }
            control.reap_orphaned(true);
        });
        CleanerThread {
            stop,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Wakes the cleaner thread, waits for its final unconditional reap
    /// pass, and joins it. Idempotent: a second call is a no-op.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let (lock, cv) = &*self.stop;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
