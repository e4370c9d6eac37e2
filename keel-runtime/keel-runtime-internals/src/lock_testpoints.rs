//! Points in `finish` and `unload` where a test can hold a thread.
//!
//! Only checked with the `concurrent_testpoints` feature. A test arms a point with
//! [`Syncpoint::wait_at`] before starting the thread under test; the thread then blocks in
//! [`Syncpoint::check`] until the returned [`SyncWaiter`] releases it.

use crate::context::lock_recover;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Gate {
    armed: bool,
    reached: bool,
}

#[derive(Default)]
struct Shared {
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl Shared {
    fn wait_while<F: Fn(&Gate) -> bool>(&self, mut gate: MutexGuard<'_, Gate>, blocked: F) {
        while blocked(&gate) {
            gate = self
                .changed
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// The test's side of an armed [`Syncpoint`].
///
/// Dropping a waiter without resuming it leaves the point armed.
pub struct SyncWaiter {
    shared: Arc<Shared>,
}

impl SyncWaiter {
    pub fn wait(self) {
        self.wait_and_then(|| {})
    }

    /// Block until the point is reached, run `f` while the other thread is held there, then
    /// release it.
    pub fn wait_and_then<U, F: FnOnce() -> U>(self, f: F) -> U {
        let held = self.pause();
        let res = f();
        held.resume();
        res
    }

    /// Block until the point is reached, and keep the other thread held there.
    #[must_use]
    pub fn pause(self) -> Self {
        let gate = lock_recover(&self.shared.gate);
        self.shared.wait_while(gate, |g| !g.reached);
        self
    }

    /// Release the held thread. Resuming before the point is reached disarms it.
    pub fn resume(self) {
        let mut gate = lock_recover(&self.shared.gate);
        gate.armed = false;
        self.shared.changed.notify_all();
    }
}

#[derive(Default)]
pub struct Syncpoint {
    shared: Arc<Shared>,
}

impl Syncpoint {
    pub fn new() -> Self {
        Syncpoint::default()
    }

    pub fn wait_at(&self) -> SyncWaiter {
        let mut gate = lock_recover(&self.shared.gate);
        gate.armed = true;
        gate.reached = false;
        SyncWaiter {
            shared: self.shared.clone(),
        }
    }

    /// Called by the runtime. Returns at once unless the point is armed.
    pub fn check(&self) {
        let mut gate = lock_recover(&self.shared.gate);
        if !gate.armed {
            return;
        }
        gate.reached = true;
        self.shared.changed.notify_all();
        self.shared.wait_while(gate, |g| g.armed);
    }
}

/// The points the runtime checks.
#[derive(Default)]
pub struct LockTestpoints {
    /// `finish` holds the critical section and knows the load order.
    pub loading_set_finish_before_construction: Syncpoint,
    /// `finish` constructed the whole batch but has not published it.
    pub loading_set_finish_before_publish: Syncpoint,
    /// `unload` claimed the module but has not destroyed its instance.
    pub module_info_unload_before_destroy: Syncpoint,
}

impl LockTestpoints {
    pub fn new() -> Self {
        LockTestpoints::default()
    }
}
