//! Sync barrier gating reads behind in-flight index work.
//!
//! Every unit of work that mutates an index across a suspension point holds
//! an [`InFlight`] guard. Readers call [`SyncBarrier::await_sync`] (or the
//! blocking [`SyncBarrier::wait`]) to run once nothing is in flight.
//!
//! A counter that never returns to zero freezes every gated read, so raw
//! [`SyncBarrier::increment`] / [`SyncBarrier::decrement`] pairs should be
//! rare; prefer [`SyncBarrier::acquire`], whose guard releases on every exit
//! path including unwinding.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

type Waiter = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Pending {
    count: usize,
    waiters: Vec<Waiter>,
}

/// Pending-work counter with a FIFO queue of waiters.
///
/// Cheap to clone; clones share the same counter.
#[derive(Clone, Default)]
pub struct SyncBarrier {
    inner: Arc<Mutex<Pending>>,
}

impl SyncBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of units of work in flight.
    pub fn pending(&self) -> usize {
        self.inner.lock().count
    }

    /// Number of waiters queued behind in-flight work.
    pub fn queued(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Start a unit of work. The returned guard ends it when dropped.
    pub fn acquire(&self) -> InFlight {
        self.increment();
        InFlight {
            barrier: self.clone(),
        }
    }

    /// Raw increment. Must be paired with exactly one [`decrement`](Self::decrement).
    pub fn increment(&self) {
        self.inner.lock().count += 1;
    }

    /// Raw decrement. When the count reaches zero, every queued waiter runs
    /// on the calling thread in the order it was queued.
    pub fn decrement(&self) {
        let ready = {
            let mut pending = self.inner.lock();
            if pending.count == 0 {
                debug_assert!(false, "sync barrier decremented below zero");
                tracing::warn!("sync barrier decremented below zero");
                return;
            }
            pending.count -= 1;
            if pending.count > 0 {
                return;
            }
            std::mem::take(&mut pending.waiters)
        };

        // run outside the lock so waiters may re-enter the barrier
        for waiter in ready {
            waiter();
        }
    }

    /// Run `f` once nothing is in flight: now, if the barrier is idle,
    /// otherwise after the decrement that brings the count to zero.
    pub fn await_sync<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut pending = self.inner.lock();
            if pending.count > 0 {
                pending.waiters.push(Box::new(f));
                return;
            }
        }
        f();
    }

    /// Block the calling thread until nothing is in flight.
    ///
    /// Must not be called while the caller itself holds an [`InFlight`]
    /// guard.
    pub fn wait(&self) {
        let (tx, rx) = bounded(1);
        self.await_sync(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns false
    /// on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (tx, rx) = bounded(1);
        self.await_sync(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }
}

impl std::fmt::Debug for SyncBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.inner.lock();
        f.debug_struct("SyncBarrier")
            .field("pending", &pending.count)
            .field("waiters", &pending.waiters.len())
            .finish()
    }
}

/// A unit of in-flight work. Releases its hold on the barrier when dropped.
#[must_use = "dropping the guard ends the unit of work immediately"]
#[derive(Debug)]
pub struct InFlight {
    barrier: SyncBarrier,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.barrier.decrement();
    }
}
