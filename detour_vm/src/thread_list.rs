//! Thread registry and suspend-all coordination.
//!
//! A world stop proceeds in three steps:
//! 1. Raise the pending flag so running threads park at their next poll
//! 2. Wait until every thread other than the requester is suspended
//! 3. Hold the world stopped until the [`SuspendAllGuard`] is dropped
//!
//! State transitions into and out of [`ThreadState::Runnable`] happen under
//! the control lock, so a thread can never slip back into managed code while
//! a suspension is active.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::trace;

use crate::thread::{ManagedThread, ThreadState};

#[derive(Debug, Default)]
struct SuspendControl {
    /// Thread id owning the active suspension.
    requester: Option<u64>,
}

// =============================================================================
// ThreadList
// =============================================================================

/// Every thread attached to a runtime.
#[derive(Debug)]
pub struct ThreadList {
    threads: RwLock<Vec<Arc<ManagedThread>>>,
    control: Mutex<SuspendControl>,
    changed: Condvar,
    suspend_pending: AtomicBool,
    next_id: AtomicU64,
}

impl ThreadList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            threads: RwLock::new(Vec::new()),
            control: Mutex::new(SuspendControl::default()),
            changed: Condvar::new(),
            suspend_pending: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attach a new thread. It starts runnable, waiting out any suspension
    /// in progress.
    pub fn attach(&self, name: &str, stack_limit: usize) -> Arc<ManagedThread> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(ManagedThread::new(id, name, stack_limit));
        self.threads.write().push(Arc::clone(&thread));
        self.transition_to_runnable(&thread);
        trace!(id, name, "thread attached");
        thread
    }

    /// Detach a thread.
    pub fn detach(&self, thread: &ManagedThread) {
        self.transition_from_runnable(thread, ThreadState::Native);
        self.threads.write().retain(|t| t.id() != thread.id());
        trace!(id = thread.id(), "thread detached");
    }

    /// Number of attached threads.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    /// Check if no thread is attached.
    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// Visit every attached thread.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<ManagedThread>)) {
        for thread in self.threads.read().iter() {
            f(thread);
        }
    }

    /// Check if a suspension is requested or active.
    #[inline]
    pub fn is_suspend_pending(&self) -> bool {
        self.suspend_pending.load(Ordering::Acquire)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Leave managed code.
    pub fn transition_from_runnable(&self, thread: &ManagedThread, state: ThreadState) {
        debug_assert!(state.is_suspended());
        let _control = self.control.lock();
        thread.set_state(state);
        self.changed.notify_all();
    }

    /// Re-enter managed code, waiting while another thread holds the world
    /// stopped.
    pub fn transition_to_runnable(&self, thread: &ManagedThread) {
        let mut control = self.control.lock();
        while control.requester.is_some_and(|id| id != thread.id()) {
            self.changed.wait(&mut control);
        }
        thread.set_state(ThreadState::Runnable);
    }

    /// Park if a suspension is pending.
    #[inline]
    pub fn poll_safepoint(&self, thread: &ManagedThread) {
        if !self.is_suspend_pending() {
            return;
        }
        self.transition_from_runnable(thread, ThreadState::AtSafepoint);
        self.transition_to_runnable(thread);
    }

    /// Run `f` with the thread marked blocked, so world stops need not wait
    /// for it.
    pub fn blocking<R>(&self, thread: &ManagedThread, f: impl FnOnce() -> R) -> R {
        let previous = thread.state();
        if previous.is_suspended() {
            return f();
        }
        self.transition_from_runnable(thread, ThreadState::Blocked);
        let result = f();
        self.transition_to_runnable(thread);
        result
    }

    // =========================================================================
    // Suspend All
    // =========================================================================

    /// Suspend every thread except `requester`.
    ///
    /// Waits for any other suspension to end first. The requester must not
    /// be runnable itself, or two concurrent requesters would wait on each
    /// other.
    pub fn suspend_all(&self, requester: &ManagedThread) -> SuspendAllGuard<'_> {
        let mut control = self.control.lock();
        while control.requester.is_some() {
            self.changed.wait(&mut control);
        }
        control.requester = Some(requester.id());
        self.suspend_pending.store(true, Ordering::Release);

        loop {
            let running = self
                .threads
                .read()
                .iter()
                .filter(|t| t.id() != requester.id() && !t.state().is_suspended())
                .count();
            if running == 0 {
                break;
            }
            trace!(running, "waiting for threads to suspend");
            self.changed.wait(&mut control);
        }
        SuspendAllGuard { list: self }
    }

    fn resume_all(&self) {
        let mut control = self.control.lock();
        control.requester = None;
        self.suspend_pending.store(false, Ordering::Release);
        self.changed.notify_all();
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps every other thread suspended until dropped.
#[must_use]
pub struct SuspendAllGuard<'a> {
    list: &'a ThreadList,
}

impl Drop for SuspendAllGuard<'_> {
    fn drop(&mut self) {
        self.list.resume_all();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_attach_detach() {
        let list = ThreadList::new();
        let a = list.attach("a", 8);
        let b = list.attach("b", 8);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.state(), ThreadState::Runnable);
        assert_eq!(list.len(), 2);
        list.detach(&a);
        assert_eq!(list.len(), 1);
        assert_eq!(a.state(), ThreadState::Native);
    }

    #[test]
    fn test_poll_is_noop_without_suspension() {
        let list = ThreadList::new();
        let t = list.attach("t", 8);
        list.poll_safepoint(&t);
        assert_eq!(t.state(), ThreadState::Runnable);
    }

    #[test]
    fn test_suspend_all_skips_blocked_threads() {
        let list = ThreadList::new();
        let main = list.attach("main", 8);
        let other = list.attach("other", 8);
        list.transition_from_runnable(&other, ThreadState::Blocked);
        list.transition_from_runnable(&main, ThreadState::Native);

        let guard = list.suspend_all(&main);
        assert!(list.is_suspend_pending());
        drop(guard);
        assert!(!list.is_suspend_pending());
    }

    #[test]
    fn test_suspend_all_waits_for_polling_thread() {
        let list = Arc::new(ThreadList::new());
        let main = list.attach("main", 8);
        let worker = list.attach("worker", 8);
        let polls = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let (list, worker, polls, stop) =
                (Arc::clone(&list), Arc::clone(&worker), Arc::clone(&polls), Arc::clone(&stop));
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    list.poll_safepoint(&worker);
                    polls.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                }
                list.detach(&worker);
            })
        };

        list.transition_from_runnable(&main, ThreadState::Native);
        {
            let _guard = list.suspend_all(&main);
            assert_eq!(worker.state(), ThreadState::AtSafepoint);
            let frozen = polls.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(polls.load(Ordering::Relaxed), frozen);
        }
        stop.store(true, Ordering::Release);
        handle.join().unwrap();
    }

    #[test]
    fn test_blocking_thread_resumes_after_release() {
        let list = Arc::new(ThreadList::new());
        let main = list.attach("main", 8);
        let worker = list.attach("worker", 8);
        let parked = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let handle = {
            let (list, worker, parked, release) =
                (Arc::clone(&list), Arc::clone(&worker), Arc::clone(&parked), Arc::clone(&release));
            thread::spawn(move || {
                list.blocking(&worker, || {
                    parked.wait();
                    release.wait();
                });
                worker.state()
            })
        };

        parked.wait();
        list.transition_from_runnable(&main, ThreadState::Native);
        let guard = list.suspend_all(&main);
        assert_eq!(worker.state(), ThreadState::Blocked);
        release.wait();
        // The worker cannot become runnable while the guard is held.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(worker.state(), ThreadState::Blocked);
        drop(guard);
        assert_eq!(handle.join().unwrap(), ThreadState::Runnable);
    }
}
