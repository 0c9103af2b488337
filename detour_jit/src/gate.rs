//! Compilation gate.
//!
//! Compiler threads hold a [`CompilationTicket`] while they generate and
//! commit code. A [`JitSuspendGuard`] closes the gate: new compilations block
//! at [`CompilationGate::begin_compilation`] and the guard is only handed out
//! once every in-flight compilation has finished.

use parking_lot::{Condvar, Mutex};
use tracing::trace;

#[derive(Debug, Default)]
struct GateState {
    /// Outstanding suspension guards.
    suspend_count: u32,
    /// Compilations currently holding a ticket.
    active: u32,
}

/// Serializes compilation against suspension windows.
#[derive(Debug, Default)]
pub struct CompilationGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl CompilationGate {
    /// Create an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a compilation, blocking while the gate is closed.
    pub fn begin_compilation(&self) -> CompilationTicket<'_> {
        let mut state = self.state.lock();
        while state.suspend_count > 0 {
            self.changed.wait(&mut state);
        }
        state.active += 1;
        CompilationTicket { gate: self }
    }

    /// Start a compilation unless the gate is closed.
    pub fn try_begin_compilation(&self) -> Option<CompilationTicket<'_>> {
        let mut state = self.state.lock();
        if state.suspend_count > 0 {
            return None;
        }
        state.active += 1;
        Some(CompilationTicket { gate: self })
    }

    /// Close the gate and wait for in-flight compilations to drain.
    pub fn suspend(&self) -> JitSuspendGuard<'_> {
        let mut state = self.state.lock();
        state.suspend_count += 1;
        while state.active > 0 {
            self.changed.wait(&mut state);
        }
        trace!(suspensions = state.suspend_count, "JIT suspended");
        JitSuspendGuard { gate: self }
    }

    /// Check if the gate is closed.
    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspend_count > 0
    }

    /// Number of compilations holding a ticket.
    #[inline]
    pub fn active_compilations(&self) -> u32 {
        self.state.lock().active
    }

    fn finish_compilation(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active == 0 {
            self.changed.notify_all();
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        state.suspend_count -= 1;
        if state.suspend_count == 0 {
            trace!("JIT resumed");
            self.changed.notify_all();
        }
    }
}

/// Held by a compiler thread for the duration of one compilation.
#[derive(Debug)]
#[must_use = "the compilation ends when the ticket is dropped"]
pub struct CompilationTicket<'a> {
    gate: &'a CompilationGate,
}

impl Drop for CompilationTicket<'_> {
    fn drop(&mut self) {
        self.gate.finish_compilation();
    }
}

/// Keeps compilation suspended until dropped.
#[derive(Debug)]
#[must_use = "compilation resumes when the guard is dropped"]
pub struct JitSuspendGuard<'a> {
    gate: &'a CompilationGate,
}

impl Drop for JitSuspendGuard<'_> {
    fn drop(&mut self) {
        self.gate.resume();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ticket_counts() {
        let gate = CompilationGate::new();
        let a = gate.begin_compilation();
        let b = gate.begin_compilation();
        assert_eq!(gate.active_compilations(), 2);
        drop(a);
        drop(b);
        assert_eq!(gate.active_compilations(), 0);
    }

    #[test]
    fn test_suspend_closes_gate() {
        let gate = CompilationGate::new();
        {
            let _outer = gate.suspend();
            let _inner = gate.suspend();
            assert!(gate.is_suspended());
            assert!(gate.try_begin_compilation().is_none());
        }
        assert!(!gate.is_suspended());
        assert!(gate.try_begin_compilation().is_some());
    }

    #[test]
    fn test_suspend_waits_for_in_flight_compilation() {
        let gate = Arc::new(CompilationGate::new());
        let ticket_taken = Arc::new(std::sync::Barrier::new(2));
        let finished = Arc::new(AtomicBool::new(false));

        let worker = {
            let gate = Arc::clone(&gate);
            let ticket_taken = Arc::clone(&ticket_taken);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let _ticket = gate.begin_compilation();
                ticket_taken.wait();
                thread::sleep(Duration::from_millis(20));
                finished.store(true, Ordering::SeqCst);
            })
        };

        ticket_taken.wait();
        let _guard = gate.suspend();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(gate.active_compilations(), 0);
        worker.join().unwrap();
    }

    #[test]
    fn test_compilation_blocks_while_suspended() {
        let gate = Arc::new(CompilationGate::new());
        let guard_released = Arc::new(AtomicBool::new(false));
        let guard = gate.suspend();

        let worker = {
            let gate = Arc::clone(&gate);
            let guard_released = Arc::clone(&guard_released);
            thread::spawn(move || {
                let _ticket = gate.begin_compilation();
                guard_released.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(20));
        guard_released.store(true, Ordering::SeqCst);
        drop(guard);
        assert!(worker.join().unwrap());
    }
}
