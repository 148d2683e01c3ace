// ==============================================================================
// barrier.rs - Readiness Barriers
// ==============================================================================
// Description: Mutex/condvar readiness flags shared by a pool of workers
// Author: Matt Barham
// Created: 2026-10-19
// Modified: 2026-10-19
// Version: 1.0.0
// ==============================================================================
// Two waits are supported over the same flags:
//   wait_for_predecessors(i) - loader pool, store access in index order
//   wait_all()               - group worker pool, everyone starts together
// An abort wakes every waiter with an error so no thread blocks forever.
// ==============================================================================

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Barrier aborted: {0}")]
pub struct BarrierAborted(pub String);

#[derive(Debug)]
struct State {
    ready: Vec<bool>,
    aborted: Option<String>,
}

#[derive(Debug)]
pub struct ReadyFlags {
    state: Mutex<State>,
    changed: Condvar,
}

impl ReadyFlags {
    pub fn new(workers: usize) -> Self {
        Self {
            state: Mutex::new(State {
                ready: vec![false; workers],
                aborted: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the flags stay meaningful even if a worker panicked holding the lock
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn signal_ready(&self, worker: usize) {
        let mut state = self.lock();
        if let Some(flag) = state.ready.get_mut(worker) {
            *flag = true;
        }
        self.changed.notify_all();
    }

    fn wait_until(&self, done: impl Fn(&State) -> bool) -> Result<(), BarrierAborted> {
        let mut state = self.lock();
        loop {
            if let Some(reason) = &state.aborted {
                return Err(BarrierAborted(reason.clone()));
            }
            if done(&state) {
                return Ok(());
            }
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until workers `0..worker` have all signalled
    pub fn wait_for_predecessors(&self, worker: usize) -> Result<(), BarrierAborted> {
        self.wait_until(|state| state.ready.iter().take(worker).all(|r| *r))
    }

    /// Block until every worker has signalled
    pub fn wait_all(&self) -> Result<(), BarrierAborted> {
        self.wait_until(|state| state.ready.iter().all(|r| *r))
    }

    /// Wake all waiters with an error; the first reason is kept
    pub fn abort(&self, reason: &str) {
        let mut state = self.lock();
        if state.aborted.is_none() {
            state.aborted = Some(reason.to_string());
        }
        self.changed.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted.is_some()
    }

    pub fn ready_count(&self) -> usize {
        self.lock().ready.iter().filter(|r| **r).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_predecessor_order() {
        let flags = Arc::new(ReadyFlags::new(4));
        let order = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .rev()
            .map(|i| {
                let flags = flags.clone();
                let order = order.clone();
                thread::spawn(move || {
                    flags.wait_for_predecessors(i).unwrap();
                    order.lock().unwrap().push(i);
                    thread::sleep(Duration::from_millis(5));
                    flags.signal_ready(i);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(flags.ready_count(), 4);
    }

    #[test]
    fn test_wait_all_releases_together() {
        let flags = Arc::new(ReadyFlags::new(3));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let flags = flags.clone();
                thread::spawn(move || {
                    flags.signal_ready(i);
                    flags.wait_all().unwrap();
                    flags.ready_count()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3);
        }
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let flags = Arc::new(ReadyFlags::new(2));
        let waiter = {
            let flags = flags.clone();
            thread::spawn(move || flags.wait_for_predecessors(1))
        };
        thread::sleep(Duration::from_millis(20));
        flags.abort("loader 0 failed");
        flags.abort("second reason");
        assert_eq!(waiter.join().unwrap(), Err(BarrierAborted("loader 0 failed".into())));
        assert!(flags.is_aborted());
        assert!(flags.wait_all().is_err());
    }

    #[test]
    fn test_first_worker_never_waits() {
        let flags = ReadyFlags::new(2);
        assert!(flags.wait_for_predecessors(0).is_ok());
    }
}
