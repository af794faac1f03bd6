//! Counting admission gate bounding simultaneous downloads.
//!
//! `acquire` blocks the worker's thread until a slot is free and hands back
//! an RAII guard, so the slot is returned on every exit path including
//! panics and transfer failures.

use std::sync::{Condvar, Mutex};

/// Blocking counting gate with fixed capacity.
pub struct DownloadGate {
    capacity: usize,
    in_use: Mutex<usize>,
    freed: Condvar,
}

impl DownloadGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            in_use: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// Block until a slot is available, then take it.
    pub fn acquire(&self) -> GateGuard<'_> {
        let mut in_use = self.in_use.lock().unwrap();
        while *in_use >= self.capacity {
            in_use = self.freed.wait(in_use).unwrap();
        }
        *in_use += 1;
        GateGuard { gate: self }
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        *self.in_use.lock().unwrap()
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock().unwrap();
        *in_use = in_use.saturating_sub(1);
        self.freed.notify_one();
    }
}

/// Releases the gate slot when dropped.
pub struct GateGuard<'a> {
    gate: &'a DownloadGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
