//! Shared register table for register-oriented device drivers.
//!
//! Models the Modbus-style holding-register store one equipment driver sits
//! on. The thread-safety contract:
//!
//! - reads return a point-in-time slice copy taken under a single lock
//! - writes are applied under the same lock
//! - read/write completion fires an observer notification *after* the lock
//!   is released
//!
//! Readers therefore never observe a partial write, and observers can react
//! to traffic without holding up the register owner. The wire encoding of the
//! underlying transport is not modelled here.

use crate::error::{AppResult, LabError};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Observer notification fired after a register operation completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterEvent {
    /// A slice `[start, start + count)` was read.
    Read {
        /// First register read.
        start: usize,
        /// Number of registers read.
        count: usize,
    },
    /// A slice `[start, start + count)` was written.
    Write {
        /// First register written.
        start: usize,
        /// Number of registers written.
        count: usize,
    },
}

/// Fixed-size table of 16-bit holding registers with post-release observer
/// notification.
#[derive(Debug)]
pub struct RegisterTable {
    registers: Mutex<Vec<u16>>,
    events: broadcast::Sender<RegisterEvent>,
}

impl RegisterTable {
    /// Create a zeroed table of `size` registers.
    pub fn new(size: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            registers: Mutex::new(vec![0; size]),
            events,
        }
    }

    /// Number of registers in the table.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when the table has no registers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to read/write completion notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegisterEvent> {
        self.events.subscribe()
    }

    /// Read a point-in-time copy of `[start, start + count)`.
    pub fn read(&self, start: usize, count: usize) -> AppResult<Vec<u16>> {
        let snapshot = {
            let guard = self.lock();
            let end = self.checked_end(&guard, start, count)?;
            guard[start..end].to_vec()
        };
        // Lock is released; now notify observers.
        let _ = self.events.send(RegisterEvent::Read { start, count });
        Ok(snapshot)
    }

    /// Write `values` starting at `start`, atomically with respect to readers.
    pub fn write(&self, start: usize, values: &[u16]) -> AppResult<()> {
        {
            let mut guard = self.lock();
            let end = self.checked_end(&guard, start, values.len())?;
            guard[start..end].copy_from_slice(values);
        }
        let _ = self.events.send(RegisterEvent::Write {
            start,
            count: values.len(),
        });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u16>> {
        // A poisoned lock still holds consistent data: every mutation is a
        // bounds-checked copy_from_slice.
        self.registers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn checked_end(&self, guard: &[u16], start: usize, count: usize) -> AppResult<usize> {
        let end = start
            .checked_add(count)
            .ok_or_else(|| LabError::Equipment("register range overflow".to_string()))?;
        if end > guard.len() {
            return Err(LabError::Equipment(format!(
                "register range [{start}, {end}) exceeds table size {}",
                guard.len()
            )));
        }
        Ok(end)
    }
}
