// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitives whose methods panic rather than returning an error on
//! poison.
//!
//! Release builds run with panic=abort, so a poisoned lock can only be
//! observed after the process is already doomed. Codifying that here keeps
//! `.lock().unwrap()` noise out of the rest of the driver and keeps unwrap
//! stigmatized for actual error handling.

use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

static MUTEX_POISONED: &str = "mutex is poisoned";
static CONDVAR_POISONED: &str = "condvar is poisoned";

/// A mutual exclusion primitive mirroring `std::sync::Mutex`, minus poison.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.std.into_inner().expect(MUTEX_POISONED)
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        self.std.lock().expect(MUTEX_POISONED)
    }

    /// Attempts to acquire the lock without blocking. Returns `None` if the
    /// lock is currently held by another thread.
    ///
    /// The presentation queue relies on this to avoid a lock-ordering
    /// deadlock: it must not block on a queue lock while holding a surface
    /// lock that the queue thread itself may be waiting for.
    pub fn try_lock(&self) -> Option<MutexGuard<T>> {
        match self.std.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(_)) => panic!("{}", MUTEX_POISONED),
        }
    }
}

/// A condition variable mirroring `std::sync::Condvar`, minus poison.
#[derive(Default)]
pub struct Condvar {
    std: StdCondvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            std: StdCondvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.std.wait(guard).expect(CONDVAR_POISONED)
    }

    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.std.wait_timeout(guard, dur).expect(CONDVAR_POISONED)
    }

    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.std
            .wait_while(guard, condition)
            .expect(CONDVAR_POISONED)
    }

    pub fn notify_one(&self) {
        self.std.notify_one();
    }

    pub fn notify_all(&self) {
        self.std.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_contended() {
        let m = Mutex::new(1u32);
        let held = m.lock();
        assert!(m.try_lock().is_none());
        drop(held);
        assert_eq!(*m.try_lock().unwrap(), 1);
    }
}
