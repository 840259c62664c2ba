//! Lock helpers.
//!
//! A poisoned lock means another thread panicked while mutating shared index
//! state; there is no way to continue safely, so these helpers panic too.

use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("lock poisoned")
}

#[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().expect("lock poisoned")
}

#[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().expect("lock poisoned")
}

#[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
pub fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).expect("lock poisoned")
}
