use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it. State guarded here stays consistent between statements, so a
/// poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
