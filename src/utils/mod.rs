pub mod handle;

pub use handle::{Handle, Pool};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, continuing with the inner value if a panicking thread
/// poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
