//! Small numeric thread identifiers.
//!
//! `std::thread::ThreadId` has no stable integer form, and block headers need
//! a plain integer. Each thread takes the next value from a global counter
//! the first time it asks.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Identifier of the calling thread. Never zero.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_stable_per_thread() {
        let a = current_thread_id();
        assert_ne!(a, 0);
        assert_eq!(a, current_thread_id());

        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(a, other);
    }
}
