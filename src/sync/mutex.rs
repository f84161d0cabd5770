//! Lock types used throughout the crate.
//!
//! Thin re-export of parking_lot so call sites stay independent of the
//! lock implementation. `ReentrantMutex` backs the user-visible heap
//! lock, which must allow the locking thread to keep allocating.

pub use parking_lot::{const_rwlock, Mutex, ReentrantMutex, RwLock};
