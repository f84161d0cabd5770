//! Stack capture and interning.

mod cache;
mod capture;

pub use cache::{CacheStatistics, CachedStack, StackCaptureCache, CACHE_PAGE_SIZE};
pub use capture::{compute_stack_id, StackCapture, StackId, MAX_NUM_FRAMES};
