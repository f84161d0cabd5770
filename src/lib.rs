//! # shadowheap
//!
//! Shadow-memory heap checker: detects heap buffer overflows, underflows,
//! use-after-free and double frees.
//!
//! ## Features
//!
//! - Byte-per-granule shadow memory over the monitored address range
//! - Heap proxy surrounding every block with poisoned redzones
//! - FIFO quarantine delaying reuse of freed blocks
//! - Interned allocation and free stack traces
//! - Classified error reports with shadow dumps
//! - Checked entry points for instrumented accesses and memory/string routines
//!
//! ## Quick Start
//!
//! ```rust
//! use shadowheap::{AccessMode, BadAccessKind, HeapFlags, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::minimal());
//! runtime.set_error_callback(|info| {
//!     assert_eq!(info.error_type, BadAccessKind::HeapBufferOverflow);
//! });
//!
//! let heap = runtime.create_heap();
//! let ptr = heap.alloc(HeapFlags::NONE, 10) as usize;
//! assert!(runtime.check_access(ptr, AccessMode::Write, 10));
//! assert!(!runtime.check_access(ptr + 10, AccessMode::Read, 1));
//!
//! assert!(unsafe { runtime.heap_free(&heap, HeapFlags::NONE, ptr as *mut u8) });
//! runtime.destroy_heap(&heap);
//! ```

pub mod allocators;
pub mod api;
pub mod diagnostics;
pub mod heap_proxy;
pub mod rtl;
pub mod runtime;
pub mod shadow;
pub mod stack;

mod core;
mod sync;
mod util;

#[cfg(feature = "debug")]
pub mod debug;

pub use allocators::{HeapInformationClass, HeapWalkEntry, RawHeap, SystemHeap};
pub use api::config::{ConfigError, HeapConfig, RuntimeConfig, StackCacheConfig};
pub use api::stats::HeapStats;
pub use diagnostics::{CollectingLogger, LogLogger, Logger, StderrLogger};
pub use heap_proxy::{BadAccessKind, BlockInfo, BlockState, HeapFlags, HeapProxy};
pub use runtime::{AccessMode, AsanErrorInfo, CpuContext, ErrorCallback, Runtime};
pub use shadow::{Shadow, ShadowConfig};
pub use stack::{CacheStatistics, CachedStack, StackCapture, StackCaptureCache, StackId};
