//! Interning store for stack traces.
//!
//! Every allocation and free records the stack it came from, and most of
//! those stacks repeat. The cache keeps one copy of each distinct trace in
//! bump-allocated pages and hands out handles to the shared copy. Records
//! are never freed on their own; they live until the cache is dropped.
//!
//! A record occupies `HEADER_WORDS + max_num_frames` words of a page:
//!
//! ```text
//! [stack_id][num_frames][max_frames][frame 0][frame 1]...
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::api::config::StackCacheConfig;
use crate::diagnostics::Logger;
use crate::shadow::{markers, Shadow};
use crate::sync::mutex::Mutex;
use crate::util::layout::{align_down, align_up, GRANULE_SIZE};
use crate::util::size::{format_bytes, mb};

use super::capture::{StackCapture, StackId};

/// Size of one cache page in bytes.
pub const CACHE_PAGE_SIZE: usize = mb(1);

const PAGE_WORDS: usize = CACHE_PAGE_SIZE / std::mem::size_of::<usize>();

/// Handle to an interned stack trace.
///
/// Valid for as long as the cache it came from.
#[derive(Clone, Copy)]
pub struct CachedStack<'c> {
    record: NonNull<usize>,
    _cache: PhantomData<&'c StackCaptureCache>,
}

impl<'c> CachedStack<'c> {
    /// Hash of the trace.
    pub fn stack_id(&self) -> StackId {
        StackId(self.word(0) as u32)
    }

    /// Number of frames in the trace.
    pub fn num_frames(&self) -> usize {
        self.word(1)
    }

    /// Frame capacity of the record.
    pub fn max_frames(&self) -> usize {
        self.word(2)
    }

    /// The frames, innermost first.
    pub fn frames(&self) -> &'c [usize] {
        // SAFETY: the record holds `num_frames` initialized frames after its
        // header and lives as long as the cache.
        unsafe {
            std::slice::from_raw_parts(
                self.record.as_ptr().add(StackCapture::HEADER_WORDS),
                self.num_frames(),
            )
        }
    }

    /// Copy the trace out into an owned capture.
    pub fn to_capture(&self) -> StackCapture {
        let mut capture = StackCapture::with_max_frames(self.max_frames().max(1));
        if self.num_frames() > 0 {
            capture.init_from_frames(self.stack_id(), self.frames());
        }
        capture
    }

    /// Address of the record, for storage in block headers.
    pub fn as_raw(&self) -> usize {
        self.record.as_ptr() as usize
    }

    fn word(&self, index: usize) -> usize {
        // SAFETY: the header words are always initialized.
        unsafe { *self.record.as_ptr().add(index) }
    }
}

impl PartialEq for CachedStack<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record
    }
}

impl Eq for CachedStack<'_> {}

impl fmt::Debug for CachedStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStack")
            .field("stack_id", &self.stack_id())
            .field("num_frames", &self.num_frames())
            .finish()
    }
}

/// Counters kept by the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Save requests.
    pub total_allocations: u64,
    /// Save requests answered by an existing record.
    pub cached_allocations: u64,
    /// Distinct traces stored.
    pub unique_stacks: usize,
    /// Pages allocated.
    pub pages: usize,
    /// Frames handed out across every request.
    pub frames_stored: u64,
    /// Frames actually held in records.
    pub frames_alive: u64,
}

impl CacheStatistics {
    /// Share of requests served from the cache, in `[0, 1]`.
    pub fn compression_ratio(&self) -> f64 {
        if self.total_allocations == 0 {
            return 0.0;
        }
        self.cached_allocations as f64 / self.total_allocations as f64
    }

    /// Bytes of page storage in use.
    pub fn cache_size(&self) -> usize {
        self.pages * CACHE_PAGE_SIZE
    }
}

impl fmt::Display for CacheStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stack cache size={}; Compression={:.2}%; Entries={}; Requests={}; Frames stored={}; Frames alive={}",
            format_bytes(self.cache_size()),
            100.0 * self.compression_ratio(),
            self.unique_stacks,
            self.total_allocations,
            self.frames_stored,
            self.frames_alive,
        )
    }
}

/// One page of record storage.
///
/// The page is owned through `base` alone so every record pointer derives
/// from the same allocation; no reference to the page data is ever formed.
struct CachePage {
    base: NonNull<usize>,
    words_used: usize,
}

impl CachePage {
    fn new() -> Self {
        let data: &mut [usize] = Box::leak(vec![0usize; PAGE_WORDS].into_boxed_slice());
        Self {
            base: NonNull::from(data).cast::<usize>(),
            words_used: 0,
        }
    }

    fn next_record(&mut self, words: usize) -> Option<NonNull<usize>> {
        if self.words_used + words > PAGE_WORDS {
            return None;
        }
        // SAFETY: `words_used + words <= PAGE_WORDS`, so the record lies in
        // the page and the offset pointer is non-null.
        let record = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.words_used)) };
        self.words_used += words;
        Some(record)
    }

    fn byte_range(&self) -> (usize, usize) {
        let start = self.base.as_ptr() as usize;
        let end = start + PAGE_WORDS * std::mem::size_of::<usize>();
        (align_up(start, GRANULE_SIZE), align_down(end, GRANULE_SIZE))
    }
}

impl Drop for CachePage {
    fn drop(&mut self) {
        // SAFETY: `base` came from a leaked `Box<[usize]>` of PAGE_WORDS words
        // and handles cannot outlive the cache owning this page.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                PAGE_WORDS,
            )));
        }
    }
}

struct CacheInner {
    pages: Vec<CachePage>,
    known_stacks: HashMap<StackId, Vec<NonNull<usize>>>,
    stats: CacheStatistics,
}

/// Deduplicating store of stack traces.
pub struct StackCaptureCache {
    config: StackCacheConfig,
    logger: Arc<dyn Logger>,
    shadow: Option<Arc<Shadow>>,
    inner: Mutex<CacheInner>,
}

// SAFETY: records are only written under the lock and never moved or freed
// before the cache is dropped.
unsafe impl Send for StackCaptureCache {}
unsafe impl Sync for StackCaptureCache {}

impl StackCaptureCache {
    /// Create a cache reporting to `logger`.
    pub fn new(config: StackCacheConfig, logger: Arc<dyn Logger>) -> Self {
        Self::build(config, logger, None)
    }

    /// Create a cache whose pages are marked as runtime memory in `shadow`.
    pub fn with_shadow(config: StackCacheConfig, logger: Arc<dyn Logger>, shadow: Arc<Shadow>) -> Self {
        Self::build(config, logger, Some(shadow))
    }

    fn build(config: StackCacheConfig, logger: Arc<dyn Logger>, shadow: Option<Arc<Shadow>>) -> Self {
        debug_assert!(config.max_num_frames > 0);
        let cache = Self {
            config,
            logger,
            shadow,
            inner: Mutex::new(CacheInner {
                pages: Vec::new(),
                known_stacks: HashMap::new(),
                stats: CacheStatistics::default(),
            }),
        };
        {
            let mut inner = cache.inner.lock();
            cache.push_page(&mut inner);
        }
        cache
    }

    /// Depth cap of stored traces.
    pub fn max_num_frames(&self) -> usize {
        self.config.max_num_frames
    }

    /// The configuration this cache was built with.
    pub fn config(&self) -> &StackCacheConfig {
        &self.config
    }

    /// Intern a trace, returning the shared copy.
    ///
    /// Frames beyond [`StackCaptureCache::max_num_frames`] are dropped.
    pub fn save_stack_trace(&self, stack_id: StackId, frames: &[usize]) -> CachedStack<'_> {
        debug_assert!(!frames.is_empty());
        let frames = &frames[..frames.len().min(self.config.max_num_frames)];

        let (record, report) = {
            let mut inner = self.inner.lock();
            inner.stats.total_allocations += 1;
            inner.stats.frames_stored += frames.len() as u64;

            let existing = inner.known_stacks.get(&stack_id).and_then(|records| {
                records
                    .iter()
                    .copied()
                    .find(|&record| Self::record(record).frames() == frames)
            });

            let record = match existing {
                Some(record) => {
                    inner.stats.cached_allocations += 1;
                    record
                }
                None => {
                    let record = self.allocate_record(&mut inner);
                    // SAFETY: the record spans HEADER_WORDS + max_num_frames
                    // words of a live page, and the lock is held.
                    unsafe {
                        let words = record.as_ptr();
                        *words = stack_id.0 as usize;
                        *words.add(1) = frames.len();
                        *words.add(2) = self.config.max_num_frames;
                        std::ptr::copy_nonoverlapping(
                            frames.as_ptr(),
                            words.add(StackCapture::HEADER_WORDS),
                            frames.len(),
                        );
                    }
                    inner.known_stacks.entry(stack_id).or_default().push(record);
                    inner.stats.unique_stacks += 1;
                    inner.stats.frames_alive += frames.len() as u64;
                    record
                }
            };

            let period = self.config.compression_reporting_period as u64;
            let report = (period != 0 && inner.stats.total_allocations % period == 0)
                .then_some(inner.stats);
            (record, report)
        };

        if let Some(stats) = report {
            self.log_statistics_impl(&stats);
        }

        Self::record(record)
    }

    /// Intern an owned capture.
    pub fn save_capture(&self, capture: &StackCapture) -> CachedStack<'_> {
        self.save_stack_trace(capture.stack_id(), capture.frames())
    }

    /// Capture the calling thread's stack and intern it.
    ///
    /// Returns `None` if no frame survived the configured skipping.
    #[inline(never)]
    pub fn capture_current_stack(&self) -> Option<CachedStack<'_>> {
        let mut capture = StackCapture::with_max_frames(self.config.max_num_frames);
        capture.init_from_current_stack(self.config.bottom_frames_to_skip);
        (!capture.is_empty()).then(|| self.save_capture(&capture))
    }

    /// Rebuild a handle from [`CachedStack::as_raw`].
    ///
    /// # Safety
    ///
    /// `raw` must be zero or come from a handle issued by this cache.
    pub unsafe fn stack_from_raw(&self, raw: usize) -> Option<CachedStack<'_>> {
        NonNull::new(raw as *mut usize).map(Self::record)
    }

    /// Snapshot of the counters.
    pub fn statistics(&self) -> CacheStatistics {
        self.inner.lock().stats
    }

    /// `cached_allocations / total_allocations`.
    pub fn compression_ratio(&self) -> f64 {
        self.statistics().compression_ratio()
    }

    /// Report the counters through the logger.
    pub fn log_statistics(&self) {
        let stats = self.statistics();
        self.log_statistics_impl(&stats);
    }

    fn log_statistics_impl(&self, stats: &CacheStatistics) {
        self.logger
            .write(&format!("PID={}; {}\n", std::process::id(), stats));
    }

    fn record<'c>(record: NonNull<usize>) -> CachedStack<'c> {
        CachedStack {
            record,
            _cache: PhantomData,
        }
    }

    fn allocate_record(&self, inner: &mut CacheInner) -> NonNull<usize> {
        let words = StackCapture::HEADER_WORDS + self.config.max_num_frames;
        if let Some(record) = inner.pages.last_mut().and_then(|page| page.next_record(words)) {
            return record;
        }
        match self.push_page(inner).next_record(words) {
            Some(record) => record,
            None => unreachable!("stack record larger than a cache page"),
        }
    }

    fn push_page<'i>(&self, inner: &'i mut CacheInner) -> &'i mut CachePage {
        let page = CachePage::new();
        if let Some(shadow) = &self.shadow {
            let (start, end) = page.byte_range();
            shadow.poison_with(start, end - start, markers::ASAN_MEMORY);
        }
        inner.pages.push(page);
        inner.stats.pages = inner.pages.len();
        log::debug!("stack cache grew to {} pages", inner.pages.len());

        let last = inner.pages.len() - 1;
        &mut inner.pages[last]
    }
}

impl Drop for StackCaptureCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(shadow) = &self.shadow {
            for page in &inner.pages {
                let (start, end) = page.byte_range();
                shadow.unpoison(start, end - start);
            }
        }
        inner.pages.clear();
        inner.known_stacks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingLogger;
    use crate::shadow::ShadowConfig;
    use crate::stack::MAX_NUM_FRAMES;

    fn cache_with(config: StackCacheConfig) -> (StackCaptureCache, Arc<CollectingLogger>) {
        let logger = Arc::new(CollectingLogger::new());
        (StackCaptureCache::new(config, logger.clone()), logger)
    }

    #[test]
    fn test_identical_traces_are_interned() {
        let (cache, _) = cache_with(StackCacheConfig::default());
        let frames = [0x1000, 0x2000, 0x3000];

        let first = cache.save_stack_trace(StackId(42), &frames);
        let second = cache.save_stack_trace(StackId(42), &frames);

        assert_eq!(first, second);
        assert_eq!(first.frames(), &frames);
        assert_eq!(first.stack_id(), StackId(42));

        let stats = cache.statistics();
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.cached_allocations, 1);
        assert_eq!(stats.unique_stacks, 1);
        assert!((cache.compression_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_earlier_records_survive_later_saves() {
        let (cache, _) = cache_with(StackCacheConfig::default());

        let first = cache.save_stack_trace(StackId(1), &[1, 2]);
        let second = cache.save_stack_trace(StackId(2), &[3, 4]);

        assert_eq!(first.frames(), &[1, 2]);
        assert_eq!(first.num_frames(), 2);
        assert_eq!(first.max_frames(), MAX_NUM_FRAMES);
        assert_eq!(second.frames(), &[3, 4]);

        let restored = unsafe { cache.stack_from_raw(first.as_raw()) }.unwrap();
        assert_eq!(restored.stack_id(), StackId(1));
        assert_eq!(restored.frames(), &[1, 2]);
    }

    #[test]
    fn test_hash_collision_keeps_both() {
        let (cache, _) = cache_with(StackCacheConfig::default());

        let a = cache.save_stack_trace(StackId(1), &[0x10, 0x20]);
        let b = cache.save_stack_trace(StackId(1), &[0x10, 0x30]);

        assert_ne!(a, b);
        assert_eq!(b.frames(), &[0x10, 0x30]);
        assert_eq!(cache.statistics().cached_allocations, 0);
    }

    #[test]
    fn test_frames_truncated_to_max() {
        let config = StackCacheConfig {
            max_num_frames: 2,
            ..Default::default()
        };
        let (cache, _) = cache_with(config);

        let stack = cache.save_stack_trace(StackId(5), &[1, 2, 3, 4]);
        assert_eq!(stack.frames(), &[1, 2]);
        assert_eq!(stack.max_frames(), 2);
    }

    #[test]
    fn test_grows_new_pages() {
        let (cache, _) = cache_with(StackCacheConfig::default());
        let per_page = PAGE_WORDS / (StackCapture::HEADER_WORDS + MAX_NUM_FRAMES);

        let handles: Vec<_> = (0..per_page + 1)
            .map(|i| cache.save_stack_trace(StackId(i as u32), &[i + 1]))
            .collect();

        assert_eq!(cache.statistics().pages, 2);
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.frames(), &[i + 1]);
        }
    }

    #[test]
    fn test_raw_round_trip() {
        let (cache, _) = cache_with(StackCacheConfig::default());
        let stack = cache.save_stack_trace(StackId(9), &[0xAA]);

        let restored = unsafe { cache.stack_from_raw(stack.as_raw()) }.unwrap();
        assert_eq!(restored, stack);
        assert!(unsafe { cache.stack_from_raw(0) }.is_none());

        let owned = restored.to_capture();
        assert_eq!(owned.frames(), &[0xAA]);
        assert_eq!(owned.stack_id(), StackId(9));
    }

    #[test]
    fn test_periodic_reporting() {
        let config = StackCacheConfig {
            compression_reporting_period: 3,
            ..Default::default()
        };
        let (cache, logger) = cache_with(config);

        for _ in 0..2 {
            cache.save_stack_trace(StackId(3), &[3]);
        }
        assert!(logger.messages().is_empty());

        cache.save_stack_trace(StackId(3), &[3]);
        assert_eq!(logger.messages().len(), 1);
        assert!(logger.contains("Compression=66.67%"));
    }

    #[test]
    fn test_pages_marked_in_shadow() {
        let shadow = Arc::new(Shadow::new(ShadowConfig::default()));
        let logger = Arc::new(CollectingLogger::new());
        let cache = StackCaptureCache::with_shadow(StackCacheConfig::default(), logger, shadow.clone());

        let stack = cache.save_stack_trace(StackId(1), &[0x1234]);
        let addr = stack.as_raw();
        assert_eq!(shadow.marker_for_address(addr), markers::ASAN_MEMORY);

        drop(cache);
        assert!(shadow.is_accessible(addr));
    }

    #[test]
    fn test_capture_current_stack() {
        let (cache, _) = cache_with(StackCacheConfig::default());
        let stack = cache.capture_current_stack().unwrap();
        assert!(stack.num_frames() > 0);
    }

    #[test]
    fn test_concurrent_saves() {
        let (cache, _) = cache_with(StackCacheConfig::default());
        let cache = Arc::new(cache);

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100usize {
                        cache.save_stack_trace(StackId(i as u32), &[i, i + 1]);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let stats = cache.statistics();
        assert_eq!(stats.total_allocations, 400);
        assert_eq!(stats.unique_stacks, 100);
        assert_eq!(stats.cached_allocations, 300);
    }
}
