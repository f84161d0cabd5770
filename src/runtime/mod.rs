//! The runtime: shared shadow, stack cache, heap list and error reporting.
//!
//! A [`Runtime`] is built once from a [`RuntimeConfig`]. It owns the shadow
//! memory and the stack cache, creates heap proxies that share them, and
//! turns a failed access check or a bad free into a classified
//! [`AsanErrorInfo`] handed to the logger and the error callback.

mod error_info;
mod report;

use std::sync::Arc;

use crate::api::config::RuntimeConfig;
use crate::diagnostics::{LogLogger, Logger};
use crate::heap_proxy::{BadAccessKind, HeapFlags, HeapProxy};
use crate::shadow::{markers, Shadow};
use crate::stack::{StackCapture, StackCaptureCache, StackId};
use crate::sync::mutex::{Mutex, RwLock};

pub use error_info::{AccessMode, AsanErrorInfo, CpuContext};
pub use report::render_description;

/// Callback invoked once per reported error.
pub type ErrorCallback = Arc<dyn Fn(&mut AsanErrorInfo) + Send + Sync>;

fn default_error_callback(info: &mut AsanErrorInfo) {
    panic!("{}", info.summary());
}

/// Process-level coordinator of the heap checker.
pub struct Runtime {
    config: RuntimeConfig,
    shadow: Arc<Shadow>,
    stack_cache: Arc<StackCaptureCache>,
    logger: Arc<dyn Logger>,
    heaps: Mutex<Vec<Arc<HeapProxy>>>,
    error_callback: RwLock<ErrorCallback>,
}

impl Runtime {
    /// Start a runtime reporting through the `log` facade.
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_logger(config, Arc::new(LogLogger))
    }

    /// Start a runtime reporting to `logger`.
    pub fn with_logger(config: RuntimeConfig, logger: Arc<dyn Logger>) -> Self {
        let shadow = Arc::new(Shadow::new(config.shadow));
        let stack_cache = Arc::new(StackCaptureCache::with_shadow(
            config.stack_cache_config(),
            logger.clone(),
            shadow.clone(),
        ));

        log::info!(
            "shadowheap runtime set up (quarantine {} bytes, {} frames per stack)",
            config.quarantine_size,
            stack_cache.max_num_frames()
        );

        let error_callback: ErrorCallback = Arc::new(default_error_callback);
        Self {
            config,
            shadow,
            stack_cache,
            logger,
            heaps: Mutex::new(Vec::new()),
            error_callback: RwLock::new(error_callback),
        }
    }

    /// Start a runtime configured from `SHADOWHEAP_OPTIONS`.
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    /// The configuration in effect.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The shared shadow memory.
    pub fn shadow(&self) -> &Arc<Shadow> {
        &self.shadow
    }

    /// The shared stack cache.
    pub fn stack_cache(&self) -> &Arc<StackCaptureCache> {
        &self.stack_cache
    }

    /// The report sink.
    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    /// Replace the error callback.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&mut AsanErrorInfo) + Send + Sync + 'static,
    {
        *self.error_callback.write() = Arc::new(callback);
    }

    /// Create a heap proxy and register it.
    pub fn create_heap(&self) -> Arc<HeapProxy> {
        let heap = Arc::new(HeapProxy::new(
            self.config.heap_config(),
            self.shadow.clone(),
            self.stack_cache.clone(),
        ));
        self.add_heap(heap.clone());
        heap
    }

    /// Unregister a heap and release all of its blocks.
    ///
    /// Returns false if it was not registered or still had live blocks.
    pub fn destroy_heap(&self, heap: &Arc<HeapProxy>) -> bool {
        let registered = self.remove_heap(heap);
        let clean = heap.destroy();
        registered && clean
    }

    /// Register a heap for error diagnosis.
    pub fn add_heap(&self, heap: Arc<HeapProxy>) {
        self.heaps.lock().push(heap);
    }

    /// Unregister a heap. Returns false if it was not registered.
    pub fn remove_heap(&self, heap: &Arc<HeapProxy>) -> bool {
        let mut heaps = self.heaps.lock();
        match heaps.iter().position(|h| Arc::ptr_eq(h, heap)) {
            Some(index) => {
                heaps.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of registered heaps.
    pub fn heap_count(&self) -> usize {
        self.heaps.lock().len()
    }

    /// Free through `heap`, reporting a rejected free as a double free.
    ///
    /// # Safety
    ///
    /// Same contract as [`HeapProxy::free`].
    pub unsafe fn heap_free(&self, heap: &HeapProxy, flags: HeapFlags, ptr: *mut u8) -> bool {
        if heap.free(flags, ptr) {
            return true;
        }

        let mut info = AsanErrorInfo::new(ptr as usize, AccessMode::Unknown, 0);
        info.context = CpuContext::capture();
        info.error_type = BadAccessKind::DoubleFree;
        info.crash_stack_id = self.crash_stack_id();
        heap.get_bad_access_information(&mut info);
        self.attach_shadow_memory(&mut info);
        self.on_error(&mut info);
        false
    }

    /// Check an access of `size` bytes at `addr`, reporting it if either end
    /// of the range is not addressable. Returns true if the access is valid.
    ///
    /// The reported location is the first bad byte: `addr` if it is bad,
    /// otherwise the last byte of the access. The reported size stays
    /// `size`.
    pub fn check_access(&self, addr: usize, mode: AccessMode, size: usize) -> bool {
        let size = size.max(1);
        let last = addr.saturating_add(size - 1);
        let bad = if !self.shadow.is_accessible(addr) {
            addr
        } else if !self.shadow.is_accessible(last) {
            last
        } else {
            return true;
        };
        self.report_bad_memory_access(bad, mode, size);
        false
    }

    /// Check every byte of `[addr, addr + size)`, reporting the first bad
    /// one. Returns true if the whole range is addressable.
    pub fn check_range(&self, addr: usize, mode: AccessMode, size: usize) -> bool {
        match (addr..addr.saturating_add(size)).find(|&a| !self.shadow.is_accessible(a)) {
            Some(bad) => {
                self.report_bad_memory_access(bad, mode, 1);
                false
            }
            None => true,
        }
    }

    /// Whether errors raised from `stack_id` are suppressed.
    pub fn should_ignore_error(&self, stack_id: StackId) -> bool {
        self.config.ignored_stack_ids.contains(&stack_id)
    }

    /// Classify and report a bad access at `location`.
    #[inline(never)]
    pub fn report_bad_memory_access(&self, location: usize, mode: AccessMode, size: usize) {
        let crash_stack_id = self.crash_stack_id();
        if self.should_ignore_error(crash_stack_id) {
            log::debug!("ignoring error at 0x{:08x} from stack {}", location, crash_stack_id);
            return;
        }

        let mut info = AsanErrorInfo::new(location, mode, size);
        info.context = CpuContext::capture();
        info.crash_stack_id = crash_stack_id;
        self.get_bad_access_information(&mut info);
        self.on_error(&mut info);
    }

    /// Classify `info.location` and fill in its block details.
    pub fn get_bad_access_information(&self, info: &mut AsanErrorInfo) {
        let marker = self.shadow.marker_for_address(info.location);
        if !self.shadow.is_in_range(info.location) || marker == markers::ASAN_MEMORY {
            info.error_type = BadAccessKind::WildAccess;
        } else if marker == markers::INVALID_ADDRESS {
            info.error_type = BadAccessKind::InvalidAddress;
        } else {
            let heaps = self.heaps.lock();
            for heap in heaps.iter() {
                if heap.get_bad_access_information(info) {
                    break;
                }
            }
        }
        self.attach_shadow_memory(info);
    }

    /// Report an error: text report, minidump, exit, then the callback,
    /// each as configured.
    pub fn on_error(&self, info: &mut AsanErrorInfo) {
        if self.config.log_as_text {
            report::write_report(self.logger.as_ref(), info);
        }

        if self.config.minidump_on_failure {
            self.logger.save_mini_dump(info);
        }

        if self.config.exit_on_failure {
            log::error!("{}; exiting", info.summary());
            std::process::exit(1);
        }

        let callback = self.error_callback.read().clone();
        callback(info);
    }

    /// Log the stack cache's compression statistics.
    pub fn log_statistics(&self) {
        self.stack_cache.log_statistics();
    }

    fn attach_shadow_memory(&self, info: &mut AsanErrorInfo) {
        if info.error_type.is_heap_error() && info.shadow_memory.is_empty() {
            info.shadow_memory = self.shadow.shadow_memory_text(info.location);
        }
    }

    #[inline(never)]
    fn crash_stack_id(&self) -> StackId {
        let mut stack = StackCapture::with_max_frames(self.stack_cache.max_num_frames());
        stack.init_from_current_stack_relative(self.config.bottom_frames_to_skip);
        stack.stack_id()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let heaps = self.heaps.get_mut();
        if !heaps.is_empty() {
            log::warn!("runtime torn down with {} registered heaps", heaps.len());
        }
        heaps.clear();
        if self.config.compression_reporting_period != 0 {
            self.stack_cache.log_statistics();
        }
        log::info!("shadowheap runtime torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingLogger;
    use crate::util::size::kb;

    fn runtime_with(config: RuntimeConfig) -> (Runtime, Arc<CollectingLogger>, Arc<Mutex<Vec<AsanErrorInfo>>>) {
        let logger = Arc::new(CollectingLogger::new());
        let runtime = Runtime::with_logger(config, logger.clone());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        runtime.set_error_callback(move |info| sink.lock().push(info.clone()));
        (runtime, logger, errors)
    }

    fn runtime() -> (Runtime, Arc<CollectingLogger>, Arc<Mutex<Vec<AsanErrorInfo>>>) {
        runtime_with(RuntimeConfig::minimal())
    }

    #[test]
    fn test_heap_registration() {
        let (runtime, _, _) = runtime();
        let a = runtime.create_heap();
        let b = runtime.create_heap();
        assert_eq!(runtime.heap_count(), 2);

        assert!(runtime.destroy_heap(&a));
        assert!(!runtime.remove_heap(&a));
        assert_eq!(runtime.heap_count(), 1);

        let ptr = b.alloc(HeapFlags::NONE, 4);
        assert!(!runtime.destroy_heap(&b));
        assert_eq!(runtime.heap_count(), 0);
        let _ = ptr;
    }

    #[test]
    fn test_overflow_is_reported() {
        let (runtime, logger, errors) = runtime();
        let heap = runtime.create_heap();
        let ptr = heap.alloc(HeapFlags::NONE, 10) as usize;

        assert!(runtime.check_access(ptr, AccessMode::Read, 8));
        assert!(!runtime.check_access(ptr + 8, AccessMode::Write, 4));

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        let info = &errors[0];
        assert_eq!(info.error_type, BadAccessKind::HeapBufferOverflow);
        assert_eq!(info.location, ptr + 11);
        assert_eq!(info.access_size, 4);
        assert_eq!(info.access_mode, AccessMode::Write);
        assert!(info.alloc_stack.is_some());
        assert!(info.shadow_memory.contains("=>"));
        assert!(logger.contains("heap-buffer-overflow"));
        assert!(logger.contains("WRITE of size 4"));
    }

    #[test]
    fn test_bad_start_is_reported_at_start() {
        let (runtime, _, errors) = runtime();
        let heap = runtime.create_heap();
        let ptr = heap.alloc(HeapFlags::NONE, 16) as usize;

        assert!(!runtime.check_access(ptr - 2, AccessMode::Read, 4));

        let errors = errors.lock();
        assert_eq!(errors[0].location, ptr - 2);
        assert_eq!(errors[0].access_size, 4);
        assert_eq!(errors[0].error_type, BadAccessKind::HeapBufferUnderflow);
    }

    #[test]
    fn test_use_after_free_is_reported() {
        let (runtime, logger, errors) = runtime();
        let heap = runtime.create_heap();
        let ptr = heap.alloc(HeapFlags::NONE, 16) as usize;
        unsafe { heap.free(HeapFlags::NONE, ptr as *mut u8) };

        assert!(!runtime.check_access(ptr, AccessMode::Read, 1));
        let errors = errors.lock();
        assert_eq!(errors[0].error_type, BadAccessKind::UseAfterFree);
        assert!(errors[0].free_stack.is_some());
        assert!(logger.contains("freed by thread"));
    }

    #[test]
    fn test_double_free_is_reported() {
        let (runtime, _, errors) = runtime();
        let heap = runtime.create_heap();
        let ptr = heap.alloc(HeapFlags::NONE, 16);

        unsafe {
            assert!(runtime.heap_free(&heap, HeapFlags::NONE, ptr));
            assert!(!runtime.heap_free(&heap, HeapFlags::NONE, ptr));
        }

        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, BadAccessKind::DoubleFree);
        assert_eq!(errors[0].location, ptr as usize);
        assert!(heap.in_quarantine(ptr));
    }

    #[test]
    fn test_invalid_and_wild_addresses() {
        let (runtime, _, errors) = runtime();
        runtime.check_access(16, AccessMode::Read, 1);
        runtime.report_bad_memory_access(usize::MAX, AccessMode::Read, 1);

        let stack = runtime.stack_cache().save_stack_trace(StackId(1), &[1]);
        runtime.check_access(stack.as_raw(), AccessMode::Write, 4);

        let errors = errors.lock();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].error_type, BadAccessKind::InvalidAddress);
        assert_eq!(errors[1].error_type, BadAccessKind::WildAccess);
        assert_eq!(errors[2].error_type, BadAccessKind::WildAccess);
    }

    #[test]
    fn test_unattributed_address_is_unknown() {
        let (runtime, _, errors) = runtime();
        let location = 1usize << 40;
        runtime.shadow().poison(location, 8);
        runtime.check_access(location, AccessMode::Read, 1);
        assert_eq!(errors.lock()[0].error_type, BadAccessKind::Unknown);
    }

    #[inline(never)]
    fn report_invalid_access(runtime: &Runtime) {
        runtime.report_bad_memory_access(16, AccessMode::Read, 1);
    }

    #[test]
    fn test_ignored_stack_ids() {
        let mut ignored = None;
        for _ in 0..2 {
            let config = match ignored {
                Some(id) => RuntimeConfig::minimal().with_ignored_stack_id(id),
                None => RuntimeConfig::minimal(),
            };
            let (runtime, _, errors) = runtime_with(config);
            report_invalid_access(&runtime);

            let errors = errors.lock();
            match ignored {
                None => {
                    assert_eq!(errors.len(), 1);
                    ignored = Some(errors[0].crash_stack_id);
                }
                Some(id) => {
                    assert!(runtime.should_ignore_error(id));
                    assert!(errors.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_quiet_and_minidump_options() {
        let config = RuntimeConfig::minimal()
            .with_log_as_text(false)
            .with_minidump_on_failure(true);
        let (runtime, logger, errors) = runtime_with(config);

        runtime.check_access(16, AccessMode::Read, 1);
        assert!(logger.messages().is_empty());
        assert_eq!(logger.mini_dumps(), vec![16]);
        assert_eq!(errors.lock().len(), 1);
    }

    #[test]
    #[should_panic(expected = "shadowheap error: invalid-address")]
    fn test_default_callback_panics() {
        let runtime = Runtime::with_logger(RuntimeConfig::minimal(), Arc::new(CollectingLogger::new()));
        runtime.check_access(16, AccessMode::Read, 1);
    }

    #[test]
    fn test_check_range_finds_first_bad_byte() {
        let (runtime, _, errors) = runtime();
        let heap = runtime.create_heap();
        let ptr = heap.alloc(HeapFlags::NONE, 20) as usize;

        assert!(runtime.check_range(ptr, AccessMode::Read, 20));
        assert!(!runtime.check_range(ptr, AccessMode::Read, kb(1)));
        assert_eq!(errors.lock()[0].location, ptr + 20);
    }
}
