//! Text rendering of error reports.

use std::fmt::Write;

use super::error_info::{AccessMode, AsanErrorInfo};
use crate::diagnostics::Logger;

/// Headline plus access line.
pub fn render_description(info: &AsanErrorInfo) -> String {
    let mut output = info.summary();
    output.push('\n');
    if info.access_mode != AccessMode::Unknown {
        let _ = writeln!(
            output,
            "{} of size {} at 0x{:08x}",
            info.access_mode, info.access_size, info.location
        );
    }
    let _ = writeln!(
        output,
        "  pc 0x{:08x} sp 0x{:08x}",
        info.context.instruction_pointer, info.context.stack_pointer
    );
    output
}

/// Write the full report to `logger`.
pub fn write_report(logger: &dyn Logger, info: &AsanErrorInfo) {
    logger.write(&render_description(info));

    if !info.shadow_info.is_empty() {
        logger.write(&info.shadow_info);
    }
    if let Some(stack) = &info.free_stack {
        logger.write_with_stack_trace(
            &format!("freed by thread T{} here:\n", info.free_tid),
            stack.frames(),
        );
    }
    if let Some(stack) = &info.alloc_stack {
        logger.write_with_stack_trace(
            &format!("previously allocated by thread T{} here:\n", info.alloc_tid),
            stack.frames(),
        );
    }
    if info.error_type.is_heap_error() && !info.shadow_memory.is_empty() {
        logger.write(&info.shadow_memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingLogger;
    use crate::heap_proxy::BadAccessKind;
    use crate::stack::{StackCapture, StackId};

    #[test]
    fn test_access_line() {
        let info = AsanErrorInfo::new(0x2000, AccessMode::Read, 8);
        let text = render_description(&info);
        assert!(text.contains("READ of size 8 at 0x00002000"));

        let info = AsanErrorInfo::new(0x2000, AccessMode::Unknown, 0);
        assert!(!render_description(&info).contains("of size"));
    }

    #[test]
    fn test_full_report() {
        let mut stack = StackCapture::new();
        stack.init_from_frames(StackId(1), &[0xdead]);

        let mut info = AsanErrorInfo::new(0x3000, AccessMode::Write, 1);
        info.error_type = BadAccessKind::UseAfterFree;
        info.alloc_stack = Some(stack);
        info.free_stack = Some(stack);
        info.free_tid = 7;
        info.shadow_info = "where\n".into();
        info.shadow_memory = "dump\n".into();

        let logger = CollectingLogger::new();
        write_report(&logger, &info);

        let messages = logger.messages();
        assert_eq!(messages.len(), 5);
        assert!(messages[0].starts_with("shadowheap error: heap-use-after-free"));
        assert!(messages[2].starts_with("freed by thread T7 here:"));
        assert!(messages[2].contains("0x0000dead"));
        assert!(messages[3].starts_with("previously allocated"));
        assert_eq!(messages[4], "dump\n");
    }
}
