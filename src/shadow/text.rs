//! Hex rendering of the shadow around a faulting address.

use std::fmt::Write;

use super::markers;
use super::Shadow;
use crate::util::layout::{align_down, GRANULE_SHIFT};

/// Shadow bytes shown per line.
const BYTES_PER_LINE: usize = 8;

/// Lines printed before and after the faulting line.
const CONTEXT_LINES: usize = 3;

const LEGEND: &[u8] = &[
    markers::HEAP_ADDRESSABLE,
    markers::HEAP_LEFT_REDZONE,
    markers::HEAP_RIGHT_REDZONE,
    markers::HEAP_FREED,
    markers::ASAN_MEMORY,
    markers::INVALID_ADDRESS,
    markers::HEAP_NON_ACCESSIBLE,
];

pub(super) fn append_shadow_memory_text(shadow: &Shadow, addr: usize, output: &mut String) {
    let index = addr >> GRANULE_SHIFT;
    let line_index = align_down(index, BYTES_PER_LINE);
    let span = CONTEXT_LINES * BYTES_PER_LINE;

    let first = line_index.saturating_sub(span);
    let last = (line_index + span).min(align_down(shadow.shadow_size() - 1, BYTES_PER_LINE));

    let _ = writeln!(output, "Shadow bytes around the buggy address:");

    let mut line = first;
    while line <= last {
        let marker = if line == line_index { "=>" } else { "  " };
        let _ = write!(output, "{}0x{:08x}:", marker, line << GRANULE_SHIFT);

        for i in line..line + BYTES_PER_LINE {
            let byte = shadow.marker_at(i);
            if i == index {
                let _ = write!(output, "[{:02x}]", byte);
            } else if i == index + 1 {
                let _ = write!(output, "{:02x}", byte);
            } else {
                let _ = write!(output, " {:02x}", byte);
            }
        }
        output.push('\n');
        line += BYTES_PER_LINE;
    }

    let _ = writeln!(output, "Shadow byte legend (one shadow byte represents 8 application bytes):");
    for &byte in LEGEND {
        let _ = writeln!(output, "  {:<32}{:02x}", markers::describe(byte), byte);
    }
    let _ = writeln!(output, "  {:<32}01 - 07", markers::describe(1));
}

#[cfg(test)]
mod tests {
    use super::super::ShadowConfig;
    use super::*;

    #[test]
    fn test_dump_marks_faulting_byte() {
        let shadow = Shadow::new(ShadowConfig::default());
        let addr = 1usize << 32;
        shadow.poison_with(addr, 64, markers::HEAP_FREED);

        let text = shadow.shadow_memory_text(addr + 8);
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].starts_with("Shadow bytes around"));
        // Three context lines, the faulting line, three more.
        let dump: Vec<&&str> = lines.iter().filter(|l| l.contains("0x")).collect();
        assert_eq!(dump.len(), 2 * CONTEXT_LINES + 1);

        let faulting = dump[CONTEXT_LINES];
        assert!(faulting.starts_with("=>"));
        assert!(faulting.contains("[fd]"));
        assert!(text.contains("freed heap region"));
    }

    #[test]
    fn test_dump_at_bottom_of_range() {
        let shadow = Shadow::new(ShadowConfig::default());
        let text = shadow.shadow_memory_text(0);
        assert!(text.contains("=>0x00000000:[f2]"));
    }
}
