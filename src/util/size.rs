//! Byte-size constants and formatting for reports.

/// `n` KiB in bytes.
#[inline]
pub const fn kb(n: usize) -> usize {
    n << 10
}

/// `n` MiB in bytes.
#[inline]
pub const fn mb(n: usize) -> usize {
    n << 20
}

/// Render a byte count with a binary unit, e.g. `1.50 MiB`.
///
/// Counts below 1 KiB are printed exactly.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

    if bytes < kb(1) {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units() {
        assert_eq!(kb(64), 65536);
        assert_eq!(mb(16), 16 << 20);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(kb(1)), "1.00 KiB");
        assert_eq!(format_bytes(mb(1) + mb(1) / 2), "1.50 MiB");
        assert_eq!(format_bytes(mb(3 * 1024)), "3.00 GiB");
    }
}
