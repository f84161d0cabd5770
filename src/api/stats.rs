//! Heap statistics.

/// Snapshot of one heap proxy's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Blocks currently handed out.
    pub live_blocks: usize,

    /// Requested bytes of the live blocks.
    pub live_bytes: usize,

    /// Blocks sitting in quarantine.
    pub quarantined_blocks: usize,

    /// Block bytes held by the quarantine.
    pub quarantine_size: usize,

    /// Cap on the quarantine.
    pub quarantine_max_size: usize,

    /// Total number of allocations performed.
    pub allocation_count: u64,

    /// Total number of successful frees.
    pub free_count: u64,

    /// Frees rejected as double or invalid.
    pub failed_free_count: u64,

    /// Blocks released from quarantine to the raw heap.
    pub eviction_count: u64,
}

impl HeapStats {
    /// Create empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// How full the quarantine is, in `[0, 1]` (0 when the cap is 0).
    pub fn quarantine_utilization(&self) -> f64 {
        if self.quarantine_max_size == 0 {
            return 0.0;
        }
        self.quarantine_size as f64 / self.quarantine_max_size as f64
    }
}

impl std::fmt::Display for HeapStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap Statistics:")?;
        writeln!(f, "  Live blocks:     {} ({} bytes)", self.live_blocks, self.live_bytes)?;
        writeln!(f, "  Quarantined:     {} blocks", self.quarantined_blocks)?;
        writeln!(
            f,
            "  Quarantine:      {} / {} bytes",
            self.quarantine_size, self.quarantine_max_size
        )?;
        writeln!(f, "  Allocations:     {}", self.allocation_count)?;
        writeln!(f, "  Frees:           {}", self.free_count)?;
        writeln!(f, "  Failed frees:    {}", self.failed_free_count)?;
        writeln!(f, "  Evictions:       {}", self.eviction_count)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let mut stats = HeapStats::new();
        assert_eq!(stats.quarantine_utilization(), 0.0);
        stats.quarantine_max_size = 200;
        stats.quarantine_size = 50;
        assert!((stats.quarantine_utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display() {
        let stats = HeapStats {
            live_blocks: 2,
            live_bytes: 30,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("Live blocks:     2 (30 bytes)"));
    }
}
