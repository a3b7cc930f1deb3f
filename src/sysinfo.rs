//! Small system-info facade: total physical/virtual memory, probed once
//! per reporter recompute rather than re-derived from scratch on every
//! 500 ms wakeup (itself a source of progress-line jitter).
//!
//! The original backend calls `GlobalMemoryStatusEx` for this. Linux has
//! no equivalent "total virtual memory" figure -- the addressable space
//! is effectively unbounded for a 64-bit process -- so this facade parses
//! `/proc/meminfo` for the physical total and reports a conservative,
//! fixed virtual-address-space ceiling in its place.

/// Physical and virtual memory totals, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTotals {
    /// Total installed physical RAM.
    pub phys_total: u64,
    /// Total addressable virtual memory for this process.
    pub virt_total: u64,
}

/// A 64-bit process's addressable virtual memory, conservatively. Linux
/// does not expose a "total virtual memory" figure the way Windows does;
/// this is the canonical x86-64 user-space ceiling (47-bit address space).
const VIRT_TOTAL_FALLBACK: u64 = 128 * 1024 * 1024 * 1024 * 1024;

/// Used when `/proc/meminfo` is absent or unparseable (non-Linux targets,
/// sandboxed environments).
const PHYS_TOTAL_FALLBACK: u64 = 8 * 1024 * 1024 * 1024;

/// Reads current memory totals.
#[must_use]
pub fn memory_totals() -> MemoryTotals {
    #[cfg(target_os = "linux")]
    {
        if let Some(phys_total) = read_proc_meminfo_total() {
            return MemoryTotals {
                phys_total,
                virt_total: VIRT_TOTAL_FALLBACK,
            };
        }
    }
    MemoryTotals {
        phys_total: PHYS_TOTAL_FALLBACK,
        virt_total: VIRT_TOTAL_FALLBACK,
    }
}

#[cfg(target_os = "linux")]
fn read_proc_meminfo_total() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total_kib(&contents).map(|kib| kib * 1024)
}

fn parse_mem_total_kib(contents: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        rest.split_whitespace().next()?.parse::<u64>().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mem_total_line() {
        let sample = "MemTotal:       16384000 kB\nMemFree:        1000 kB\n";
        assert_eq!(parse_mem_total_kib(sample), Some(16_384_000));
    }

    #[test]
    fn missing_mem_total_is_none() {
        assert_eq!(parse_mem_total_kib("Nonsense: 1\n"), None);
    }

    #[test]
    fn memory_totals_never_reports_zero() {
        let totals = memory_totals();
        assert!(totals.phys_total > 0);
        assert!(totals.virt_total > 0);
    }
}
