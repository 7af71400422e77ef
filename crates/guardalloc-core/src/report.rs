//! Heap reports.
//!
//! - [`GroupedReport`]: live blocks merged by owner name, largest first.
//! - [`HeapDump`]: one entry per live block. Rendered either as a readable
//!   listing or as JSON for offline aggregation (see `guardalloc-harness`).
//! - [`LeakSummary`]: what was still live when leak detection ran.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::layout::AllocOrigin;

/// Blocks sharing one owner name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    pub count: usize,
    pub total_bytes: usize,
}

impl GroupEntry {
    #[must_use]
    pub fn average_bytes(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.count as f64
        }
    }
}

/// Merge `(name, size)` pairs by name, then order by total size, largest
/// first. Ties keep name order.
#[must_use]
pub fn group_by_name<'a>(blocks: impl IntoIterator<Item = (&'a str, usize)>) -> Vec<GroupEntry> {
    let mut flat: Vec<(&str, usize)> = blocks.into_iter().collect();
    flat.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut groups: Vec<GroupEntry> = Vec::new();
    for (name, size) in flat {
        match groups.last_mut() {
            Some(last) if last.name == name => {
                last.count += 1;
                last.total_bytes += size;
            }
            _ => groups.push(GroupEntry {
                name: name.to_string(),
                count: 1,
                total_bytes: size,
            }),
        }
    }
    groups.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes));
    groups
}

/// Live blocks grouped by owner name.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedReport {
    pub entries: Vec<GroupEntry>,
    pub total_blocks: usize,
    pub total_bytes: u64,
    pub peak_bytes: u64,
    /// Backing bytes the system heap handed out beyond what was asked for,
    /// when it reports usable sizes.
    pub slop_bytes: Option<u64>,
}

impl GroupedReport {
    /// Entry for `name`, if any block carries it.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&GroupEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

const MIB: f64 = 1024.0 * 1024.0;

impl fmt::Display for GroupedReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "total memory len: {:.3} MiB",
            self.total_bytes as f64 / MIB
        )?;
        writeln!(f, "peak memory len: {:.3} MiB", self.peak_bytes as f64 / MIB)?;
        if let Some(slop) = self.slop_bytes {
            writeln!(f, "slop memory len: {:.3} MiB", slop as f64 / MIB)?;
        }
        writeln!(f, "{:>8} {:>12} {:>12}  NAME", "ITEMS", "TOTAL-KiB", "AVERAGE-KiB")?;
        for entry in &self.entries {
            writeln!(
                f,
                "{:>8} {:>12.3} {:>12.3}  {}",
                entry.count,
                entry.total_bytes as f64 / 1024.0,
                entry.average_bytes() / 1024.0,
                entry.name
            )?;
        }
        write!(f, "{} blocks in {} groups", self.total_blocks, self.entries.len())
    }
}

/// Output style of [`GuardedHeap::report_flat`](crate::GuardedHeap::report_flat).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    /// One line per block: name, size, address.
    #[default]
    Human,
    /// JSON [`HeapDump`].
    Structured,
}

/// One live block in a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpBlock {
    pub name: String,
    pub len: usize,
    pub ptr: usize,
    #[serde(default)]
    pub alignment: usize,
    #[serde(default)]
    pub origin: AllocOrigin,
}

/// Every live block, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapDump {
    pub bytes_in_use: u64,
    pub peak_bytes_in_use: u64,
    pub block_count: u32,
    pub blocks: Vec<DumpBlock>,
}

impl HeapDump {
    /// Parse a structured dump.
    pub fn from_json(input: &str) -> serde_json::Result<Self> {
        serde_json::from_str(input)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Readable per-block listing.
    #[must_use]
    pub fn to_human(&self) -> String {
        use fmt::Write as _;

        let mut out = String::new();
        for block in &self.blocks {
            let _ = writeln!(out, "{} len: {} {:#x}", block.name, block.len, block.ptr);
        }
        let _ = write!(
            out,
            "{} blocks, {} bytes in use, peak {} bytes",
            self.block_count, self.bytes_in_use, self.peak_bytes_in_use
        );
        out
    }
}

/// Blocks still live when leak detection ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakSummary {
    pub blocks: u32,
    pub bytes: u64,
    /// Grouped by owner name, largest first.
    pub groups: Vec<GroupEntry>,
    /// The heap was configured to treat leaks as fatal.
    pub fatal: bool,
}
