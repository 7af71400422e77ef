//! Group dumped blocks by owner name.

use std::fmt::Write as _;

use clap::ValueEnum;
use guardalloc_core::report::group_by_name;
use guardalloc_core::{GroupEntry, HeapDump};

/// Ordering of aggregated groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SortKey {
    /// Most blocks first.
    Users,
    /// Largest total first.
    #[default]
    Size,
    /// Alphabetical.
    Name,
}

/// Group the blocks of `dump` by name and order them by `key`.
///
/// Ties fall back to name order so output is deterministic.
#[must_use]
pub fn aggregate(dump: &HeapDump, key: SortKey) -> Vec<GroupEntry> {
    let mut groups = group_by_name(dump.blocks.iter().map(|b| (b.name.as_str(), b.len)));
    match key {
        SortKey::Users => groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name))),
        SortKey::Size => groups.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then_with(|| a.name.cmp(&b.name))
        }),
        SortKey::Name => groups.sort_by(|a, b| a.name.cmp(&b.name)),
    }
    groups
}

/// Plain-text table of `groups`.
#[must_use]
pub fn render_table(groups: &[GroupEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>8} {:>14} {:>12}  NAME", "USERS", "TOTAL-BYTES", "AVERAGE");
    let (mut blocks, mut bytes) = (0usize, 0usize);
    for g in groups {
        let _ = writeln!(
            out,
            "{:>8} {:>14} {:>12.1}  {}",
            g.count,
            g.total_bytes,
            g.average_bytes(),
            g.name
        );
        blocks += g.count;
        bytes += g.total_bytes;
    }
    let _ = write!(out, "{blocks} blocks, {bytes} bytes in {} groups", groups.len());
    out
}
