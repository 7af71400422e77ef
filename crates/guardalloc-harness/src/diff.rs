//! Per-name growth between two dumps.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use guardalloc_core::HeapDump;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupDelta {
    pub name: String,
    pub count_before: usize,
    pub count_after: usize,
    pub bytes_before: usize,
    pub bytes_after: usize,
}

impl GroupDelta {
    #[must_use]
    pub fn byte_delta(&self) -> i64 {
        self.bytes_after as i64 - self.bytes_before as i64
    }

    #[must_use]
    pub fn count_delta(&self) -> i64 {
        self.count_after as i64 - self.count_before as i64
    }
}

fn slot<'a, 'm>(map: &'m mut BTreeMap<&'a str, GroupDelta>, name: &'a str) -> &'m mut GroupDelta {
    map.entry(name).or_insert_with(|| GroupDelta {
        name: name.to_string(),
        count_before: 0,
        count_after: 0,
        bytes_before: 0,
        bytes_after: 0,
    })
}

/// Names whose block count or total changed, largest growth first.
#[must_use]
pub fn diff_dumps(before: &HeapDump, after: &HeapDump) -> Vec<GroupDelta> {
    let mut by_name: BTreeMap<&str, GroupDelta> = BTreeMap::new();
    for block in &before.blocks {
        let d = slot(&mut by_name, &block.name);
        d.count_before += 1;
        d.bytes_before += block.len;
    }
    for block in &after.blocks {
        let d = slot(&mut by_name, &block.name);
        d.count_after += 1;
        d.bytes_after += block.len;
    }

    let mut deltas: Vec<GroupDelta> = by_name
        .into_values()
        .filter(|d| d.count_delta() != 0 || d.byte_delta() != 0)
        .collect();
    deltas.sort_by(|a, b| b.byte_delta().cmp(&a.byte_delta()).then_with(|| a.name.cmp(&b.name)));
    deltas
}

#[must_use]
pub fn render_diff(deltas: &[GroupDelta]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:>10} {:>14}  NAME", "USERS", "BYTES");
    for d in deltas {
        let _ = writeln!(out, "{:>+10} {:>+14}  {}", d.count_delta(), d.byte_delta(), d.name);
    }
    let total: i64 = deltas.iter().map(GroupDelta::byte_delta).sum();
    let _ = write!(out, "net {total:+} bytes");
    out
}
