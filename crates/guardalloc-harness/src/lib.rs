//! Offline tooling for guarded heap dumps.
//!
//! This crate provides:
//! - Loading structured dumps written by `GuardedHeap::report_flat`
//! - Aggregation: group blocks by owner name, sort by users, size or name
//! - Diff: per-name growth between two dumps

#![forbid(unsafe_code)]

pub mod aggregate;
pub mod diff;

use std::path::{Path, PathBuf};

use guardalloc_core::HeapDump;
use thiserror::Error;

pub use aggregate::{SortKey, aggregate, render_table};
pub use diff::{GroupDelta, diff_dumps, render_diff};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{}: malformed dump: {source}", path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no dump files given")]
    NoInput,
}

/// Read one structured dump from disk.
pub fn load_dump(path: &Path) -> Result<HeapDump, HarnessError> {
    let text = std::fs::read_to_string(path)?;
    HeapDump::from_json(&text).map_err(|source| HarnessError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Read several dumps and concatenate their blocks.
pub fn load_merged(paths: &[PathBuf]) -> Result<HeapDump, HarnessError> {
    if paths.is_empty() {
        return Err(HarnessError::NoInput);
    }
    let mut merged = HeapDump::default();
    for path in paths {
        let dump = load_dump(path)?;
        merged.bytes_in_use += dump.bytes_in_use;
        merged.peak_bytes_in_use = merged.peak_bytes_in_use.max(dump.peak_bytes_in_use);
        merged.block_count = merged.block_count.saturating_add(dump.block_count);
        merged.blocks.extend(dump.blocks);
    }
    Ok(merged)
}
