//! Guarded debug heap.
//!
//! A thin layer over a system heap that frames every allocation with guard
//! tags and keeps every live block in a registry, so that buffer overruns,
//! double frees, invalid frees and corrupted headers are caught and reported
//! instead of silently spreading.
//!
//! # Architecture
//!
//! - **Layout** (`layout`): guard tags, the in-band header and trailer,
//!   rounding and alignment padding arithmetic
//! - **Registry** (`registry`): generational arena of block records linked
//!   in allocation order, with O(1) payload lookup
//! - **Integrity** (`integrity`): dual-direction scan that tells one corrupt
//!   block from several and splices a single offender out
//! - **Heap** (`heap`): [`GuardedHeap`], the allocation, reallocation and
//!   deallocation surface with misuse detection
//! - **System heap** (`system`): the raw allocate/release primitive
//! - **Metrics** (`metrics`): atomic usage and diagnostic counters
//! - **Reports** (`report`): grouped, flat and leak reports
//! - **Errors** (`error`): the diagnostic taxonomy and pluggable sink
//! - **Configuration** (`config`): error policy, poison fill, leak policy

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod heap;
mod integrity;
pub mod layout;
pub mod metrics;
mod registry;
pub mod report;
pub mod system;

use std::sync::LazyLock;

pub use config::{ErrorPolicy, HeapConfig};
pub use error::{Diagnostic, ErrorSink, HeapError};
pub use heap::GuardedHeap;
pub use integrity::IntegrityOutcome;
pub use layout::AllocOrigin;
pub use metrics::{HeapMetrics, MetricsSnapshot};
pub use report::{GroupEntry, GroupedReport, HeapDump, LeakSummary, ReportFormat};
#[cfg(target_os = "linux")]
pub use system::LibcHeap;
pub use system::{StdHeap, SystemHeap};

static GLOBAL_HEAP: LazyLock<GuardedHeap> =
    LazyLock::new(|| GuardedHeap::with_config(HeapConfig::from_env()));

/// Process-wide heap, configured from the environment on first use.
#[must_use]
pub fn global_heap() -> &'static GuardedHeap {
    &GLOBAL_HEAP
}
