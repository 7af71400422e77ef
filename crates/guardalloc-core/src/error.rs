//! Diagnostics raised by the guarded heap.
//!
//! Nothing here is returned through `Result` by the allocation API: every
//! condition is reported through the heap's sink and the operation returns a
//! sentinel (or proceeds). The enum exists so hosts can match on what went
//! wrong instead of parsing messages.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{AllocOrigin, MAX_ALIGNMENT};

/// Every condition the heap can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("attempt to free a null pointer")]
    NullFree,
    #[error("attempt to free an illegal pointer {addr:#x}")]
    IllegalPointer { addr: usize },
    #[error("double free")]
    DoubleFree,
    #[error("error in header")]
    HeaderCorrupt,
    #[error("end corrupt")]
    EndCorrupt,
    #[error("is also corrupt")]
    AlsoCorrupt,
    #[error("pointer {addr:#x} not in registry")]
    NotInRegistry { addr: usize },
    #[error("more than one memory block corrupt")]
    MultipleCorrupt,
    #[error("out of memory: requested {requested} bytes, {in_use} bytes in use")]
    OutOfMemory { requested: usize, in_use: u64 },
    #[error("array allocation aborted due to integer overflow: {count} x {elem_size}")]
    ArrayOverflow { count: usize, elem_size: usize },
    #[error(
        "invalid alignment {alignment}: must be a power of two below {max}",
        max = MAX_ALIGNMENT
    )]
    InvalidAlignment { alignment: usize },
    #[error("{operation} used on a block created through the {origin} path")]
    OriginMismatch {
        operation: &'static str,
        origin: AllocOrigin,
    },
    #[error("freed after leak detection has run, possible lifetime bug")]
    FreeAfterLeakDetection,
    #[error("not freed memory blocks: {blocks}, total unfreed memory {bytes} bytes")]
    Leaked { blocks: u32, bytes: u64 },
}

impl HeapError {
    /// Heap corruption class: double free, invalid pointer, corrupted guard
    /// tags and unrecoverable multi-block corruption. Only these escalate
    /// under [`ErrorPolicy::Panic`](crate::config::ErrorPolicy::Panic).
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::IllegalPointer { .. }
                | Self::DoubleFree
                | Self::HeaderCorrupt
                | Self::EndCorrupt
                | Self::AlsoCorrupt
                | Self::NotInRegistry { .. }
                | Self::MultipleCorrupt
        )
    }

    /// Stable machine-readable label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NullFree => "null_free",
            Self::IllegalPointer { .. } => "illegal_pointer",
            Self::DoubleFree => "double_free",
            Self::HeaderCorrupt => "header_corrupt",
            Self::EndCorrupt => "end_corrupt",
            Self::AlsoCorrupt => "also_corrupt",
            Self::NotInRegistry { .. } => "not_in_registry",
            Self::MultipleCorrupt => "multiple_corrupt",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::ArrayOverflow { .. } => "array_overflow",
            Self::InvalidAlignment { .. } => "invalid_alignment",
            Self::OriginMismatch { .. } => "origin_mismatch",
            Self::FreeAfterLeakDetection => "free_after_leak_detection",
            Self::Leaked { .. } => "leaked",
        }
    }
}

/// A reported condition together with the label of the block it concerns.
///
/// When no block is involved (null free, OOM) `block` names the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub block: &'static str,
    pub error: HeapError,
}

impl Diagnostic {
    #[must_use]
    pub const fn new(block: &'static str, error: HeapError) -> Self {
        Self { block, error }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memoryblock {}: {}", self.block, self.error)
    }
}

/// Pluggable destination for diagnostics.
pub type ErrorSink = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Sink used when the host has not installed one.
pub(crate) fn default_sink(diag: &Diagnostic) {
    if diag.error.is_corruption() {
        tracing::error!(block = diag.block, kind = diag.error.kind(), "{diag}");
    } else {
        tracing::warn!(block = diag.block, kind = diag.error.kind(), "{diag}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_renders_block_and_message() {
        let diag = Diagnostic::new("mesh verts", HeapError::DoubleFree);
        assert_eq!(diag.to_string(), "Memoryblock mesh verts: double free");

        let diag = Diagnostic::new("free", HeapError::NullFree);
        assert_eq!(
            diag.to_string(),
            "Memoryblock free: attempt to free a null pointer"
        );
    }

    #[test]
    fn misuse_and_exhaustion_are_not_corruption() {
        assert!(!HeapError::NullFree.is_corruption());
        assert!(
            !HeapError::OutOfMemory {
                requested: 1,
                in_use: 0
            }
            .is_corruption()
        );
        assert!(
            !HeapError::OriginMismatch {
                operation: "reallocate",
                origin: AllocOrigin::Typed
            }
            .is_corruption()
        );
        assert!(HeapError::DoubleFree.is_corruption());
        assert!(HeapError::MultipleCorrupt.is_corruption());
        assert!(HeapError::IllegalPointer { addr: 1 }.is_corruption());
    }

    #[test]
    fn origin_mismatch_names_the_api() {
        let err = HeapError::OriginMismatch {
            operation: "reallocate",
            origin: AllocOrigin::Typed,
        };
        assert_eq!(
            err.to_string(),
            "reallocate used on a block created through the typed construct path"
        );
        assert_eq!(err.kind(), "origin_mismatch");
    }

    #[test]
    fn default_sink_logs_through_tracing() {
        let subscriber = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            default_sink(&Diagnostic::new("scratch", HeapError::EndCorrupt));
            default_sink(&Diagnostic::new("free", HeapError::NullFree));
        });
    }

    #[test]
    fn invalid_alignment_mentions_limit() {
        let err = HeapError::InvalidAlignment { alignment: 3 };
        assert_eq!(
            err.to_string(),
            "invalid alignment 3: must be a power of two below 1024"
        );
    }
}
