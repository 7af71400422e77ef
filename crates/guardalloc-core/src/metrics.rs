//! Atomic counters for the guarded heap.
//!
//! Usage counters (`live_blocks`, `bytes_in_use`, `peak_bytes`) are updated
//! while the registry lock is held so they stay consistent with the list;
//! readers may load them without the lock. Diagnostic counters are advisory.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::HeapError;

/// Per-heap counters.
pub struct HeapMetrics {
    /// Blocks currently in the registry.
    pub live_blocks: AtomicU32,
    /// Requested bytes of all live blocks.
    pub bytes_in_use: AtomicU64,
    /// Running maximum of `bytes_in_use`.
    pub peak_bytes: AtomicU64,
    /// Successful allocations, including reallocation targets.
    pub allocations: AtomicU64,
    /// Successful releases.
    pub frees: AtomicU64,
    /// Null pointers passed to free.
    pub null_frees: AtomicU64,
    /// Misaligned or unknown pointers passed to free.
    pub illegal_pointers: AtomicU64,
    /// Double frees detected.
    pub double_frees: AtomicU64,
    /// Corrupted headers or trailers detected.
    pub corruptions: AtomicU64,
    /// Corrupt blocks excised from the registry.
    pub repairs: AtomicU64,
    /// Raw/typed API crossovers.
    pub misuse: AtomicU64,
    /// System heap exhaustion and unrepresentable sizes.
    pub out_of_memory: AtomicU64,
}

impl HeapMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            live_blocks: AtomicU32::new(0),
            bytes_in_use: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            null_frees: AtomicU64::new(0),
            illegal_pointers: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
            repairs: AtomicU64::new(0),
            misuse: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Account for a block entering the registry.
    pub(crate) fn block_added(&self, bytes: usize) {
        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        let now = self.bytes_in_use.fetch_add(bytes as u64, Ordering::Relaxed) + bytes as u64;
        self.peak_bytes.fetch_max(now, Ordering::Relaxed);
    }

    /// Account for a block leaving the registry.
    pub(crate) fn block_removed(&self, bytes: usize) {
        // Saturating: clear_registry may have zeroed the counters underneath.
        let _ = self
            .live_blocks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        let _ = self
            .bytes_in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes as u64))
            });
    }

    pub(crate) fn reset_usage(&self) {
        self.live_blocks.store(0, Ordering::Relaxed);
        self.bytes_in_use.store(0, Ordering::Relaxed);
    }

    /// Lower the peak to the current usage.
    pub fn reset_peak(&self) {
        self.peak_bytes
            .store(self.bytes_in_use.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Bump the diagnostic counter matching a reported error.
    pub fn record(&self, error: &HeapError) {
        match error {
            HeapError::NullFree => Self::inc(&self.null_frees),
            HeapError::IllegalPointer { .. } | HeapError::NotInRegistry { .. } => {
                Self::inc(&self.illegal_pointers);
            }
            HeapError::DoubleFree => Self::inc(&self.double_frees),
            HeapError::HeaderCorrupt
            | HeapError::EndCorrupt
            | HeapError::AlsoCorrupt
            | HeapError::MultipleCorrupt => Self::inc(&self.corruptions),
            HeapError::OriginMismatch { .. } => Self::inc(&self.misuse),
            HeapError::OutOfMemory { .. } | HeapError::ArrayOverflow { .. } => {
                Self::inc(&self.out_of_memory);
            }
            HeapError::InvalidAlignment { .. }
            | HeapError::FreeAfterLeakDetection
            | HeapError::Leaked { .. } => {}
        }
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            live_blocks: self.live_blocks.load(Ordering::Relaxed),
            bytes_in_use: self.bytes_in_use.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            allocations: Self::get(&self.allocations),
            frees: Self::get(&self.frees),
            null_frees: Self::get(&self.null_frees),
            illegal_pointers: Self::get(&self.illegal_pointers),
            double_frees: Self::get(&self.double_frees),
            corruptions: Self::get(&self.corruptions),
            repairs: Self::get(&self.repairs),
            misuse: Self::get(&self.misuse),
            out_of_memory: Self::get(&self.out_of_memory),
        }
    }
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all heap counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub live_blocks: u32,
    pub bytes_in_use: u64,
    pub peak_bytes: u64,
    pub allocations: u64,
    pub frees: u64,
    pub null_frees: u64,
    pub illegal_pointers: u64,
    pub double_frees: u64,
    pub corruptions: u64,
    pub repairs: u64,
    pub misuse: u64,
    pub out_of_memory: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = HeapMetrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn peak_is_a_running_maximum() {
        let m = HeapMetrics::new();
        m.block_added(100);
        m.block_added(50);
        m.block_removed(100);
        m.block_added(20);
        let snap = m.snapshot();
        assert_eq!(snap.live_blocks, 2);
        assert_eq!(snap.bytes_in_use, 70);
        assert_eq!(snap.peak_bytes, 150);

        m.reset_peak();
        assert_eq!(m.snapshot().peak_bytes, 70);
    }

    #[test]
    fn removal_saturates_after_reset() {
        let m = HeapMetrics::new();
        m.block_added(8);
        m.reset_usage();
        m.block_removed(8);
        let snap = m.snapshot();
        assert_eq!(snap.live_blocks, 0);
        assert_eq!(snap.bytes_in_use, 0);
    }

    #[test]
    fn record_routes_errors_to_counters() {
        let m = HeapMetrics::new();
        m.record(&HeapError::DoubleFree);
        m.record(&HeapError::DoubleFree);
        m.record(&HeapError::HeaderCorrupt);
        m.record(&HeapError::NullFree);
        m.record(&HeapError::IllegalPointer { addr: 3 });
        let snap = m.snapshot();
        assert_eq!(snap.double_frees, 2);
        assert_eq!(snap.corruptions, 1);
        assert_eq!(snap.null_frees, 1);
        assert_eq!(snap.illegal_pointers, 1);
        assert_eq!(snap.misuse, 0);
    }
}
