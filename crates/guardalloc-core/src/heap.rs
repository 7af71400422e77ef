//! The guarded heap.
//!
//! Every operation that touches the registry holds its mutex for the header
//! stamping and list update; system-heap release happens after the lock is
//! dropped. Diagnostics are gathered while the lock is held and delivered to
//! the sink afterwards, so a sink may call back into the heap.
//!
//! Pointers handed to `deallocate`, `reallocate` and friends are only ever
//! dereferenced once they resolve to a registered block. Null, misaligned,
//! released and foreign pointers are diagnosed from the registry alone.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::HeapConfig;
use crate::error::{Diagnostic, ErrorSink, HeapError, default_sink};
use crate::integrity::{IntegrityOutcome, ScanOutcome, scan};
use crate::layout::{
    AllocOrigin, BlockHeader, BlockLayout, GuardTag, POISON_BYTE, TagState, classify_trailer,
    normalize_alignment, read_header, read_trailer, write_header, write_trailer,
};
use crate::metrics::{HeapMetrics, MetricsSnapshot};
use crate::registry::{BlockHandle, BlockRecord, Registry};
use crate::report::{DumpBlock, GroupedReport, HeapDump, LeakSummary, ReportFormat, group_by_name};
use crate::system::{StdHeap, SystemHeap};

type Pending = Vec<Diagnostic>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fill {
    /// Poison the payload if poison fill is enabled.
    Poison,
    /// Payload comes zeroed from the system heap.
    Zeroed,
}

#[derive(Debug, Clone, Copy)]
struct Allocated {
    payload: NonNull<u8>,
    length: usize,
}

/// Registry facts about a live block, copied out under the lock.
#[derive(Debug, Clone, Copy)]
struct BlockInfo {
    handle: BlockHandle,
    length: usize,
    requested: usize,
    alignment: usize,
    origin: AllocOrigin,
    name: &'static str,
}

impl BlockInfo {
    fn of(handle: BlockHandle, record: &BlockRecord) -> Self {
        Self {
            handle,
            length: record.length,
            requested: record.requested,
            alignment: record.alignment,
            origin: record.origin,
            name: record.name,
        }
    }

    fn alignment(&self) -> Option<usize> {
        (self.alignment != 0).then_some(self.alignment)
    }
}

/// How a targeted scan affected the target block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetFate {
    /// Still registered (or never was).
    Kept,
    /// Spliced out of an intact registry.
    Unlinked,
    /// Spliced out as the single corrupt block.
    RemovedAsCorrupt,
}

/// A heap that frames every block with guard tags and tracks all live blocks.
pub struct GuardedHeap<H: SystemHeap = StdHeap> {
    system: H,
    registry: Mutex<Registry>,
    metrics: HeapMetrics,
    sink: RwLock<Option<ErrorSink>>,
    poison_fill: AtomicBool,
    leak_check_ran: AtomicBool,
    config: HeapConfig,
}

impl GuardedHeap<StdHeap> {
    /// Heap over the Rust global allocator with default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    #[must_use]
    pub fn with_config(config: HeapConfig) -> Self {
        Self::with_system(StdHeap, config)
    }
}

impl Default for GuardedHeap<StdHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: SystemHeap> fmt::Debug for GuardedHeap<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedHeap")
            .field("config", &self.config)
            .field("metrics", &self.metrics.snapshot())
            .field("poison_fill", &self.poison_fill_enabled())
            .finish_non_exhaustive()
    }
}

impl<H: SystemHeap> GuardedHeap<H> {
    #[must_use]
    pub fn with_system(system: H, config: HeapConfig) -> Self {
        Self {
            system,
            registry: Mutex::new(Registry::new()),
            metrics: HeapMetrics::new(),
            sink: RwLock::new(None),
            poison_fill: AtomicBool::new(config.poison_fill),
            leak_check_ran: AtomicBool::new(false),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    #[must_use]
    pub const fn system(&self) -> &H {
        &self.system
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Route diagnostics to `callback` instead of the default `tracing` sink.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&Diagnostic) + Send + Sync + 'static,
    {
        *self.sink.write() = Some(Arc::new(callback));
    }

    /// Restore the default sink.
    pub fn clear_error_callback(&self) {
        *self.sink.write() = None;
    }

    pub fn enable_poison_fill(&self, enabled: bool) {
        tracing::trace!(enabled, "guarded heap poison fill");
        self.poison_fill.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn poison_fill_enabled(&self) -> bool {
        self.poison_fill.load(Ordering::Relaxed)
    }

    fn emit(&self, pending: Pending) {
        if pending.is_empty() {
            return;
        }
        let sink = self.sink.read().clone();
        for diag in &pending {
            self.metrics.record(&diag.error);
            match &sink {
                Some(sink) => sink(diag),
                None => default_sink(diag),
            }
        }
        if self.config.error_policy.escalates() {
            if let Some(diag) = pending.iter().find(|d| d.error.is_corruption()) {
                panic!("guarded heap corruption: {diag}");
            }
        }
    }

    fn emit_one(&self, block: &'static str, error: HeapError) {
        self.emit(vec![Diagnostic::new(block, error)]);
    }

    fn report_oom(&self, name: &'static str, requested: usize) {
        self.emit_one(
            name,
            HeapError::OutOfMemory {
                requested,
                in_use: self.current_bytes_in_use(),
            },
        );
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn allocate_block(
        &self,
        requested: usize,
        alignment: Option<usize>,
        name: &'static str,
        origin: AllocOrigin,
        fill: Fill,
    ) -> Option<Allocated> {
        let Some(block) = BlockLayout::new(requested, alignment) else {
            self.report_oom(name, requested);
            return None;
        };
        let raw = match fill {
            Fill::Zeroed => self.system.allocate_zeroed(block.layout),
            Fill::Poison => self.system.allocate(block.layout),
        };
        let Some(raw) = raw else {
            self.report_oom(name, requested);
            return None;
        };
        // SAFETY: payload_offset + length + TRAILER_SIZE == layout.size().
        let payload = unsafe { raw.add(block.payload_offset()) };
        let poison = fill == Fill::Poison && self.poison_fill_enabled();

        let mut registry = self.registry.lock();
        let handle = registry.insert(BlockRecord::new(
            payload.as_ptr() as usize,
            raw.as_ptr() as usize,
            block.layout,
            block.length,
            requested,
            block.alignment,
            origin,
            name,
        ));
        // SAFETY: header, payload and trailer all lie inside the fresh raw
        // allocation of block.layout.size() bytes.
        unsafe {
            write_header(
                payload,
                BlockHeader::live(
                    block.length,
                    handle.slot,
                    handle.generation,
                    block.alignment,
                    origin,
                ),
            );
            write_trailer(payload, block.length, GuardTag::TRAILER);
            if poison {
                ptr::write_bytes(payload.as_ptr(), POISON_BYTE, block.length);
            }
        }
        self.metrics.block_added(requested);
        HeapMetrics::inc(&self.metrics.allocations);
        drop(registry);

        Some(Allocated {
            payload,
            length: block.length,
        })
    }

    /// Allocate `len` bytes labelled `name`.
    ///
    /// Returns `None` (after reporting) when the system heap is exhausted.
    pub fn allocate(&self, len: usize, name: &'static str) -> Option<NonNull<u8>> {
        self.allocate_block(len, None, name, AllocOrigin::Raw, Fill::Poison)
            .map(|a| a.payload)
    }

    /// Allocate `len` zeroed bytes.
    pub fn allocate_zeroed(&self, len: usize, name: &'static str) -> Option<NonNull<u8>> {
        self.allocate_block(len, None, name, AllocOrigin::Raw, Fill::Zeroed)
            .map(|a| a.payload)
    }

    /// Allocate `len` bytes whose payload is aligned to `alignment`.
    ///
    /// `alignment` must be a power of two below
    /// [`MAX_ALIGNMENT`](crate::layout::MAX_ALIGNMENT); smaller values are
    /// raised to [`MIN_ALIGNMENT`](crate::layout::MIN_ALIGNMENT).
    pub fn allocate_aligned(
        &self,
        len: usize,
        alignment: usize,
        name: &'static str,
        origin: AllocOrigin,
    ) -> Option<NonNull<u8>> {
        let Some(alignment) = normalize_alignment(alignment) else {
            self.emit_one(name, HeapError::InvalidAlignment { alignment });
            return None;
        };
        self.allocate_block(len, Some(alignment), name, origin, Fill::Poison)
            .map(|a| a.payload)
    }

    /// Allocate `count * elem_size` bytes.
    ///
    /// An overflowing product is a programming error: it is reported and the
    /// process is aborted.
    pub fn allocate_array(
        &self,
        count: usize,
        elem_size: usize,
        name: &'static str,
    ) -> Option<NonNull<u8>> {
        let len = self.array_len(count, elem_size, name);
        self.allocate(len, name)
    }

    /// Zeroed variant of [`allocate_array`](Self::allocate_array).
    pub fn allocate_array_zeroed(
        &self,
        count: usize,
        elem_size: usize,
        name: &'static str,
    ) -> Option<NonNull<u8>> {
        let len = self.array_len(count, elem_size, name);
        self.allocate_zeroed(len, name)
    }

    fn array_len(&self, count: usize, elem_size: usize, name: &'static str) -> usize {
        match count.checked_mul(elem_size) {
            Some(len) => len,
            None => {
                self.emit_one(name, HeapError::ArrayOverflow { count, elem_size });
                std::process::abort();
            }
        }
    }

    // ------------------------------------------------------------------
    // Reallocation
    // ------------------------------------------------------------------

    /// Registry facts for `ptr`, reporting `operation` misuse when it is not
    /// a live block.
    fn live_block(&self, ptr: *const u8, operation: &'static str) -> Option<BlockInfo> {
        let addr = ptr as usize;
        let registry = self.registry.lock();
        let info = registry
            .lookup(addr)
            .and_then(|handle| registry.get(handle).map(|r| BlockInfo::of(handle, r)));
        drop(registry);
        if info.is_none() {
            self.emit_one(operation, HeapError::NotInRegistry { addr });
        }
        info
    }

    fn check_origin(&self, info: &BlockInfo, operation: &'static str, expected: AllocOrigin) {
        if info.origin != expected {
            self.emit_one(
                info.name,
                HeapError::OriginMismatch {
                    operation,
                    origin: info.origin,
                },
            );
        }
    }

    /// Copy `copy` bytes of `src` into the new block, zeroing up to
    /// `zero_to`, provided `src` is still the block described by `info`.
    fn copy_payload(
        &self,
        src: *const u8,
        info: &BlockInfo,
        dst: Allocated,
        copy: usize,
        zero_to: usize,
    ) {
        let registry = self.registry.lock();
        if registry.lookup(src as usize) != Some(info.handle) {
            // Released by another thread in the meantime; the release below
            // reports it.
            return;
        }
        // SAFETY: `src` is a live block of at least `info.length >= copy`
        // bytes, `dst` a distinct fresh block of `dst.length >= zero_to`
        // bytes; the registry lock keeps `src` from being released.
        unsafe {
            ptr::copy_nonoverlapping(src, dst.payload.as_ptr(), copy);
            if zero_to > copy {
                ptr::write_bytes(dst.payload.as_ptr().add(copy), 0, zero_to - copy);
            }
        }
    }

    fn reallocate_impl(
        &self,
        ptr: *mut u8,
        new_len: usize,
        name: &'static str,
        zero_extend: bool,
    ) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return if zero_extend {
                self.allocate_zeroed(new_len, name)
            } else {
                self.allocate(new_len, name)
            };
        }
        let operation = if zero_extend {
            "reallocate_zero_extended"
        } else {
            "reallocate"
        };
        let old = self.live_block(ptr, operation)?;
        self.check_origin(&old, operation, AllocOrigin::Raw);

        let new = self.allocate_block(
            new_len,
            old.alignment(),
            old.name,
            AllocOrigin::Raw,
            Fill::Poison,
        )?;
        let copy = old.length.min(new.length);
        let zero_to = if zero_extend { new.length } else { copy };
        self.copy_payload(ptr, &old, new, copy, zero_to);
        self.release(ptr, None);
        Some(new.payload)
    }

    /// Resize a block, keeping its name and alignment.
    ///
    /// A null `ptr` allocates a fresh block named `name`. The first
    /// `min(old, new)` bytes are preserved. If the new block cannot be
    /// allocated the old one is left untouched and `None` is returned.
    pub fn reallocate(&self, ptr: *mut u8, new_len: usize, name: &'static str) -> Option<NonNull<u8>> {
        self.reallocate_impl(ptr, new_len, name, false)
    }

    /// Like [`reallocate`](Self::reallocate), zero-filling any growth.
    pub fn reallocate_zero_extended(
        &self,
        ptr: *mut u8,
        new_len: usize,
        name: &'static str,
    ) -> Option<NonNull<u8>> {
        self.reallocate_impl(ptr, new_len, name, true)
    }

    /// Copy a block into a new one with the same length, alignment and name.
    pub fn duplicate(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            return None;
        }
        let old = self.live_block(ptr, "duplicate")?;
        self.check_origin(&old, "duplicate", AllocOrigin::Raw);
        let new = self.allocate_block(
            old.requested,
            old.alignment(),
            old.name,
            AllocOrigin::Raw,
            Fill::Poison,
        )?;
        self.copy_payload(ptr, &old, new, old.length, old.length);
        Some(new.payload)
    }

    // ------------------------------------------------------------------
    // Deallocation
    // ------------------------------------------------------------------

    /// Release a block allocated through the `origin` API.
    ///
    /// Null, misaligned, released, foreign and corrupted pointers are
    /// reported and the call returns; a block released through the wrong
    /// API is reported and still released.
    pub fn deallocate(&self, ptr: *mut u8, origin: AllocOrigin) {
        self.release(ptr, Some(origin));
    }

    fn forget(&self, record: &BlockRecord) {
        self.metrics.block_removed(record.requested);
    }

    /// Fold a targeted scan into diagnostics and counters.
    fn absorb_scan(&self, outcome: ScanOutcome, target: usize, pending: &mut Pending) -> TargetFate {
        match outcome {
            ScanOutcome::Intact => TargetFate::Kept,
            ScanOutcome::TargetUnlinked { record, .. } => {
                self.forget(&record);
                TargetFate::Unlinked
            }
            ScanOutcome::Repaired { name, record } => {
                self.forget(&record);
                HeapMetrics::inc(&self.metrics.repairs);
                if record.payload == target {
                    pending.push(Diagnostic::new(name, HeapError::HeaderCorrupt));
                    TargetFate::RemovedAsCorrupt
                } else {
                    pending.push(Diagnostic::new(name, HeapError::AlsoCorrupt));
                    TargetFate::Kept
                }
            }
            ScanOutcome::MultipleCorrupt { forward, .. } => {
                pending.push(Diagnostic::new(forward, HeapError::MultipleCorrupt));
                TargetFate::Kept
            }
        }
    }

    fn release(&self, ptr: *mut u8, expected: Option<AllocOrigin>) {
        let addr = ptr as usize;
        let Some(payload) = NonNull::new(ptr) else {
            self.emit_one("free", HeapError::NullFree);
            return;
        };
        if addr % std::mem::align_of::<usize>() != 0 {
            self.emit_one("free", HeapError::IllegalPointer { addr });
            return;
        }

        let mut pending = Pending::new();
        let mut to_release = None;
        let mut registry = self.registry.lock();

        match registry.lookup(addr) {
            None if registry.was_freed(addr) => {
                pending.push(Diagnostic::new("free", HeapError::DoubleFree));
            }
            None => {
                let outcome = scan(&mut registry, Some(addr));
                self.absorb_scan(outcome, addr, &mut pending);
                pending.push(Diagnostic::new("free", HeapError::NotInRegistry { addr }));
            }
            Some(handle) => {
                let Some(record) = registry.get(handle) else {
                    unreachable!("lookup returned a stale handle");
                };
                let info = BlockInfo::of(handle, record);
                let (raw, layout) = (record.raw, record.layout);
                // SAFETY: `payload` is a registered block; its header and
                // trailer (at the registry's trusted length) are inside the
                // raw allocation, which stays live while the lock is held.
                let (header, trailer) =
                    unsafe { (read_header(payload), read_trailer(payload, info.length)) };

                let header_ok = header.is_intact()
                    && header.length == info.length as u64
                    && header.slot == handle.slot
                    && header.generation == handle.generation
                    && usize::from(header.alignment) == info.alignment
                    && AllocOrigin::from_u8(header.origin) == Some(info.origin);

                if header.tag_state() == TagState::Freed
                    && classify_trailer(trailer) == TagState::Freed
                {
                    pending.push(Diagnostic::new(info.name, HeapError::DoubleFree));
                } else if !header_ok {
                    let outcome = scan(&mut registry, Some(addr));
                    if self.absorb_scan(outcome, addr, &mut pending) != TargetFate::RemovedAsCorrupt {
                        pending.push(Diagnostic::new(info.name, HeapError::HeaderCorrupt));
                    }
                } else if classify_trailer(trailer) != TagState::Live {
                    pending.push(Diagnostic::new(info.name, HeapError::EndCorrupt));
                    let outcome = scan(&mut registry, Some(addr));
                    self.absorb_scan(outcome, addr, &mut pending);
                } else {
                    if let Some(expected) = expected {
                        if expected != info.origin {
                            pending.push(Diagnostic::new(
                                info.name,
                                HeapError::OriginMismatch {
                                    operation: "deallocate",
                                    origin: info.origin,
                                },
                            ));
                        }
                    }
                    if self.leak_check_ran.load(Ordering::Relaxed) {
                        pending.push(Diagnostic::new(
                            info.name,
                            HeapError::FreeAfterLeakDetection,
                        ));
                    }
                    let mut freed = header;
                    freed.mark_freed();
                    // SAFETY: as above; the block is still registered.
                    unsafe {
                        if self.poison_fill_enabled() {
                            ptr::write_bytes(payload.as_ptr(), POISON_BYTE, info.length);
                        }
                        write_header(payload, freed);
                        write_trailer(payload, info.length, GuardTag::FREED);
                    }
                    if let Some(record) = registry.remove(handle) {
                        self.forget(&record);
                    }
                    registry.note_freed(addr);
                    HeapMetrics::inc(&self.metrics.frees);
                    to_release = NonNull::new(raw as *mut u8).map(|raw| (raw, layout));
                }
            }
        }
        drop(registry);

        if let Some((raw, layout)) = to_release {
            // SAFETY: `raw` came from this system heap with `layout` and has
            // just left the registry, so nothing else references it.
            unsafe { self.system.deallocate(raw, layout) };
        }
        self.emit(pending);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn with_block<T>(&self, ptr: *const u8, f: impl FnOnce(&BlockRecord) -> T) -> Option<T> {
        let registry = self.registry.lock();
        let handle = registry.lookup(ptr as usize)?;
        registry.get(handle).map(f)
    }

    /// Usable payload length of a live block (the requested length rounded
    /// up to 4), or 0 for anything else.
    #[must_use]
    pub fn size_of(&self, ptr: *const u8) -> usize {
        self.with_block(ptr, |r| r.length).unwrap_or(0)
    }

    #[must_use]
    pub fn name_of(&self, ptr: *const u8) -> Option<&'static str> {
        self.with_block(ptr, |r| r.name)
    }

    /// Relabel a live block. Returns `false` if `ptr` is not live.
    pub fn rename(&self, ptr: *const u8, name: &'static str) -> bool {
        let mut registry = self.registry.lock();
        match registry.lookup(ptr as usize) {
            Some(handle) => registry.rename(handle, name),
            None => false,
        }
    }

    /// Requested alignment of a live block, 0 when default-aligned.
    #[must_use]
    pub fn alignment_of(&self, ptr: *const u8) -> Option<usize> {
        self.with_block(ptr, |r| r.alignment)
    }

    #[must_use]
    pub fn origin_of(&self, ptr: *const u8) -> Option<AllocOrigin> {
        self.with_block(ptr, |r| r.origin)
    }

    #[must_use]
    pub fn is_live(&self, ptr: *const u8) -> bool {
        self.with_block(ptr, |_| ()).is_some()
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    #[must_use]
    pub fn current_bytes_in_use(&self) -> u64 {
        self.metrics.bytes_in_use.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_bytes_in_use(&self) -> u64 {
        self.metrics.peak_bytes.load(Ordering::Relaxed)
    }

    /// Lower the peak to the current usage.
    pub fn reset_peak(&self) {
        self.metrics.reset_peak();
    }

    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.metrics.live_blocks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Scan the whole registry, excising a single corrupt block if found.
    pub fn check_registry(&self) -> IntegrityOutcome {
        let mut pending = Pending::new();
        let mut registry = self.registry.lock();
        let outcome = match scan(&mut registry, None) {
            // No target was given, so nothing can be unlinked as one.
            ScanOutcome::Intact | ScanOutcome::TargetUnlinked { .. } => IntegrityOutcome::Intact,
            ScanOutcome::Repaired { name, record } => {
                self.forget(&record);
                HeapMetrics::inc(&self.metrics.repairs);
                pending.push(Diagnostic::new(name, HeapError::HeaderCorrupt));
                IntegrityOutcome::Repaired { name }
            }
            ScanOutcome::MultipleCorrupt { forward, .. } => {
                pending.push(Diagnostic::new(forward, HeapError::MultipleCorrupt));
                IntegrityOutcome::MultipleCorrupt
            }
        };
        drop(registry);
        self.emit(pending);
        outcome
    }

    /// `true` when no block was found corrupt.
    pub fn check_registry_intact(&self) -> bool {
        self.check_registry().is_intact()
    }

    /// Call `f` with every live payload, in allocation order.
    ///
    /// The registry lock is held throughout; `f` must not call back into
    /// this heap.
    pub fn for_each_block(&self, mut f: impl FnMut(NonNull<u8>)) {
        let registry = self.registry.lock();
        for (_, record) in registry.iter() {
            if let Some(payload) = NonNull::new(record.payload as *mut u8) {
                f(payload);
            }
        }
    }

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// Live blocks merged by name, largest total first.
    #[must_use]
    pub fn report_grouped_by_name(&self) -> GroupedReport {
        let registry = self.registry.lock();
        let mut slop = Some(0u64);
        let mut sizes = Vec::with_capacity(registry.len());
        for (_, record) in registry.iter() {
            sizes.push((record.name, record.requested));
            let Some(total) = slop.as_mut() else {
                continue;
            };
            let usable = NonNull::new(record.raw as *mut u8)
                // SAFETY: registered raw allocations are live while the
                // registry lock is held.
                .and_then(|raw| unsafe { self.system.usable_size(raw, record.layout) });
            match usable {
                Some(usable) => *total += usable.saturating_sub(record.layout.size()) as u64,
                None => slop = None,
            }
        }
        drop(registry);

        let total_blocks = sizes.len();
        let total_bytes = sizes.iter().map(|&(_, len)| len as u64).sum();
        GroupedReport {
            entries: group_by_name(sizes),
            total_blocks,
            total_bytes,
            peak_bytes: self.peak_bytes_in_use(),
            slop_bytes: slop,
        }
    }

    /// Every live block, in allocation order.
    #[must_use]
    pub fn dump(&self) -> HeapDump {
        let registry = self.registry.lock();
        let blocks = registry
            .iter()
            .map(|(_, r)| DumpBlock {
                name: r.name.to_string(),
                len: r.requested,
                ptr: r.payload,
                alignment: r.alignment,
                origin: r.origin,
            })
            .collect::<Vec<_>>();
        drop(registry);
        HeapDump {
            bytes_in_use: self.current_bytes_in_use(),
            peak_bytes_in_use: self.peak_bytes_in_use(),
            block_count: self.block_count(),
            blocks,
        }
    }

    /// Render [`dump`](Self::dump) for people or for offline tooling.
    pub fn report_flat(&self, format: ReportFormat) -> serde_json::Result<String> {
        let dump = self.dump();
        match format {
            ReportFormat::Human => Ok(dump.to_human()),
            ReportFormat::Structured => dump.to_json(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Summarize blocks that are still live and mark leak detection as run.
    ///
    /// Frees after this point are still honoured but reported.
    pub fn check_leaks(&self) -> Option<LeakSummary> {
        self.leak_check_ran.store(true, Ordering::Relaxed);
        tracing::trace!("guarded heap leak detection ran");

        let registry = self.registry.lock();
        let sizes: Vec<(&'static str, usize)> =
            registry.iter().map(|(_, r)| (r.name, r.requested)).collect();
        drop(registry);

        if sizes.is_empty() {
            return None;
        }
        let blocks = u32::try_from(sizes.len()).unwrap_or(u32::MAX);
        let bytes = sizes.iter().map(|&(_, len)| len as u64).sum();
        self.emit_one("leak detector", HeapError::Leaked { blocks, bytes });
        Some(LeakSummary {
            blocks,
            bytes,
            groups: group_by_name(sizes),
            fatal: self.config.fail_on_leak,
        })
    }

    #[must_use]
    pub fn leak_detection_has_run(&self) -> bool {
        self.leak_check_ran.load(Ordering::Relaxed)
    }

    /// Forget every live block without releasing its memory.
    ///
    /// Only for process teardown, when no further frees are expected.
    pub fn clear_registry(&self) {
        let mut registry = self.registry.lock();
        registry.clear();
        self.metrics.reset_usage();
    }
}
