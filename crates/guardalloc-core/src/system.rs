//! The raw system heap underneath the guard layer.
//!
//! The guarded heap never interprets system-heap memory beyond the layout it
//! asked for; the only extra query is `usable_size`, used to report slop.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::ptr::NonNull;

/// Raw allocate / zeroed allocate / release primitive.
///
/// # Safety
///
/// `allocate` and `allocate_zeroed` must return memory valid for reads and
/// writes of `layout.size()` bytes, aligned to `layout.align()`, that stays
/// valid until passed back to `deallocate` with the same layout.
/// `allocate_zeroed` memory must read as zero.
pub unsafe trait SystemHeap: Send + Sync {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from this heap's `allocate`/`allocate_zeroed` with
    /// the same `layout` and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);

    /// Bytes actually usable behind `ptr`, when the heap can tell.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this heap made with `layout`.
    unsafe fn usable_size(&self, ptr: NonNull<u8>, layout: Layout) -> Option<usize> {
        let _ = (ptr, layout);
        None
    }
}

/// The Rust global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdHeap;

// SAFETY: delegates to std::alloc, whose contract matches the trait's.
unsafe impl SystemHeap for StdHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // SAFETY: the guard layer never requests zero-sized layouts.
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() != 0);
        // SAFETY: as above.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller passes a pointer from `allocate*` with its layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// The C library heap: `malloc`/`calloc` for default alignment,
/// `posix_memalign` above it, and `malloc_usable_size` for slop reporting
/// on glibc.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

#[cfg(target_os = "linux")]
impl LibcHeap {
    /// Alignment `malloc` already guarantees.
    const MALLOC_ALIGNMENT: usize = 2 * std::mem::size_of::<usize>();

    fn aligned(layout: Layout) -> Option<NonNull<u8>> {
        let mut out: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: alignment is a power of two multiple of pointer size (the
        // guard layer clamps it), `out` is a valid out-pointer.
        let rc = unsafe { libc::posix_memalign(&mut out, layout.align(), layout.size()) };
        if rc != 0 {
            return None;
        }
        NonNull::new(out.cast::<u8>())
    }
}

// SAFETY: malloc/calloc/posix_memalign return suitably aligned memory that is
// valid until `free`.
#[cfg(target_os = "linux")]
unsafe impl SystemHeap for LibcHeap {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() <= Self::MALLOC_ALIGNMENT {
            // SAFETY: plain malloc of a non-zero size.
            NonNull::new(unsafe { libc::malloc(layout.size()) }.cast::<u8>())
        } else {
            Self::aligned(layout)
        }
    }

    fn allocate_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() <= Self::MALLOC_ALIGNMENT {
            // SAFETY: plain calloc of a non-zero size.
            NonNull::new(unsafe { libc::calloc(1, layout.size()) }.cast::<u8>())
        } else {
            let ptr = Self::aligned(layout)?;
            // SAFETY: fresh allocation of layout.size() bytes.
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
            Some(ptr)
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // SAFETY: every allocation path above is released by free().
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }

    #[cfg(target_env = "gnu")]
    unsafe fn usable_size(&self, ptr: NonNull<u8>, _layout: Layout) -> Option<usize> {
        // SAFETY: caller guarantees `ptr` is a live allocation of this heap.
        Some(unsafe { libc::malloc_usable_size(ptr.as_ptr().cast()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(heap: &dyn SystemHeap, layout: Layout) {
        let ptr = heap.allocate(layout).expect("allocate");
        assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
        // SAFETY: ptr is valid for layout.size() bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, layout.size());
            heap.deallocate(ptr, layout);
        }

        let zeroed = heap.allocate_zeroed(layout).expect("allocate_zeroed");
        // SAFETY: zeroed is valid for layout.size() bytes.
        let bytes = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), layout.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
        // SAFETY: returned to the heap that produced it.
        unsafe { heap.deallocate(zeroed, layout) };
    }

    #[test]
    fn std_heap_honours_layouts() {
        exercise(&StdHeap, Layout::from_size_align(40, 16).unwrap());
        exercise(&StdHeap, Layout::from_size_align(100, 256).unwrap());
        // SAFETY: the pointer is never dereferenced by the default impl.
        let usable = unsafe { StdHeap.usable_size(NonNull::dangling(), Layout::new::<u8>()) };
        assert_eq!(usable, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn libc_heap_honours_layouts() {
        exercise(&LibcHeap, Layout::from_size_align(40, 16).unwrap());
        exercise(&LibcHeap, Layout::from_size_align(100, 512).unwrap());
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn libc_heap_reports_usable_size() {
        let layout = Layout::from_size_align(37, 16).unwrap();
        let ptr = LibcHeap.allocate(layout).expect("allocate");
        // SAFETY: ptr is live and from LibcHeap.
        let usable = unsafe { LibcHeap.usable_size(ptr, layout) }.expect("glibc reports size");
        assert!(usable >= 37);
        // SAFETY: returned to the heap that produced it.
        unsafe { LibcHeap.deallocate(ptr, layout) };
    }
}
