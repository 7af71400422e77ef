#![no_main]
use guardalloc_core::{AllocOrigin, GuardedHeap, HeapConfig};
use libfuzzer_sys::fuzz_target;

// Operation stream: 4-byte records of (op, size lo, size hi, slot).
fuzz_target!(|data: &[u8]| {
    let heap = GuardedHeap::with_config(HeapConfig::new().with_poison_fill(data.first() == Some(&0)));
    heap.set_error_callback(|d| {
        // Only the deliberate misuse below may be reported.
        assert!(
            matches!(d.error.kind(), "double_free" | "null_free" | "illegal_pointer"),
            "unexpected diagnostic: {d}"
        );
    });
    let mut live: Vec<Option<std::ptr::NonNull<u8>>> = vec![None; 16];
    let mut freed: Vec<*mut u8> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let slot = chunk[3] as usize % live.len();

        match (chunk[0] % 7, live[slot]) {
            (0, None) => live[slot] = heap.allocate(size, "fuzz"),
            (1, None) => live[slot] = heap.allocate_zeroed(size, "fuzz zeroed"),
            (2, None) => {
                let alignment = 1usize << (chunk[0] as usize % 10);
                live[slot] = heap.allocate_aligned(size, alignment, "fuzz aligned", AllocOrigin::Raw);
            }
            (3, Some(p)) => live[slot] = heap.reallocate(p.as_ptr(), size, "fuzz"),
            (4, Some(p)) => {
                if let Some(free_slot) = live.iter().position(Option::is_none) {
                    live[free_slot] = heap.duplicate(p.as_ptr());
                }
            }
            (5, Some(p)) => {
                heap.deallocate(p.as_ptr(), AllocOrigin::Raw);
                freed.push(p.as_ptr());
                live[slot] = None;
            }
            (6, Some(p)) => {
                heap.deallocate(p.as_ptr().wrapping_add(1), AllocOrigin::Raw);
            }
            (6, None) => {
                // Only addresses not handed out again are stale.
                if let Some(&stale) = freed.last() {
                    if !heap.is_live(stale) {
                        heap.deallocate(stale, AllocOrigin::Raw);
                    }
                }
            }
            _ => {}
        }
        assert!(heap.check_registry_intact());
    }

    let expected = live.iter().flatten().count() as u32;
    assert_eq!(heap.block_count(), expected);
    for p in live.into_iter().flatten() {
        heap.deallocate(p.as_ptr(), AllocOrigin::Raw);
    }
    assert_eq!(heap.current_bytes_in_use(), 0);
});
