//! Registry corruption detector.
//!
//! Two walks over the registry, one from each end, each stopping at the
//! first block whose header tags are not live:
//!
//! - walks stop at different blocks: more than one block is corrupt; the
//!   registry is left as it is.
//! - both reach the end: the list is intact. When a target payload was
//!   given, it is searched for by identity and, if registered, spliced out.
//! - both stop at the same block: exactly one block is corrupt. It sits
//!   between the last good block of each walk, which are linked directly to
//!   each other. The corrupt block's memory is not released; its framing can
//!   no longer be trusted.
//!
//! The offender is named through the last good predecessor's cached
//! successor name, falling back to the record's own name at the head.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::layout::{TagState, read_header};
use crate::registry::{BlockRecord, Registry};

/// What a scan found and did.
#[derive(Debug)]
pub(crate) enum ScanOutcome {
    /// Every block carries live tags; no target, or the target is not
    /// registered.
    Intact,
    /// Every block carries live tags; the target was spliced out.
    TargetUnlinked {
        name: &'static str,
        record: BlockRecord,
    },
    /// One corrupt block was spliced out.
    Repaired {
        name: &'static str,
        record: BlockRecord,
    },
    /// The two walks disagree.
    MultipleCorrupt {
        forward: &'static str,
        backward: &'static str,
    },
}

/// Public summary of a whole-registry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityOutcome {
    Intact,
    /// A single corrupt block was found and removed from the registry.
    Repaired { name: &'static str },
    /// Several blocks are corrupt; nothing was repaired.
    MultipleCorrupt,
}

impl IntegrityOutcome {
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        matches!(self, Self::Intact)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

/// Header tags of a registered block are live.
fn tags_live(record: &BlockRecord) -> bool {
    let Some(payload) = NonNull::new(record.payload as *mut u8) else {
        return false;
    };
    // SAFETY: registered blocks are live allocations owned by the heap; their
    // header bytes stay readable until the record is unlinked, and the
    // registry lock is held by the caller.
    let header = unsafe { read_header(payload) };
    header.tag_state() == TagState::Live
}

/// Returns `(last_ok, first_fail)` for one direction.
fn walk(registry: &Registry, direction: Direction) -> (Option<u32>, Option<u32>) {
    let mut ok = None;
    let mut cursor = match direction {
        Direction::Forward => registry.head(),
        Direction::Backward => registry.tail(),
    };
    while let Some(slot) = cursor {
        let record = registry.record(slot);
        if !tags_live(record) {
            return (ok, Some(slot));
        }
        ok = Some(slot);
        cursor = match direction {
            Direction::Forward => record.next(),
            Direction::Backward => record.prev(),
        };
    }
    (ok, None)
}

/// Find `target` by identity, returning `(predecessor, slot)`.
fn find_target(registry: &Registry, target: usize) -> Option<(Option<u32>, u32)> {
    let mut ok = None;
    for (slot, record) in registry.iter() {
        if record.payload == target {
            return Some((ok, slot));
        }
        ok = Some(slot);
    }
    None
}

fn offender_name(registry: &Registry, forward_ok: Option<u32>, bad: u32) -> &'static str {
    forward_ok
        .and_then(|ok| registry.record(ok).cached_next_name)
        .unwrap_or_else(|| registry.record(bad).name)
}

/// Splice `bad` out by linking `forward_ok` to `backward_ok`.
fn splice(
    registry: &mut Registry,
    forward_ok: Option<u32>,
    bad: u32,
    backward_ok: Option<u32>,
) -> BlockRecord {
    debug_assert_eq!(registry.record(bad).prev(), forward_ok);
    debug_assert_eq!(registry.record(bad).next(), backward_ok);
    registry.unlink(bad)
}

/// Scan the registry, optionally searching for `target` (a payload address).
pub(crate) fn scan(registry: &mut Registry, target: Option<usize>) -> ScanOutcome {
    let (forward_ok, forward_fail) = walk(registry, Direction::Forward);
    let (backward_ok, backward_fail) = walk(registry, Direction::Backward);

    if forward_fail != backward_fail {
        let label = |slot: Option<u32>| slot.map_or("(end of list)", |s| registry.record(s).name);
        return ScanOutcome::MultipleCorrupt {
            forward: label(forward_fail),
            backward: label(backward_fail),
        };
    }

    match forward_fail {
        Some(bad) => {
            let name = offender_name(registry, forward_ok, bad);
            let record = splice(registry, forward_ok, bad, backward_ok);
            ScanOutcome::Repaired { name, record }
        }
        None => {
            let Some(target) = target else {
                return ScanOutcome::Intact;
            };
            let Some((forward_ok, slot)) = find_target(registry, target) else {
                return ScanOutcome::Intact;
            };
            let name = offender_name(registry, forward_ok, slot);
            let backward_ok = registry.record(slot).next();
            let record = splice(registry, forward_ok, slot, backward_ok);
            ScanOutcome::TargetUnlinked { name, record }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{AllocOrigin, BlockHeader, HEADER_SIZE, write_header};
    use std::alloc::Layout;

    /// Fake blocks: a header area followed by a payload byte.
    struct Blocks {
        bufs: Vec<Box<[u8; HEADER_SIZE + 8]>>,
        registry: Registry,
    }

    impl Blocks {
        fn new(names: &[&'static str]) -> Self {
            let mut bufs = Vec::new();
            let mut registry = Registry::new();
            for &name in names {
                let mut buf = Box::new([0u8; HEADER_SIZE + 8]);
                let payload = NonNull::new(buf.as_mut_ptr().wrapping_add(HEADER_SIZE)).unwrap();
                let record = BlockRecord::new(
                    payload.as_ptr() as usize,
                    buf.as_ptr() as usize,
                    Layout::from_size_align(HEADER_SIZE + 8, 16).unwrap(),
                    4,
                    4,
                    0,
                    AllocOrigin::Raw,
                    name,
                );
                let handle = registry.insert(record);
                // SAFETY: buf holds HEADER_SIZE bytes before payload.
                unsafe {
                    write_header(
                        payload,
                        BlockHeader::live(4, handle.slot, handle.generation, 0, AllocOrigin::Raw),
                    );
                }
                bufs.push(buf);
            }
            Self { bufs, registry }
        }

        fn corrupt(&mut self, index: usize) {
            self.bufs[index][0] ^= 0x5A;
        }

        fn payload(&self, index: usize) -> usize {
            self.bufs[index].as_ptr() as usize + HEADER_SIZE
        }

        fn names(&self) -> Vec<&'static str> {
            self.registry.iter().map(|(_, r)| r.name).collect()
        }
    }

    #[test]
    fn intact_registry_without_target() {
        let mut blocks = Blocks::new(&["a", "b", "c"]);
        assert!(matches!(
            scan(&mut blocks.registry, None),
            ScanOutcome::Intact
        ));
        assert_eq!(blocks.names(), ["a", "b", "c"]);
    }

    #[test]
    fn single_interior_corruption_is_spliced_out() {
        let mut blocks = Blocks::new(&["a", "b", "c", "d"]);
        blocks.corrupt(2);
        match scan(&mut blocks.registry, None) {
            ScanOutcome::Repaired { name, record } => {
                assert_eq!(name, "c");
                assert_eq!(record.payload, blocks.payload(2));
            }
            other => panic!("expected repair, got {other:?}"),
        }
        assert_eq!(blocks.names(), ["a", "b", "d"]);
        assert!(matches!(
            scan(&mut blocks.registry, None),
            ScanOutcome::Intact
        ));
    }

    #[test]
    fn corrupt_head_and_tail_are_repairable() {
        let mut blocks = Blocks::new(&["a", "b", "c"]);
        blocks.corrupt(0);
        assert!(matches!(
            scan(&mut blocks.registry, None),
            ScanOutcome::Repaired { name: "a", .. }
        ));
        blocks.corrupt(2);
        assert!(matches!(
            scan(&mut blocks.registry, None),
            ScanOutcome::Repaired { name: "c", .. }
        ));
        assert_eq!(blocks.names(), ["b"]);
    }

    #[test]
    fn two_corrupt_blocks_are_not_repaired() {
        let mut blocks = Blocks::new(&["a", "b", "c", "d"]);
        blocks.corrupt(1);
        blocks.corrupt(3);
        match scan(&mut blocks.registry, None) {
            ScanOutcome::MultipleCorrupt { forward, backward } => {
                assert_eq!(forward, "b");
                assert_eq!(backward, "d");
            }
            other => panic!("expected multiple corruption, got {other:?}"),
        }
        assert_eq!(blocks.registry.len(), 4);
    }

    #[test]
    fn target_in_intact_registry_is_unlinked() {
        let mut blocks = Blocks::new(&["a", "b", "c"]);
        let target = blocks.payload(1);
        match scan(&mut blocks.registry, Some(target)) {
            ScanOutcome::TargetUnlinked { name, record } => {
                assert_eq!(name, "b");
                assert_eq!(record.payload, target);
            }
            other => panic!("expected unlink, got {other:?}"),
        }
        assert_eq!(blocks.names(), ["a", "c"]);
    }

    #[test]
    fn unknown_target_leaves_registry_alone() {
        let mut blocks = Blocks::new(&["a", "b"]);
        assert!(matches!(
            scan(&mut blocks.registry, Some(0xDEAD_BEE0)),
            ScanOutcome::Intact
        ));
        assert_eq!(blocks.registry.len(), 2);
    }

    #[test]
    fn outcome_summary() {
        assert!(IntegrityOutcome::Intact.is_intact());
        assert!(!IntegrityOutcome::MultipleCorrupt.is_intact());
        assert!(!IntegrityOutcome::Repaired { name: "x" }.is_intact());
    }
}
