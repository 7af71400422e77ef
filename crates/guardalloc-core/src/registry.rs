//! Live block registry.
//!
//! A generational arena of block records threaded into a doubly-linked list
//! by slot index. Slots are recycled through a free list; every reuse bumps
//! the slot generation so a stale [`BlockHandle`] never resolves. A side map
//! from payload address to slot gives O(1) lookup of caller pointers without
//! touching their memory.
//!
//! Each record caches the owner name of its successor (`cached_next_name`).
//! The cache is re-derived on every insert, remove and rename and is read
//! only by diagnostics.
//!
//! Not synchronized: the heap keeps the registry behind its mutex.

use std::alloc::Layout;
use std::collections::{HashMap, VecDeque};

use crate::layout::AllocOrigin;

/// Maximum number of released addresses remembered for double-free
/// detection.
pub(crate) const RECENTLY_FREED_MAX: usize = 65_536;

/// Stable reference to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockHandle {
    pub slot: u32,
    pub generation: u32,
}

/// Out-of-band metadata of one live block.
#[derive(Debug, Clone)]
pub(crate) struct BlockRecord {
    /// Address handed to the caller.
    pub payload: usize,
    /// Base of the raw system-heap allocation.
    pub raw: usize,
    /// Layout the raw allocation was made with.
    pub layout: Layout,
    /// Usable payload length (rounded up to 4).
    pub length: usize,
    /// Length the caller asked for.
    pub requested: usize,
    /// 0 when default-aligned.
    pub alignment: usize,
    pub origin: AllocOrigin,
    pub name: &'static str,
    pub cached_next_name: Option<&'static str>,
    prev: Option<u32>,
    next: Option<u32>,
}

impl BlockRecord {
    #[must_use]
    pub fn new(
        payload: usize,
        raw: usize,
        layout: Layout,
        length: usize,
        requested: usize,
        alignment: usize,
        origin: AllocOrigin,
        name: &'static str,
    ) -> Self {
        Self {
            payload,
            raw,
            layout,
            length,
            requested,
            alignment,
            origin,
            name,
            cached_next_name: None,
            prev: None,
            next: None,
        }
    }

    #[must_use]
    pub const fn prev(&self) -> Option<u32> {
        self.prev
    }

    #[must_use]
    pub const fn next(&self) -> Option<u32> {
        self.next
    }
}

struct Slot {
    generation: u32,
    record: Option<BlockRecord>,
}

pub(crate) struct Registry {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    by_addr: HashMap<usize, u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    /// Released address to the sequence number of its latest release.
    recently_freed: HashMap<usize, u64>,
    freed_order: VecDeque<(usize, u64)>,
    freed_seq: u64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_addr: HashMap::new(),
            head: None,
            tail: None,
            len: 0,
            recently_freed: HashMap::new(),
            freed_order: VecDeque::new(),
            freed_seq: 0,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn head(&self) -> Option<u32> {
        self.head
    }

    #[must_use]
    pub const fn tail(&self) -> Option<u32> {
        self.tail
    }

    /// Append a record at the tail.
    pub fn insert(&mut self, mut record: BlockRecord) -> BlockHandle {
        let name = record.name;
        let payload = record.payload;
        record.prev = self.tail;
        record.next = None;
        record.cached_next_name = None;

        let slot = if let Some(slot) = self.free_slots.pop() {
            self.slots[slot as usize].record = Some(record);
            slot
        } else {
            let slot = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            slot
        };

        if let Some(tail) = self.tail {
            let prev = self.record_mut(tail);
            prev.next = Some(slot);
            prev.cached_next_name = Some(name);
        } else {
            self.head = Some(slot);
        }
        self.tail = Some(slot);
        self.len += 1;

        self.by_addr.insert(payload, slot);
        // The entry left in `freed_order` no longer matches and is skipped
        // on eviction.
        self.recently_freed.remove(&payload);

        BlockHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// Unlink and return the record behind `handle`.
    pub fn remove(&mut self, handle: BlockHandle) -> Option<BlockRecord> {
        self.get(handle)?;
        Some(self.unlink(handle.slot))
    }

    /// Unlink the record at `slot`, which must be occupied.
    ///
    /// The predecessor's name cache is re-pointed at the successor.
    pub fn unlink(&mut self, slot: u32) -> BlockRecord {
        let entry = &mut self.slots[slot as usize];
        let record = entry
            .record
            .take()
            .unwrap_or_else(|| unreachable!("unlink of vacant slot {slot}"));
        entry.generation = entry.generation.wrapping_add(1);
        self.free_slots.push(slot);

        let next_name = record.next.map(|next| self.record(next).name);
        match record.prev {
            Some(prev) => {
                let prev = self.record_mut(prev);
                prev.next = record.next;
                prev.cached_next_name = next_name;
            }
            None => self.head = record.next,
        }
        match record.next {
            Some(next) => self.record_mut(next).prev = record.prev,
            None => self.tail = record.prev,
        }
        self.len -= 1;
        self.by_addr.remove(&record.payload);
        record
    }

    /// Remember a released payload address for double-free detection.
    ///
    /// An address only leaves the set when the entry being evicted is its
    /// latest release, so hot reuse of one address cannot evict itself.
    pub fn note_freed(&mut self, payload: usize) {
        self.freed_seq += 1;
        let seq = self.freed_seq;
        self.recently_freed.insert(payload, seq);
        self.freed_order.push_back((payload, seq));
        while self.freed_order.len() > RECENTLY_FREED_MAX {
            let Some((oldest, oldest_seq)) = self.freed_order.pop_front() else {
                break;
            };
            if self.recently_freed.get(&oldest) == Some(&oldest_seq) {
                self.recently_freed.remove(&oldest);
            }
        }
    }

    #[must_use]
    pub fn was_freed(&self, payload: usize) -> bool {
        self.recently_freed.contains_key(&payload)
    }

    /// Resolve a payload address to its handle.
    #[must_use]
    pub fn lookup(&self, payload: usize) -> Option<BlockHandle> {
        let slot = *self.by_addr.get(&payload)?;
        Some(BlockHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        })
    }

    #[must_use]
    pub fn get(&self, handle: BlockHandle) -> Option<&BlockRecord> {
        let entry = self.slots.get(handle.slot as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        entry.record.as_ref()
    }

    /// Record at an occupied slot reached through list links.
    #[must_use]
    pub fn record(&self, slot: u32) -> &BlockRecord {
        self.slots[slot as usize]
            .record
            .as_ref()
            .unwrap_or_else(|| unreachable!("list link to vacant slot {slot}"))
    }

    fn record_mut(&mut self, slot: u32) -> &mut BlockRecord {
        self.slots[slot as usize]
            .record
            .as_mut()
            .unwrap_or_else(|| unreachable!("list link to vacant slot {slot}"))
    }

    /// Change the owner name of a block, keeping the predecessor's cache in
    /// step.
    pub fn rename(&mut self, handle: BlockHandle, name: &'static str) -> bool {
        let Some(record) = self.get(handle) else {
            return false;
        };
        let prev = record.prev;
        self.record_mut(handle.slot).name = name;
        if let Some(prev) = prev {
            self.record_mut(prev).cached_next_name = Some(name);
        }
        true
    }

    /// Walk the list from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &BlockRecord)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let record = self.record(slot);
            cursor = record.next;
            Some((slot, record))
        })
    }

    /// Forget every record and remembered address.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: usize, name: &'static str) -> BlockRecord {
        BlockRecord::new(
            payload,
            payload - 32,
            Layout::from_size_align(64, 16).unwrap(),
            28,
            28,
            0,
            AllocOrigin::Raw,
            name,
        )
    }

    fn names(registry: &Registry) -> Vec<&'static str> {
        registry.iter().map(|(_, r)| r.name).collect()
    }

    fn assert_cache_consistent(registry: &Registry) {
        for (_, r) in registry.iter() {
            let expected = r.next().map(|n| registry.record(n).name);
            assert_eq!(r.cached_next_name, expected, "cache of {}", r.name);
        }
    }

    #[test]
    fn insert_appends_and_maintains_name_cache() {
        let mut registry = Registry::new();
        registry.insert(record(0x1000, "a"));
        registry.insert(record(0x2000, "b"));
        registry.insert(record(0x3000, "c"));
        assert_eq!(names(&registry), ["a", "b", "c"]);
        assert_eq!(registry.len(), 3);
        assert_cache_consistent(&registry);
    }

    #[test]
    fn remove_relinks_neighbours() {
        let mut registry = Registry::new();
        registry.insert(record(0x1000, "a"));
        let b = registry.insert(record(0x2000, "b"));
        registry.insert(record(0x3000, "c"));

        let removed = registry.remove(b).expect("live handle");
        assert_eq!(removed.name, "b");
        assert_eq!(names(&registry), ["a", "c"]);
        assert_cache_consistent(&registry);
        assert!(registry.lookup(0x2000).is_none());
    }

    #[test]
    fn removing_tail_clears_predecessor_cache() {
        let mut registry = Registry::new();
        let a = registry.insert(record(0x1000, "a"));
        let b = registry.insert(record(0x2000, "b"));
        registry.remove(b);
        assert_eq!(registry.get(a).unwrap().cached_next_name, None);
        assert_eq!(registry.tail(), Some(a.slot));
        registry.remove(a);
        assert_eq!(registry.head(), None);
        assert_eq!(registry.tail(), None);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn stale_handles_do_not_resolve_after_slot_reuse() {
        let mut registry = Registry::new();
        let first = registry.insert(record(0x1000, "a"));
        registry.remove(first);
        let second = registry.insert(record(0x2000, "b"));
        assert_eq!(first.slot, second.slot);
        assert_ne!(first.generation, second.generation);
        assert!(registry.get(first).is_none());
        assert!(registry.remove(first).is_none());
        assert_eq!(registry.get(second).unwrap().name, "b");
    }

    #[test]
    fn rename_updates_predecessor_cache() {
        let mut registry = Registry::new();
        registry.insert(record(0x1000, "a"));
        let b = registry.insert(record(0x2000, "b"));
        assert!(registry.rename(b, "renamed"));
        assert_cache_consistent(&registry);
        assert_eq!(registry.get(b).unwrap().name, "renamed");
    }

    #[test]
    fn freed_addresses_are_forgotten_on_reuse() {
        let mut registry = Registry::new();
        registry.note_freed(0x1000);
        assert!(registry.was_freed(0x1000));
        registry.insert(record(0x1000, "again"));
        assert!(!registry.was_freed(0x1000));
    }

    #[test]
    fn freed_set_is_bounded() {
        let mut registry = Registry::new();
        for i in 0..=RECENTLY_FREED_MAX {
            registry.note_freed(0x10 * (i + 1));
        }
        assert!(!registry.was_freed(0x10));
        assert!(registry.was_freed(0x10 * (RECENTLY_FREED_MAX + 1)));
    }

    #[test]
    fn reused_address_survives_window_turnover() {
        let mut registry = Registry::new();
        for _ in 0..RECENTLY_FREED_MAX + 10 {
            let handle = registry.insert(record(0x1000, "hot"));
            registry.remove(handle);
            registry.note_freed(0x1000);
        }
        assert!(registry.was_freed(0x1000));
        assert!(registry.freed_order.len() <= RECENTLY_FREED_MAX);
    }

    #[test]
    fn refreed_address_is_kept_past_its_first_entry() {
        let mut registry = Registry::new();
        registry.note_freed(0x10);
        for i in 1..RECENTLY_FREED_MAX {
            registry.note_freed(0x10 * (i + 1));
        }
        registry.note_freed(0x10);
        registry.note_freed(0x10 * (RECENTLY_FREED_MAX + 1));
        assert!(registry.was_freed(0x10));
        assert!(!registry.was_freed(0x20));
    }
}
