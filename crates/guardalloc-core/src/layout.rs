//! Block framing: guard tags, the in-band header and trailer, and the
//! arithmetic that places a payload inside a raw system-heap allocation.
//!
//! ```plaintext
//! raw base
//! +----------------------+
//! | alignment padding    | alignment_padding(alignment) bytes, 0 when default-aligned
//! +----------------------+
//! | BlockHeader          | HEADER_SIZE bytes
//! +----------------------+ <- payload pointer handed to the caller
//! | payload              | header.length bytes (always a multiple of 4)
//! +----------------------+
//! | trailer tag          | TRAILER_SIZE bytes
//! +----------------------+
//! ```
//!
//! The header is always exactly `HEADER_SIZE` bytes before the payload, so it
//! is recovered in O(1) no matter how much padding precedes it.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

/// Size of the header prepended to every payload.
pub const HEADER_SIZE: usize = 32;

/// Size of the trailer tag appended after the payload.
pub const TRAILER_SIZE: usize = 4;

/// Total framing overhead of a default-aligned block.
pub const TOTAL_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Payload alignment of blocks that did not ask for one.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Smallest alignment the aligned path hands to the system heap.
pub const MIN_ALIGNMENT: usize = std::mem::size_of::<usize>();

/// Alignments must stay strictly below this; the header stores them in 16 bits.
pub const MAX_ALIGNMENT: usize = 1024;

/// Byte written over payloads when poison fill is enabled.
pub const POISON_BYTE: u8 = 0xFF;

const fn tag(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// The guard tag constants.
pub struct GuardTag;

impl GuardTag {
    /// First header tag of a live block.
    pub const HEADER_A: u32 = tag(*b"MEMO");
    /// Second header tag of a live block.
    pub const HEADER_B: u32 = tag(*b"RYBL");
    /// Trailer tag of a live block.
    pub const TRAILER: u32 = tag(*b"OCK!");
    /// Stamped over all three tags when a block is released.
    pub const FREED: u32 = tag(*b"FREE");
}

/// What a set of guard tags says about a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagState {
    Live,
    Freed,
    Corrupt,
}

/// Classify the two header tags. Both must agree.
#[must_use]
pub const fn classify_header(tag_a: u32, tag_b: u32) -> TagState {
    if tag_a == GuardTag::HEADER_A && tag_b == GuardTag::HEADER_B {
        TagState::Live
    } else if tag_a == GuardTag::FREED && tag_b == GuardTag::FREED {
        TagState::Freed
    } else {
        TagState::Corrupt
    }
}

/// Classify the trailer tag.
#[must_use]
pub const fn classify_trailer(tag_c: u32) -> TagState {
    match tag_c {
        GuardTag::TRAILER => TagState::Live,
        GuardTag::FREED => TagState::Freed,
        _ => TagState::Corrupt,
    }
}

/// Which allocation API produced a block.
///
/// Raw byte blocks and typed construct/destruct blocks must be released and
/// resized through the matching API; crossing over is reported as misuse.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AllocOrigin {
    #[default]
    Raw = 0,
    Typed = 1,
}

impl AllocOrigin {
    /// Decode the byte stored in a header.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Raw),
            1 => Some(Self::Typed),
            _ => None,
        }
    }
}

impl fmt::Display for AllocOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw => f.write_str("raw byte"),
            Self::Typed => f.write_str("typed construct"),
        }
    }
}

/// Header stored immediately before every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BlockHeader {
    pub tag_a: u32,
    pub tag_b: u32,
    /// Payload length, rounded up to 4.
    pub length: u64,
    /// Registry slot owning this block.
    pub slot: u32,
    /// Registry slot generation at insertion time.
    pub generation: u32,
    /// 0 when default-aligned, otherwise the requested power of two.
    pub alignment: u16,
    pub origin: u8,
    reserved: [u8; 5],
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == HEADER_SIZE);
const _: () = assert!(HEADER_SIZE % DEFAULT_ALIGNMENT == 0);

impl BlockHeader {
    /// Header for a freshly allocated block.
    #[must_use]
    pub const fn live(
        length: usize,
        slot: u32,
        generation: u32,
        alignment: usize,
        origin: AllocOrigin,
    ) -> Self {
        Self {
            tag_a: GuardTag::HEADER_A,
            tag_b: GuardTag::HEADER_B,
            length: length as u64,
            slot,
            generation,
            alignment: alignment as u16,
            origin: origin as u8,
            reserved: [0; 5],
        }
    }

    #[must_use]
    pub const fn tag_state(&self) -> TagState {
        classify_header(self.tag_a, self.tag_b)
    }

    /// Live tags and a length that keeps the 4-byte invariant.
    #[must_use]
    pub const fn is_intact(&self) -> bool {
        matches!(self.tag_state(), TagState::Live) && self.length % 4 == 0
    }

    pub fn mark_freed(&mut self) {
        self.tag_a = GuardTag::FREED;
        self.tag_b = GuardTag::FREED;
    }
}

/// Round a requested length up to the next multiple of 4.
///
/// Returns `None` when the rounded value does not fit in `usize`.
#[must_use]
pub const fn round_up_4(n: usize) -> Option<usize> {
    match n.checked_add(3) {
        Some(v) => Some(v & !3),
        None => None,
    }
}

/// Bytes inserted before the header so that the payload, which starts
/// `HEADER_SIZE` bytes after the padding, lands on `alignment`.
///
/// `alignment` must be a power of two.
#[must_use]
pub const fn alignment_padding(alignment: usize) -> usize {
    (alignment - HEADER_SIZE % alignment) % alignment
}

/// Validate a caller-supplied alignment and clamp it to the system minimum.
///
/// Returns `None` for non powers of two and for values at or above
/// [`MAX_ALIGNMENT`].
#[must_use]
pub const fn normalize_alignment(alignment: usize) -> Option<usize> {
    if !alignment.is_power_of_two() {
        return None;
    }
    let alignment = if alignment < MIN_ALIGNMENT {
        MIN_ALIGNMENT
    } else {
        alignment
    };
    if alignment >= MAX_ALIGNMENT {
        None
    } else {
        Some(alignment)
    }
}

/// Resolved placement of one block inside its raw allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    /// Padding before the header.
    pub padding: usize,
    /// Payload length, rounded up to 4.
    pub length: usize,
    /// Alignment recorded in the header; 0 for default-aligned blocks.
    pub alignment: usize,
    /// Layout of the whole raw allocation.
    pub layout: Layout,
}

impl BlockLayout {
    /// Compute the layout for `requested` payload bytes.
    ///
    /// `alignment` must already be normalized. Returns `None` when the
    /// framed size overflows.
    #[must_use]
    pub fn new(requested: usize, alignment: Option<usize>) -> Option<Self> {
        let length = round_up_4(requested)?;
        let padding = alignment.map_or(0, alignment_padding);
        let total = padding
            .checked_add(HEADER_SIZE)?
            .checked_add(length)?
            .checked_add(TRAILER_SIZE)?;
        let align = alignment.unwrap_or(DEFAULT_ALIGNMENT);
        let layout = Layout::from_size_align(total, align).ok()?;
        Some(Self {
            padding,
            length,
            alignment: alignment.unwrap_or(0),
            layout,
        })
    }

    /// Offset of the payload from the raw base.
    #[must_use]
    pub const fn payload_offset(&self) -> usize {
        self.padding + HEADER_SIZE
    }
}

/// Read the header in front of `payload`.
///
/// # Safety
///
/// The `HEADER_SIZE` bytes before `payload` must be readable.
#[must_use]
pub unsafe fn read_header(payload: NonNull<u8>) -> BlockHeader {
    // SAFETY: caller guarantees the header bytes are readable; unaligned read
    // because padding arithmetic only guarantees 4-byte placement in general.
    unsafe {
        payload
            .as_ptr()
            .sub(HEADER_SIZE)
            .cast::<BlockHeader>()
            .read_unaligned()
    }
}

/// Write the header in front of `payload`.
///
/// # Safety
///
/// The `HEADER_SIZE` bytes before `payload` must be writable.
pub unsafe fn write_header(payload: NonNull<u8>, header: BlockHeader) {
    // SAFETY: caller guarantees the header bytes are writable.
    unsafe {
        payload
            .as_ptr()
            .sub(HEADER_SIZE)
            .cast::<BlockHeader>()
            .write_unaligned(header);
    }
}

/// Read the trailer tag that follows `length` payload bytes.
///
/// # Safety
///
/// `payload + length .. payload + length + TRAILER_SIZE` must be readable.
#[must_use]
pub unsafe fn read_trailer(payload: NonNull<u8>, length: usize) -> u32 {
    // SAFETY: caller guarantees the trailer bytes are readable.
    unsafe { payload.as_ptr().add(length).cast::<u32>().read_unaligned() }
}

/// Write the trailer tag that follows `length` payload bytes.
///
/// # Safety
///
/// `payload + length .. payload + length + TRAILER_SIZE` must be writable.
pub unsafe fn write_trailer(payload: NonNull<u8>, length: usize, tag: u32) {
    // SAFETY: caller guarantees the trailer bytes are writable.
    unsafe {
        payload
            .as_ptr()
            .add(length)
            .cast::<u32>()
            .write_unaligned(tag);
    }
}
