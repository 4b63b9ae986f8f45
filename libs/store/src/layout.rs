//! Segment Layout
//!
//! A store segment is a single file mapped by every attached process:
//!
//! ```text
//! +---------+----------------+---------------------------+-----------------+
//! | control | SegmentHeader  | SlotEntry x slot_count    | data region     |
//! | 8 bytes | 56 bytes       | 32 bytes each             | capacity bytes  |
//! +---------+----------------+---------------------------+-----------------+
//! ```
//!
//! The control word holds the cross-process spin lock and the closed flag and
//! is only ever touched through atomics. Header and slot table are plain
//! `#[repr(C)]` records accessed with `zerocopy` while the lock is held.
//! Each live object occupies one slot and one contiguous run of the data
//! region holding its label bytes followed by its payload.

use std::sync::atomic::AtomicU32;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{Result, StoreError};

/// Bytes reserved at the start of the segment for [`Control`].
pub const CONTROL_SIZE: usize = std::mem::size_of::<Control>();

/// Allocation granularity inside the data region.
pub const ALIGN: u64 = 8;

/// Lock and lifecycle words shared by every attached process.
#[repr(C)]
pub struct Control {
    pub lock: AtomicU32,
    pub closed: AtomicU32,
}

/// Fixed segment header following the control words.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct SegmentHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub slot_count: u32,
    /// Size of the data region in bytes
    pub capacity: u64,
    /// Offset of the data region from the start of the segment
    pub data_offset: u64,
    /// Next object id to hand out; ids start at 1 and never repeat
    pub next_id: u64,
    /// Number of live objects
    pub live: u64,
    /// Bytes of the data region in use, including alignment padding
    pub used: u64,
}

impl SegmentHeader {
    pub const MAGIC: [u8; 8] = *b"NEXSTORE";
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(slot_count: u32, capacity: u64) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            slot_count,
            capacity,
            data_offset: data_offset(slot_count) as u64,
            next_id: 1,
            live: 0,
            used: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(StoreError::corrupt("bad magic"));
        }
        if self.version != Self::VERSION {
            return Err(StoreError::corrupt(format!(
                "unsupported segment version {}",
                self.version
            )));
        }
        if self.data_offset != data_offset(self.slot_count) as u64 {
            return Err(StoreError::corrupt("data offset does not match slot table"));
        }
        Ok(())
    }

    /// Total mapped size of a segment described by this header.
    pub fn segment_len(&self) -> u64 {
        self.data_offset + self.capacity
    }
}

/// One entry of the slot table. `id == 0` marks a free slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct SlotEntry {
    pub id: u64,
    pub offset: u64,
    pub len: u64,
    pub label_len: u32,
    pub refcount: u32,
}

impl SlotEntry {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn is_free(&self) -> bool {
        self.id == 0
    }

    /// Bytes this entry occupies in the data region.
    pub fn footprint(&self) -> u64 {
        footprint(self.label_len as u64, self.len)
    }
}

/// Aligned size of a label plus payload.
pub fn footprint(label_len: u64, payload_len: u64) -> u64 {
    let raw = (label_len + payload_len).max(ALIGN);
    raw.div_ceil(ALIGN) * ALIGN
}

/// Offset of the data region for a table of `slot_count` entries.
pub fn data_offset(slot_count: u32) -> usize {
    let end = CONTROL_SIZE + SegmentHeader::SIZE + slot_count as usize * SlotEntry::SIZE;
    end.div_ceil(64) * 64
}

/// Slot table size derived from the data capacity.
pub fn slot_count_for(capacity: u64) -> u32 {
    (capacity / 512).clamp(64, 65_536) as u32
}

/// First-fit placement of `need` bytes among the live entries.
pub fn first_fit(slots: &[SlotEntry], need: u64, capacity: u64) -> Option<u64> {
    let mut taken: Vec<(u64, u64)> = slots
        .iter()
        .filter(|slot| !slot.is_free())
        .map(|slot| (slot.offset, slot.footprint()))
        .collect();
    taken.sort_unstable();

    let mut cursor = 0u64;
    for (offset, size) in taken {
        if offset.saturating_sub(cursor) >= need {
            return Some(cursor);
        }
        cursor = cursor.max(offset + size);
    }

    (capacity.saturating_sub(cursor) >= need).then_some(cursor)
}
