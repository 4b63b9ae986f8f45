//! Store Client
//!
//! Every process (and every thread) that exchanges objects holds a
//! [`StoreClient`]. Clients are cheap to clone and all clones share one
//! mapping of the segment. Mutations of the slot table and data region happen
//! under the segment's spin lock, so concurrent `put`/`get` from any number of
//! processes are atomic with respect to each other.

use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::MmapRaw;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use zerocopy::{FromBytes, Ref};

use crate::layout::{self, Control, SegmentHeader, SlotEntry, CONTROL_SIZE};
use crate::{Result, StoreError};

/// How long an operation waits for the segment lock before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// How often a waiter checks whether the lock holder is still alive.
const LOCK_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Identifier of a stored object, unique for the lifetime of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

/// Point-in-time usage figures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub capacity: u64,
    pub used: u64,
    pub live_objects: u64,
    pub slot_count: u32,
}

impl StoreStats {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

pub(crate) struct Segment {
    map: MmapRaw,
    path: PathBuf,
    slot_count: usize,
    capacity: usize,
    data_offset: usize,
}

impl Segment {
    /// Map `path` and read its geometry from the header.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = MmapRaw::map_raw(&file)?;

        if map.len() < CONTROL_SIZE + SegmentHeader::SIZE {
            return Err(StoreError::corrupt("segment shorter than its header"));
        }

        let mut segment = Self {
            map,
            path: path.to_path_buf(),
            slot_count: 0,
            capacity: 0,
            data_offset: 0,
        };

        let header = {
            let _guard = segment.lock()?;
            // SAFETY: the mapping is at least CONTROL_SIZE + SIZE long (checked
            // above) and the header is only written while the lock is held.
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    segment.map.as_ptr().add(CONTROL_SIZE),
                    SegmentHeader::SIZE,
                )
            };
            SegmentHeader::read_from(bytes)
                .ok_or_else(|| StoreError::corrupt("unreadable header"))?
        };
        header.validate()?;

        if (segment.map.len() as u64) < header.segment_len() {
            return Err(StoreError::corrupt(format!(
                "segment is {} bytes, header describes {}",
                segment.map.len(),
                header.segment_len()
            )));
        }

        segment.slot_count = header.slot_count as usize;
        segment.capacity = header.capacity as usize;
        segment.data_offset = header.data_offset as usize;
        Ok(segment)
    }

    /// Write a fresh header into a zero-filled mapping nobody else has seen yet.
    pub(crate) fn format(path: &Path, header: SegmentHeader) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = MmapRaw::map_raw(&file)?;

        if (map.len() as u64) < header.segment_len() {
            return Err(StoreError::allocation(format!(
                "mapped {} bytes, need {}",
                map.len(),
                header.segment_len()
            )));
        }

        let segment = Self {
            map,
            path: path.to_path_buf(),
            slot_count: header.slot_count as usize,
            capacity: header.capacity as usize,
            data_offset: header.data_offset as usize,
        };

        {
            let mut guard = segment.lock()?;
            let parts = guard.parts()?;
            let (mut current, _, _) = parts;
            *current = header;
        }
        segment.map.flush()?;
        Ok(segment)
    }

    fn control(&self) -> &Control {
        // SAFETY: the mapping is page aligned and at least CONTROL_SIZE long;
        // Control is two AtomicU32 words only ever accessed atomically.
        unsafe { &*(self.map.as_ptr() as *const Control) }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.control().closed.load(Ordering::Acquire) != 0
    }

    pub(crate) fn mark_closed(&self) {
        self.control().closed.store(1, Ordering::Release);
    }

    /// Take the segment lock. The lock word holds the pid of its owner so a
    /// lock left behind by a dead process can be taken over.
    fn lock(&self) -> Result<SegmentGuard<'_>> {
        let lock = &self.control().lock;
        let me = std::process::id();
        let started = Instant::now();
        let mut last_check = started;
        let mut spins = 0u32;

        loop {
            let holder = match lock.compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return Ok(SegmentGuard { segment: self }),
                Err(holder) => holder,
            };

            spins = spins.saturating_add(1);
            if spins < 64 {
                std::hint::spin_loop();
                continue;
            }
            std::thread::yield_now();

            let now = Instant::now();
            if holder != 0 && holder != me && now.duration_since(last_check) >= LOCK_CHECK_INTERVAL {
                last_check = now;
                if !process_alive(holder)
                    && lock
                        .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                {
                    warn!(path = ?self.path, holder, "Took over store lock from dead process");
                    return Ok(SegmentGuard { segment: self });
                }
            }
            if now.duration_since(started) >= LOCK_TIMEOUT {
                return Err(StoreError::LockTimeout {
                    holder,
                    waited_ms: LOCK_TIMEOUT.as_millis() as u64,
                });
            }
        }
    }
}

/// Check a pid with the null signal; only a definite "no such process"
/// counts as dead.
fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None::<Signal>), Err(Errno::ESRCH))
}

type Parts<'a> = (
    Ref<&'a mut [u8], SegmentHeader>,
    Ref<&'a mut [u8], [SlotEntry]>,
    &'a mut [u8],
);

struct SegmentGuard<'a> {
    segment: &'a Segment,
}

impl SegmentGuard<'_> {
    /// Header, slot table and data region of the locked segment.
    fn parts(&mut self) -> Result<Parts<'_>> {
        let segment = self.segment;
        let base = segment.map.as_mut_ptr();

        // SAFETY: both ranges lie inside the mapping (checked at open/format),
        // do not overlap each other or the control words, and are only
        // accessed while this guard holds the segment lock.
        let (meta, data) = unsafe {
            (
                std::slice::from_raw_parts_mut(
                    base.add(CONTROL_SIZE),
                    segment.data_offset - CONTROL_SIZE,
                ),
                std::slice::from_raw_parts_mut(base.add(segment.data_offset), segment.capacity),
            )
        };

        let (header, rest) = Ref::<_, SegmentHeader>::new_from_prefix(meta)
            .ok_or_else(|| StoreError::corrupt("misaligned header"))?;
        let table_len = segment.slot_count * SlotEntry::SIZE;
        if rest.len() < table_len {
            return Err(StoreError::corrupt("slot table truncated"));
        }
        let (table, _) = rest.split_at_mut(table_len);
        let slots = Ref::<_, [SlotEntry]>::new_slice(table)
            .ok_or_else(|| StoreError::corrupt("misaligned slot table"))?;

        Ok((header, slots, data))
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        self.segment.control().lock.store(0, Ordering::Release);
    }
}

/// Handle to an attached store segment
#[derive(Clone)]
pub struct StoreClient {
    segment: Arc<Segment>,
    name: Arc<str>,
}

impl fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreClient")
            .field("name", &self.name)
            .field("path", &self.segment.path)
            .finish()
    }
}

impl StoreClient {
    pub(crate) fn from_segment(segment: Segment, name: &str) -> Self {
        Self {
            segment: Arc::new(segment),
            name: Arc::from(name),
        }
    }

    /// Attach to a segment created by [`crate::Store::start_at`].
    pub fn attach(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let segment = Segment::open(path.as_ref())?;
        if segment.is_closed() {
            return Err(StoreError::Closed);
        }
        debug!(client = name, path = ?path.as_ref(), "Attached to store");
        Ok(Self::from_segment(segment, name))
    }

    /// Name used in log events from this client.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing segment file.
    pub fn path(&self) -> &Path {
        &self.segment.path
    }

    pub fn is_closed(&self) -> bool {
        self.segment.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.segment.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Copy `payload` into the segment and return its fresh id.
    ///
    /// Equal payloads are stored twice. Fails with [`StoreError::Full`] when
    /// no slot or no contiguous run of the data region is free; nothing is
    /// evicted to make room.
    pub fn put(&self, payload: &[u8], label: &str) -> Result<ObjectId> {
        self.ensure_open()?;

        let label_bytes = label.as_bytes();
        let label_len = u32::try_from(label_bytes.len())
            .map_err(|_| StoreError::allocation("label longer than u32::MAX bytes"))?;
        let need = layout::footprint(label_len as u64, payload.len() as u64);

        let mut guard = self.segment.lock()?;
        if self.segment.is_closed() {
            return Err(StoreError::Closed);
        }
        let (mut header, mut slots, data) = guard.parts()?;

        let available = header.capacity.saturating_sub(header.used);
        let full = || StoreError::Full {
            requested: need,
            available,
        };

        let index = slots.iter().position(SlotEntry::is_free).ok_or_else(full)?;
        let offset = layout::first_fit(&slots, need, header.capacity).ok_or_else(full)?;

        let start = offset as usize;
        let label_end = start + label_bytes.len();
        data[start..label_end].copy_from_slice(label_bytes);
        data[label_end..label_end + payload.len()].copy_from_slice(payload);

        let id = header.next_id;
        header.next_id += 1;
        header.live += 1;
        header.used += need;
        slots[index] = SlotEntry {
            id,
            offset,
            len: payload.len() as u64,
            label_len,
            refcount: 1,
        };

        trace!(client = %self.name, id, label, bytes = payload.len(), "Object stored");
        Ok(ObjectId(id))
    }

    /// Copy of the most recent live object stored under `label`.
    pub fn get(&self, label: &str) -> Result<Vec<u8>> {
        self.ensure_open()?;

        let mut guard = self.segment.lock()?;
        if self.segment.is_closed() {
            return Err(StoreError::Closed);
        }
        let (_, slots, data) = guard.parts()?;

        let wanted = label.as_bytes();
        let found = slots
            .iter()
            .filter(|slot| !slot.is_free() && slot.label_len as usize == wanted.len())
            .filter(|slot| {
                let start = slot.offset as usize;
                &data[start..start + wanted.len()] == wanted
            })
            .max_by_key(|slot| slot.id)
            .copied()
            .ok_or_else(|| StoreError::not_found(label))?;

        Ok(payload_of(&found, data).to_vec())
    }

    /// Copy of the object with the given id.
    pub fn get_id(&self, id: ObjectId) -> Result<Vec<u8>> {
        self.ensure_open()?;

        let mut guard = self.segment.lock()?;
        if self.segment.is_closed() {
            return Err(StoreError::Closed);
        }
        let (_, slots, data) = guard.parts()?;

        let slot = live_slot(&slots, id)?;
        Ok(payload_of(slot, data).to_vec())
    }

    /// Label the object was stored under.
    pub fn label_of(&self, id: ObjectId) -> Result<String> {
        self.ensure_open()?;

        let mut guard = self.segment.lock()?;
        let (_, slots, data) = guard.parts()?;
        let slot = live_slot(&slots, id)?;

        let start = slot.offset as usize;
        let bytes = &data[start..start + slot.label_len as usize];
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Increment the reference count, returning the new count.
    pub fn retain(&self, id: ObjectId) -> Result<u32> {
        self.ensure_open()?;

        let mut guard = self.segment.lock()?;
        let (_, mut slots, _) = guard.parts()?;
        let index = live_index(&slots, id)?;
        let slot = &mut slots[index];

        slot.refcount = slot.refcount.saturating_add(1);
        Ok(slot.refcount)
    }

    /// Decrement the reference count, freeing the object when it reaches
    /// zero. Returns the remaining count.
    pub fn release(&self, id: ObjectId) -> Result<u32> {
        self.ensure_open()?;

        let mut guard = self.segment.lock()?;
        let (mut header, mut slots, _) = guard.parts()?;
        let index = live_index(&slots, id)?;
        let slot = &mut slots[index];

        slot.refcount = slot.refcount.saturating_sub(1);
        let remaining = slot.refcount;
        if remaining == 0 {
            let freed = slot.footprint();
            *slot = SlotEntry::default();
            header.live = header
                .live
                .checked_sub(1)
                .ok_or_else(|| StoreError::corrupt("live object count underflow"))?;
            header.used = header.used.saturating_sub(freed);
            trace!(client = %self.name, id = id.0, bytes = freed, "Object freed");
        }
        Ok(remaining)
    }

    /// Serialize `value` with bincode and store it.
    pub fn put_value<T: Serialize>(&self, value: &T, label: &str) -> Result<ObjectId> {
        let bytes = bincode::serialize(value)?;
        self.put(&bytes, label)
    }

    pub fn get_value<T: DeserializeOwned>(&self, label: &str) -> Result<T> {
        let bytes = self.get(label)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn get_value_id<T: DeserializeOwned>(&self, id: ObjectId) -> Result<T> {
        let bytes = self.get_id(id)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.ensure_open()?;

        let mut guard = self.segment.lock()?;
        let (header, _, _) = guard.parts()?;
        Ok(StoreStats {
            capacity: header.capacity,
            used: header.used,
            live_objects: header.live,
            slot_count: header.slot_count,
        })
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.segment
    }
}

/// Index of the live slot holding `id`. Free slots carry id 0, which is
/// never handed out.
fn live_index(slots: &[SlotEntry], id: ObjectId) -> Result<usize> {
    slots
        .iter()
        .position(|slot| !slot.is_free() && slot.id == id.0)
        .ok_or_else(|| StoreError::not_found(id))
}

fn live_slot(slots: &[SlotEntry], id: ObjectId) -> Result<&SlotEntry> {
    live_index(slots, id).map(|index| &slots[index])
}

fn payload_of<'a>(slot: &SlotEntry, data: &'a [u8]) -> &'a [u8] {
    let start = slot.offset as usize + slot.label_len as usize;
    &data[start..start + slot.len as usize]
}
