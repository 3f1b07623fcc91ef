//! Segment layout: header, slot array and the attach-time fingerprint
//!
//! ```text
//! +---------------------------+ 0
//! | geometry (immutable)      |   magic, version, capacity, slot size, fingerprint
//! | lock line                 |   owner word, recovery counter
//! | ring line                 |   head, tail, count, in-flight journal
//! | counters line             |   lifetime statistics
//! +---------------------------+ 256
//! | slot 0: len u32 | payload |   `slot_stride` bytes each
//! | slot 1                    |
//! | ...                       |
//! +---------------------------+ rounded up to the page size
//! ```

use crate::error::{QueueError, Result};
use crate::lock::RobustLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// "VNMQUEUE" in little-endian byte order
pub const QUEUE_MAGIC: u64 = u64::from_le_bytes(*b"VNMQUEUE");

/// Bumped whenever the binary layout changes
pub const QUEUE_VERSION: u32 = 1;

/// Cache line size
pub const CACHE_LINE_SIZE: usize = 64;

/// Size of the per-slot length field
pub const LEN_FIELD_SIZE: usize = std::mem::size_of::<u32>();

/// Alignment of every slot start
const SLOT_ALIGN: usize = 8;

/// Ensures the wrapped value is on its own cache line
#[repr(C, align(64))]
pub struct CacheAligned<T>(pub T);

/// Operation recorded while the lock is held
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Journal {
    Idle = 0,
    Push = 1,
    Pop = 2,
}

impl Journal {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Journal::Idle),
            1 => Some(Journal::Push),
            2 => Some(Journal::Pop),
            _ => None,
        }
    }
}

/// Ring indices, only mutated under the lock
#[repr(C)]
pub struct RingState {
    pub head: AtomicU64,
    pub tail: AtomicU64,
    pub count: AtomicU64,
    pub journal: AtomicU32,
    _reserved: u32,
}

/// Lifetime counters shared by every attached process
#[repr(C)]
pub struct Counters {
    pub total_pushed: AtomicU64,
    pub total_popped: AtomicU64,
    pub full_events: AtomicU64,
    pub empty_events: AtomicU64,
}

/// Header at the start of every queue segment
#[repr(C)]
pub struct SegmentHeader {
    /// Written last during creation; zero means "not initialized yet"
    magic: AtomicU64,
    version: u32,
    fingerprint: u32,
    capacity: u64,
    slot_size: u64,
    slot_stride: u64,
    slots_offset: u64,
    _reserved: [u64; 2],

    pub lock: CacheAligned<RobustLock>,
    pub ring: CacheAligned<RingState>,
    pub counters: CacheAligned<Counters>,
}

/// Size of the header in bytes
pub const HEADER_SIZE: usize = std::mem::size_of::<SegmentHeader>();

const _: () = assert!(HEADER_SIZE == 4 * CACHE_LINE_SIZE);
const _: () = assert!(std::mem::align_of::<SegmentHeader>() == CACHE_LINE_SIZE);

/// Byte geometry derived from a capacity and slot size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub capacity: u64,
    pub slot_size: u64,
    pub slot_stride: u64,
    pub slots_offset: u64,
    pub total_size: usize,
}

impl Geometry {
    /// Compute the layout for `capacity` slots of `slot_size` payload bytes.
    pub fn new(capacity: usize, slot_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(QueueError::InvalidArgument("capacity must be non-zero"));
        }
        if slot_size == 0 {
            return Err(QueueError::InvalidArgument("slot_size must be non-zero"));
        }
        if slot_size > u32::MAX as usize {
            return Err(QueueError::InvalidArgument("slot_size does not fit the length field"));
        }

        let too_large = QueueError::InvalidArgument("queue size overflows the address space");
        let stride = align_up(slot_size + LEN_FIELD_SIZE, SLOT_ALIGN).ok_or(too_large)?;
        let total = capacity
            .checked_mul(stride)
            .and_then(|slots| slots.checked_add(HEADER_SIZE))
            .and_then(|raw| align_up(raw, page_size()))
            .ok_or(QueueError::InvalidArgument("queue size overflows the address space"))?;

        Ok(Self {
            capacity: capacity as u64,
            slot_size: slot_size as u64,
            slot_stride: stride as u64,
            slots_offset: HEADER_SIZE as u64,
            total_size: total,
        })
    }

    /// CRC-32 over every field that defines how the segment is interpreted
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&QUEUE_VERSION.to_le_bytes());
        hasher.update(&self.capacity.to_le_bytes());
        hasher.update(&self.slot_size.to_le_bytes());
        hasher.update(&self.slot_stride.to_le_bytes());
        hasher.update(&self.slots_offset.to_le_bytes());
        hasher.finalize()
    }
}

impl SegmentHeader {
    /// Initialize a freshly created, zero-filled segment.
    ///
    /// # Safety
    /// `ptr` must point to at least `geometry.total_size` writable bytes that
    /// no other process interprets yet.
    pub unsafe fn init(ptr: *mut Self, geometry: &Geometry) {
        std::ptr::write_bytes(ptr.cast::<u8>(), 0, HEADER_SIZE);

        let header = &mut *ptr;
        header.version = QUEUE_VERSION;
        header.capacity = geometry.capacity;
        header.slot_size = geometry.slot_size;
        header.slot_stride = geometry.slot_stride;
        header.slots_offset = geometry.slots_offset;
        header.fingerprint = geometry.fingerprint();
        RobustLock::init(&mut header.lock.0);

        // Publish: attachers treat a non-zero magic as "fully initialized"
        header.magic.store(QUEUE_MAGIC, Ordering::Release);
    }

    /// Whether the creator has finished [`SegmentHeader::init`]
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.magic.load(Ordering::Acquire) != 0
    }

    /// Validate magic, version and fingerprint and return the stored geometry.
    ///
    /// `mapped_size` is the size of the caller's mapping; a segment that claims
    /// more slots than it actually has is rejected.
    pub fn validate(&self, mapped_size: usize) -> Result<Geometry> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != QUEUE_MAGIC {
            return Err(QueueError::InvalidMagic {
                expected: QUEUE_MAGIC,
                found: magic,
            });
        }
        if self.version != QUEUE_VERSION {
            return Err(QueueError::IncompatibleVersion {
                expected: QUEUE_VERSION,
                found: self.version,
            });
        }

        let geometry = Geometry::new(self.capacity as usize, self.slot_size as usize)?;
        if geometry.slot_stride != self.slot_stride || geometry.slots_offset != self.slots_offset {
            return Err(QueueError::FingerprintMismatch {
                expected: geometry.fingerprint(),
                found: self.fingerprint,
            });
        }
        let expected = geometry.fingerprint();
        if expected != self.fingerprint {
            return Err(QueueError::FingerprintMismatch {
                expected,
                found: self.fingerprint,
            });
        }
        if geometry.total_size > mapped_size {
            return Err(QueueError::Corrupted(format!(
                "segment is {} bytes, layout needs {}",
                mapped_size, geometry.total_size
            )));
        }
        Ok(geometry)
    }

    #[inline]
    pub fn magic(&self) -> u64 {
        self.magic.load(Ordering::Acquire)
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Allocation granularity of the platform
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}
