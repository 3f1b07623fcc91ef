//! Bounded FIFO over the segment's slot array
//!
//! Every mutation runs under the segment's [`RobustLock`]. The critical
//! sections are ordered so that a process dying inside one leaves state the
//! next lock holder can repair:
//!
//! - push: slot bytes, slot length, `count + 1`, `tail + 1`
//! - pop: copy out, `count - 1`, `head + 1`
//!
//! The journal word records which of the two was in flight. After a crash
//! only the index can lag behind `count`, and it is recomputed from the
//! other index and `count`.
//!
//! [`RobustLock`]: crate::lock::RobustLock

use crate::error::{QueueError, Result};
use crate::layout::{Counters, Geometry, Journal, RingState, SegmentHeader, LEN_FIELD_SIZE};
use crate::lock::LockGuard;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::warn;

/// Snapshot of the ring indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub head: u64,
    pub tail: u64,
    pub count: u64,
}

/// Process-local view of a ring living in shared memory.
///
/// Only the immutable geometry is cached; head, tail and count are always
/// read from the segment.
pub struct Ring {
    header: NonNull<SegmentHeader>,
    slots: NonNull<u8>,
    capacity: u64,
    slot_size: usize,
    stride: usize,
}

// SAFETY: all shared state is accessed through atomics under the cross-process lock
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Create a ring view over an initialized segment.
    ///
    /// # Safety
    /// `base` must point to a mapped, validated segment described by
    /// `geometry` that outlives the returned value.
    pub unsafe fn from_raw(base: NonNull<u8>, geometry: &Geometry) -> Self {
        let slots = base.as_ptr().add(geometry.slots_offset as usize);
        Self {
            header: base.cast(),
            slots: NonNull::new_unchecked(slots),
            capacity: geometry.capacity,
            slot_size: geometry.slot_size as usize,
            stride: geometry.slot_stride as usize,
        }
    }

    #[inline(always)]
    fn header(&self) -> &SegmentHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline(always)]
    fn state(&self) -> &RingState {
        &self.header().ring.0
    }

    #[inline(always)]
    fn counters(&self) -> &Counters {
        &self.header().counters.0
    }

    #[inline(always)]
    fn slot_ptr(&self, index: u64) -> *mut u8 {
        debug_assert!(index < self.capacity);
        unsafe { self.slots.as_ptr().add(index as usize * self.stride) }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Take the lock and repair state left behind by a dead holder.
    fn lock(&self) -> Result<LockGuard<'_>> {
        let guard = self.header().lock.0.lock();
        self.repair()?;
        Ok(guard)
    }

    /// Restore `head`/`tail`/`count` consistency after an interrupted section.
    ///
    /// Must be called with the lock held.
    fn repair(&self) -> Result<()> {
        let state = self.state();
        let raw = state.journal.load(Ordering::Acquire);
        let journal = Journal::from_raw(raw)
            .ok_or_else(|| QueueError::Corrupted(format!("unknown journal entry {}", raw)))?;

        let snapshot = self.load_snapshot();
        if snapshot.count > self.capacity
            || snapshot.head >= self.capacity
            || snapshot.tail >= self.capacity
        {
            return Err(QueueError::Corrupted(format!(
                "head {} tail {} count {} with capacity {}",
                snapshot.head, snapshot.tail, snapshot.count, self.capacity
            )));
        }

        match journal {
            Journal::Idle => return Ok(()),
            Journal::Push => {
                let tail = (snapshot.head + snapshot.count) % self.capacity;
                state.tail.store(tail, Ordering::Release);
                warn!(from = snapshot.tail, to = tail, "repaired tail after interrupted push");
            }
            Journal::Pop => {
                let head = (snapshot.tail + self.capacity - snapshot.count) % self.capacity;
                state.head.store(head, Ordering::Release);
                warn!(from = snapshot.head, to = head, "repaired head after interrupted pop");
            }
        }
        state.journal.store(Journal::Idle as u32, Ordering::Release);
        Ok(())
    }

    fn load_snapshot(&self) -> RingSnapshot {
        let state = self.state();
        RingSnapshot {
            head: state.head.load(Ordering::Acquire),
            tail: state.tail.load(Ordering::Acquire),
            count: state.count.load(Ordering::Acquire),
        }
    }

    /// Copy `data` into the slot at `tail`.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.slot_size {
            return Err(QueueError::TooBig {
                len: data.len(),
                max: self.slot_size,
            });
        }

        let _guard = self.lock()?;
        let state = self.state();
        let count = state.count.load(Ordering::Acquire);
        if count == self.capacity {
            self.counters().full_events.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::Full);
        }
        let tail = state.tail.load(Ordering::Acquire);

        state.journal.store(Journal::Push as u32, Ordering::Release);
        unsafe {
            let slot = self.slot_ptr(tail);
            std::ptr::copy_nonoverlapping(data.as_ptr(), slot.add(LEN_FIELD_SIZE), data.len());
            write_len(slot, data.len() as u32);
        }
        state.count.store(count + 1, Ordering::Release);
        state.tail.store((tail + 1) % self.capacity, Ordering::Release);
        state.journal.store(Journal::Idle as u32, Ordering::Release);

        self.counters().total_pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy the message at `head` into `buf` and consume it.
    ///
    /// A buffer smaller than the message fails with
    /// [`QueueError::BufferTooSmall`] and leaves the message queued.
    pub fn pop(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_head(buf, true)
    }

    /// Copy the message at `head` into `buf` without consuming it.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_head(buf, false)
    }

    fn read_head(&self, buf: &mut [u8], consume: bool) -> Result<usize> {
        let _guard = self.lock()?;
        let state = self.state();
        let count = state.count.load(Ordering::Acquire);
        if count == 0 {
            self.counters().empty_events.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::Empty);
        }
        let head = state.head.load(Ordering::Acquire);

        let slot = self.slot_ptr(head);
        let len = unsafe { read_len(slot) } as usize;
        if len > self.slot_size {
            return Err(QueueError::Corrupted(format!(
                "slot {} records {} bytes, slot size is {}",
                head, len, self.slot_size
            )));
        }
        if len > buf.len() {
            return Err(QueueError::BufferTooSmall {
                needed: len,
                capacity: buf.len(),
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(slot.add(LEN_FIELD_SIZE), buf.as_mut_ptr(), len);
        }
        if !consume {
            return Ok(len);
        }

        state.journal.store(Journal::Pop as u32, Ordering::Release);
        state.count.store(count - 1, Ordering::Release);
        state.head.store((head + 1) % self.capacity, Ordering::Release);
        state.journal.store(Journal::Idle as u32, Ordering::Release);

        self.counters().total_popped.fetch_add(1, Ordering::Relaxed);
        Ok(len)
    }

    /// Lock-consistent snapshot of the indices
    pub fn snapshot(&self) -> Result<RingSnapshot> {
        let _guard = self.lock()?;
        Ok(self.load_snapshot())
    }

    /// Number of occupied slots
    pub fn len(&self) -> Result<u64> {
        Ok(self.snapshot()?.count)
    }
}

#[inline(always)]
unsafe fn write_len(slot: *mut u8, len: u32) {
    std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), slot, LEN_FIELD_SIZE);
}

#[inline(always)]
unsafe fn read_len(slot: *const u8) -> u32 {
    let mut bytes = [0u8; LEN_FIELD_SIZE];
    std::ptr::copy_nonoverlapping(slot, bytes.as_mut_ptr(), LEN_FIELD_SIZE);
    u32::from_le_bytes(bytes)
}
