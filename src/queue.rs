//! Process-local queue handle
//!
//! A [`Queue`] maps a named segment and carries the roles it was opened
//! with. Roles are a local capability check only: another process may attach
//! to the same name with any roles it likes.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::layout::{Geometry, SegmentHeader, HEADER_SIZE};
use crate::ring::Ring;
use crate::shm::{Access, QueueName, SharedSegment};
use bitflags::bitflags;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often a create-capable open retries when the name vanishes between
/// "already exists" and the attach
const CREATE_ATTEMPTS: usize = 3;

bitflags! {
    /// Flags accepted by [`Queue::open`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Create the segment if the name is free
        const CREATE = 0x01;
        /// Allow `push`
        const PRODUCER = 0x02;
        /// Allow `pop` and `peek`
        const CONSUMER = 0x04;
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub head: u64,
    pub tail: u64,
    pub count: u64,
    pub capacity: u64,
    pub slot_size: u64,
    pub total_pushed: u64,
    pub total_popped: u64,
    pub full_events: u64,
    pub empty_events: u64,
    pub lock_recoveries: u64,
}

impl QueueStats {
    /// Occupancy in percent, rounded down
    pub fn fill_level(&self) -> u8 {
        (self.count * 100 / self.capacity.max(1)) as u8
    }
}

/// Handle to a named shared memory queue
pub struct Queue {
    ring: Ring,
    shm: SharedSegment,
    flags: OpenFlags,
    created: bool,
}

impl Queue {
    /// Open or create the queue `name`.
    ///
    /// With [`OpenFlags::CREATE`] a missing segment is created with the given
    /// shape; an existing one is attached and its shape wins. Without it the
    /// segment must exist, and a non-zero `capacity` or `slot_size` must match
    /// the segment exactly.
    pub fn open(name: &str, capacity: usize, slot_size: usize, flags: OpenFlags) -> Result<Self> {
        let config = QueueConfig::default().with_shape(capacity, slot_size);
        Self::open_with(name, flags, &config)
    }

    /// Like [`Queue::open`] with the shape and timeouts taken from `config`.
    pub fn open_with(name: &str, flags: OpenFlags, config: &QueueConfig) -> Result<Self> {
        let name = QueueName::parse(name)?;
        if !flags.intersects(OpenFlags::PRODUCER | OpenFlags::CONSUMER) {
            return Err(QueueError::InvalidArgument(
                "flags must include PRODUCER or CONSUMER",
            ));
        }

        if !flags.contains(OpenFlags::CREATE) {
            return Self::attach(&name, flags, config, true);
        }

        let geometry = Geometry::new(config.capacity, config.slot_size)?;
        let mut last_err = None;
        for _ in 0..CREATE_ATTEMPTS {
            match SharedSegment::create(&name, geometry.total_size) {
                Ok(shm) => return Ok(Self::initialize(shm, &geometry, flags)),
                Err(QueueError::Exists { .. }) => {}
                Err(e) => return Err(e),
            }
            match Self::attach(&name, flags, config, false) {
                Err(e @ QueueError::NotFound { .. }) => last_err = Some(e),
                other => return other,
            }
        }
        Err(last_err.unwrap_or(QueueError::NotFound {
            name: name.to_string(),
        }))
    }

    fn initialize(shm: SharedSegment, geometry: &Geometry, flags: OpenFlags) -> Self {
        let base = shm.base();
        let ring = unsafe {
            SegmentHeader::init(base.as_ptr().cast(), geometry);
            Ring::from_raw(base, geometry)
        };
        debug!(
            name = %shm.name(),
            capacity = geometry.capacity,
            slot_size = geometry.slot_size,
            bytes = geometry.total_size,
            "created queue"
        );
        Self {
            ring,
            shm,
            flags,
            created: true,
        }
    }

    fn attach(name: &QueueName, flags: OpenFlags, config: &QueueConfig, check_shape: bool) -> Result<Self> {
        let deadline = Instant::now() + config.attach_timeout;
        let shm = SharedSegment::open(name, Access::ReadWrite, HEADER_SIZE, config.attach_timeout)?;
        let header = unsafe { &*shm.as_ptr().cast::<SegmentHeader>() };

        while !header.is_ready() {
            if Instant::now() >= deadline {
                return Err(QueueError::Uninitialized {
                    name: name.to_string(),
                });
            }
            thread::sleep(Duration::from_millis(1));
        }

        let geometry = header.validate(shm.size())?;
        if check_shape {
            check_dimension("capacity", config.capacity, geometry.capacity)?;
            check_dimension("slot_size", config.slot_size, geometry.slot_size)?;
        }

        let ring = unsafe { Ring::from_raw(shm.base(), &geometry) };
        debug!(
            name = %name,
            capacity = geometry.capacity,
            slot_size = geometry.slot_size,
            "attached to queue"
        );
        Ok(Self {
            ring,
            shm,
            flags,
            created: false,
        })
    }

    /// Release this process's mapping. The segment itself stays.
    pub fn close(self) -> Result<()> {
        debug!(name = %self.shm.name(), "closing queue handle");
        drop(self);
        Ok(())
    }

    /// Remove `name` so no future open can attach to it.
    ///
    /// Handles that are already attached keep working against their mapping.
    pub fn unlink(name: &str) -> Result<()> {
        let name = QueueName::parse(name)?;
        SharedSegment::unlink(&name)?;
        debug!(name = %name, "unlinked queue");
        Ok(())
    }

    fn require(&self, role: OpenFlags) -> Result<()> {
        if self.flags.contains(role) {
            return Ok(());
        }
        let role = if role == OpenFlags::PRODUCER {
            "producer"
        } else {
            "consumer"
        };
        Err(QueueError::MissingRole { role })
    }

    /// Append `data` to the queue (non-blocking).
    ///
    /// Fails with [`QueueError::TooBig`] if `data` exceeds the slot size and
    /// with [`QueueError::Full`] if every slot is occupied.
    pub fn push(&self, data: &[u8]) -> Result<()> {
        self.require(OpenFlags::PRODUCER)?;
        self.ring.push(data)
    }

    /// Remove the oldest message, copying it into `buf` (non-blocking).
    ///
    /// Returns the message length. If `buf` is too small the message stays
    /// queued and [`QueueError::BufferTooSmall`] reports the size needed.
    pub fn pop(&self, buf: &mut [u8]) -> Result<usize> {
        self.require(OpenFlags::CONSUMER)?;
        self.ring.pop(buf)
    }

    /// Remove the oldest message into a new buffer of at most `buffer_capacity` bytes.
    pub fn pop_vec(&self, buffer_capacity: usize) -> Result<Vec<u8>> {
        self.require(OpenFlags::CONSUMER)?;
        let mut buf = vec![0u8; buffer_capacity.min(self.ring.slot_size())];
        let len = self.ring.pop(&mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Copy the oldest message into `buf` without removing it.
    pub fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        self.require(OpenFlags::CONSUMER)?;
        self.ring.peek(buf)
    }

    /// Number of queued messages
    pub fn len(&self) -> Result<usize> {
        Ok(self.ring.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.ring.len()? == 0)
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.ring.len()? == self.ring.capacity())
    }

    /// Occupancy in percent, rounded down
    pub fn fill_level(&self) -> Result<u8> {
        Ok(self.stats()?.fill_level())
    }

    /// Whether occupancy is at or above `threshold_pct`
    pub fn is_pressured(&self, threshold_pct: u8) -> Result<bool> {
        Ok(self.fill_level()? >= threshold_pct)
    }

    /// Lock-consistent statistics snapshot
    pub fn stats(&self) -> Result<QueueStats> {
        let snapshot = self.ring.snapshot()?;
        let header = self.header();
        let counters = &header.counters.0;
        Ok(QueueStats {
            head: snapshot.head,
            tail: snapshot.tail,
            count: snapshot.count,
            capacity: self.ring.capacity(),
            slot_size: self.ring.slot_size() as u64,
            total_pushed: counters.total_pushed.load(Ordering::Relaxed),
            total_popped: counters.total_popped.load(Ordering::Relaxed),
            full_events: counters.full_events.load(Ordering::Relaxed),
            empty_events: counters.empty_events.load(Ordering::Relaxed),
            lock_recoveries: header.lock.0.recoveries(),
        })
    }

    #[inline]
    pub(crate) fn header(&self) -> &SegmentHeader {
        unsafe { &*self.shm.as_ptr().cast::<SegmentHeader>() }
    }

    /// Normalized name of the queue
    pub fn name(&self) -> &str {
        self.shm.name().as_str()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity() as usize
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.ring.slot_size()
    }

    #[inline]
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    /// Whether this handle's open created the segment
    #[inline]
    pub fn is_creator(&self) -> bool {
        self.created
    }
}

fn check_dimension(field: &'static str, requested: usize, found: u64) -> Result<()> {
    if requested != 0 && requested as u64 != found {
        return Err(QueueError::ShapeMismatch {
            field,
            requested: requested as u64,
            found,
        });
    }
    Ok(())
}
