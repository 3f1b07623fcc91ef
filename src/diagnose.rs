//! Read-only health inspection of a named queue
//!
//! Diagnosis never takes the queue lock, so it works on a wedged or
//! half-initialized segment. The numbers it reports may therefore be in the
//! middle of a concurrent update.

use crate::error::{QueueError, Result};
use crate::layout::{Journal, SegmentHeader, HEADER_SIZE, QUEUE_MAGIC, QUEUE_VERSION};
use crate::shm::{Access, QueueName, SharedSegment};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Overall verdict of a diagnosis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Consistent and holding messages
    Healthy,
    /// Consistent and empty
    Empty,
    /// Creator has not finished (or never finished) initialization
    Incomplete,
    /// Written by an incompatible layout version
    VersionMismatch,
    /// Indices, magic or fingerprint are inconsistent
    Corrupted,
    /// Lock is held by a process that no longer exists
    StaleLock,
}

/// Result of [`diagnose`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub name: String,
    pub state: QueueState,
    pub magic_ok: bool,
    pub version_ok: bool,
    pub capacity: u64,
    pub slot_size: u64,
    pub head: u64,
    pub tail: u64,
    pub count: u64,
    /// Pid of the lock holder at inspection time
    pub lock_owner: Option<u32>,
    pub lock_owner_alive: Option<bool>,
    /// An interrupted push or pop is waiting to be repaired
    pub repair_pending: bool,
    pub lock_recoveries: u64,
}

impl Diagnostic {
    fn new(name: &QueueName, state: QueueState) -> Self {
        Self {
            name: name.to_string(),
            state,
            magic_ok: false,
            version_ok: false,
            capacity: 0,
            slot_size: 0,
            head: 0,
            tail: 0,
            count: 0,
            lock_owner: None,
            lock_owner_alive: None,
            repair_pending: false,
            lock_recoveries: 0,
        }
    }
}

/// Inspect the queue `name` without attaching to it as a participant.
///
/// Fails with [`QueueError::NotFound`] if the name does not exist; every
/// other finding is reported through [`Diagnostic::state`].
pub fn diagnose(name: &str) -> Result<Diagnostic> {
    let name = QueueName::parse(name)?;
    let shm = match SharedSegment::open(&name, Access::ReadOnly, HEADER_SIZE, Duration::ZERO) {
        Ok(shm) => shm,
        Err(QueueError::Uninitialized { .. }) => {
            return Ok(Diagnostic::new(&name, QueueState::Incomplete))
        }
        Err(e) => return Err(e),
    };
    let header = unsafe { &*shm.as_ptr().cast::<SegmentHeader>() };

    if !header.is_ready() {
        return Ok(Diagnostic::new(&name, QueueState::Incomplete));
    }

    let mut diag = Diagnostic::new(&name, QueueState::Corrupted);
    diag.magic_ok = header.magic() == QUEUE_MAGIC;
    diag.version_ok = header.version() == QUEUE_VERSION;
    if !diag.magic_ok {
        return Ok(diag);
    }
    if !diag.version_ok {
        diag.state = QueueState::VersionMismatch;
        return Ok(diag);
    }

    diag.capacity = header.capacity();
    diag.slot_size = header.slot_size();

    let ring = &header.ring.0;
    diag.head = ring.head.load(Ordering::Acquire);
    diag.tail = ring.tail.load(Ordering::Acquire);
    diag.count = ring.count.load(Ordering::Acquire);
    let journal = Journal::from_raw(ring.journal.load(Ordering::Acquire));
    diag.repair_pending = !matches!(journal, Some(Journal::Idle));

    let lock = &header.lock.0;
    diag.lock_recoveries = lock.recoveries();
    let owner = lock.owner();
    diag.lock_owner = owner.map(|o| o.pid);
    diag.lock_owner_alive = owner.map(|o| o.is_alive());

    let consistent = header.validate(shm.size()).is_ok()
        && journal.is_some()
        && diag.count <= diag.capacity
        && diag.head < diag.capacity
        && diag.tail < diag.capacity;

    diag.state = if !consistent {
        QueueState::Corrupted
    } else if diag.lock_owner_alive == Some(false) {
        QueueState::StaleLock
    } else if diag.count == 0 {
        QueueState::Empty
    } else {
        QueueState::Healthy
    };
    Ok(diag)
}
