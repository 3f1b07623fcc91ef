//! Crash-robust cross-process lock
//!
//! The lock is a single owner word living in shared memory:
//! `pid << 32 | token`, or zero when unlocked. On Linux the token is derived
//! from the owner's start time in `/proc/<pid>/stat`, so a pid that was
//! recycled by an unrelated process no longer matches the stored word.
//!
//! Waiters spin, then yield, and periodically check whether the owner is
//! still running. A dead owner (zombies included) is replaced by
//! compare-exchange and the shared recovery counter is bumped. Where procfs
//! is unavailable the check falls back to `kill(pid, 0)`.

use rustix::io::Errno;
use rustix::process::{getpid, test_kill_process, Pid};
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Attempts spent in `spin_loop` before falling back to `yield_now`
const SPIN_LIMIT: u32 = 128;

/// Failed attempts between two owner liveness checks
pub const LIVENESS_CHECK_INTERVAL: u32 = 1024;

/// Lock state stored in the segment header
#[repr(C)]
pub struct RobustLock {
    owner: AtomicU64,
    recoveries: AtomicU64,
}

/// Identity of the process holding the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub pid: u32,
    pub token: u32,
}

impl Owner {
    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.pid) << 32) | u64::from(self.token)
    }

    #[inline]
    fn unpack(word: u64) -> Option<Self> {
        (word != 0).then(|| Owner {
            pid: (word >> 32) as u32,
            token: word as u32,
        })
    }

    /// The calling process
    pub fn current() -> Self {
        Owner {
            pid: getpid().as_raw_nonzero().get() as u32,
            token: process_token(),
        }
    }

    /// Whether the owner's process is still running.
    ///
    /// Zombies count as dead: a killed holder that its parent has not reaped
    /// yet will never release the lock. Permission errors from the `kill`
    /// fallback count as alive since the pid exists, it is just not ours.
    pub fn is_alive(self) -> bool {
        let me = Owner::current();
        if self.pid == me.pid {
            return self.token == me.token;
        }
        let Some(pid) = Pid::from_raw(self.pid as i32) else {
            return false;
        };
        match read_proc_stat(&self.pid.to_string()) {
            Some(stat) => {
                if stat.is_exited() {
                    return false;
                }
                self.token & START_TIME_TAG == 0 || self.token == start_time_token(stat.start_time)
            }
            None => !matches!(test_kill_process(pid), Err(Errno::SRCH)),
        }
    }
}

/// Marks a token derived from the process start time
const START_TIME_TAG: u32 = 1 << 31;

#[inline]
fn start_time_token(start_time: u64) -> u32 {
    (start_time as u32) | START_TIME_TAG
}

/// Fields of `/proc/<pid>/stat` used by the liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    state: char,
    /// Clock ticks since boot at which the process started
    start_time: u64,
}

impl ProcStat {
    fn is_exited(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

fn read_proc_stat(pid: &str) -> Option<ProcStat> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_proc_stat(&stat)
}

/// Parse state (field 3) and starttime (field 22).
///
/// The command name in field 2 may itself contain spaces and parentheses, so
/// fields are counted from the last `)`.
fn parse_proc_stat(stat: &str) -> Option<ProcStat> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let start_time = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

/// Per-process liveness token, never zero
fn process_token() -> u32 {
    static TOKEN: OnceLock<u32> = OnceLock::new();
    *TOKEN.get_or_init(|| {
        if let Some(stat) = read_proc_stat("self") {
            return start_time_token(stat.start_time);
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mixed = nanos ^ (u64::from(std::process::id()) << 17) ^ (nanos >> 29);
        ((mixed as u32) & !START_TIME_TAG) | 1
    })
}

impl RobustLock {
    /// Reset to the unlocked state.
    pub fn init(&mut self) {
        self.owner = AtomicU64::new(0);
        self.recoveries = AtomicU64::new(0);
    }

    /// Acquire the lock, reclaiming it from a dead owner if necessary.
    pub fn lock(&self) -> LockGuard<'_> {
        let me = Owner::current().pack();
        let mut attempts: u32 = 0;

        loop {
            let current = match self
                .owner
                .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return LockGuard { lock: self },
                Err(current) => current,
            };

            attempts = attempts.wrapping_add(1);
            if attempts % LIVENESS_CHECK_INTERVAL == 0 {
                if let Some(guard) = self.try_reclaim(current, me) {
                    return guard;
                }
            }

            if attempts < SPIN_LIMIT {
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Try to take the lock once without waiting.
    pub fn try_lock(&self) -> Option<LockGuard<'_>> {
        let me = Owner::current().pack();
        match self
            .owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(LockGuard { lock: self }),
            Err(current) => self.try_reclaim(current, me),
        }
    }

    fn try_reclaim(&self, stale: u64, me: u64) -> Option<LockGuard<'_>> {
        let owner = Owner::unpack(stale)?;
        if owner.is_alive() {
            return None;
        }
        self.owner
            .compare_exchange(stale, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        let recoveries = self.recoveries.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            dead_pid = owner.pid,
            recoveries, "reclaimed queue lock from dead owner"
        );
        Some(LockGuard { lock: self })
    }

    /// Current holder, if any
    #[inline]
    pub fn owner(&self) -> Option<Owner> {
        Owner::unpack(self.owner.load(Ordering::Acquire))
    }

    /// Number of times the lock was reclaimed from a dead owner
    #[inline]
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}

/// Held lock; released on drop, including during unwinding
pub struct LockGuard<'a> {
    lock: &'a RobustLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Release);
    }
}
