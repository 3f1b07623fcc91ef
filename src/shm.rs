//! POSIX shared memory naming and mapping

use crate::error::{QueueError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::fmt;
use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

/// Longest name accepted by `shm_open`, leading separator included
pub const MAX_NAME_LEN: usize = 255;

/// Interval between polls while waiting for a creator to size the segment
const ATTACH_POLL: Duration = Duration::from_millis(1);

/// A validated shared memory name, always rooted with a leading `/`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    full: String,
    c_name: CString,
}

impl QueueName {
    /// Validate `name`, prepending `/` when it is missing.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = |reason| QueueError::InvalidName {
            name: name.to_string(),
            reason,
        };

        let body = name.strip_prefix('/').unwrap_or(name);
        if body.is_empty() {
            return Err(invalid("name is empty"));
        }
        if body.contains('/') {
            return Err(invalid("name may not contain '/' after the leading separator"));
        }
        if body.len() + 1 > MAX_NAME_LEN {
            return Err(invalid("name is longer than 255 bytes"));
        }

        let full = format!("/{}", body);
        let c_name = CString::new(full.clone()).map_err(|_| invalid("name contains a NUL byte"))?;
        Ok(Self { full, c_name })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

/// Access mode of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
}

/// A process-local mapping of a named shared memory segment.
///
/// Dropping the mapping only unmaps it. The name stays in the namespace
/// until [`SharedSegment::unlink`] is called by any process.
pub struct SharedSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: QueueName,
}

// SAFETY: the mapping itself is plain memory; all shared mutation goes through
// atomics and the cross-process lock stored inside it
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a new segment of `size` zeroed bytes.
    ///
    /// Fails with [`QueueError::Exists`] when the name is already taken. If
    /// sizing or mapping fails the name is unlinked again, so a half-built
    /// segment is never left behind for other processes to attach to.
    pub fn create(name: &QueueName, size: usize) -> Result<Self> {
        let fd = shm_open(
            name.c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH,
        )
        .map_err(|e| match e {
            Errno::EXIST => QueueError::Exists {
                name: name.to_string(),
            },
            e => QueueError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            },
        })?;

        let mapped = ftruncate(&fd, size as u64)
            .map_err(|e| QueueError::Truncate(e.into()))
            .and_then(|()| map(&fd, size, Access::ReadWrite));

        match mapped {
            Ok(addr) => Ok(Self {
                fd,
                addr,
                size,
                name: name.clone(),
            }),
            Err(e) => {
                let _ = shm_unlink(name.c_name.as_c_str());
                Err(e)
            }
        }
    }

    /// Open an existing segment and map all of it.
    ///
    /// A creator sizes the segment right after creating the name, so an
    /// attacher that races it waits up to `timeout` for the size to reach
    /// `min_size` before giving up with [`QueueError::Uninitialized`].
    pub fn open(name: &QueueName, access: Access, min_size: usize, timeout: Duration) -> Result<Self> {
        let oflags = match access {
            Access::ReadWrite => ShmOFlags::RDWR,
            Access::ReadOnly => ShmOFlags::RDONLY,
        };
        let fd = shm_open(name.c_name.as_c_str(), oflags, Mode::empty()).map_err(|e| match e {
            Errno::NOENT => QueueError::NotFound {
                name: name.to_string(),
            },
            e => QueueError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            },
        })?;

        let deadline = Instant::now() + timeout;
        let size = loop {
            let stat = fstat(&fd).map_err(|e| QueueError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            })?;
            let size = stat.st_size as usize;
            if size >= min_size {
                break size;
            }
            if Instant::now() >= deadline {
                return Err(QueueError::Uninitialized {
                    name: name.to_string(),
                });
            }
            thread::sleep(ATTACH_POLL);
        };

        let addr = map(&fd, size, access)?;
        Ok(Self {
            fd,
            addr,
            size,
            name: name.clone(),
        })
    }

    /// Remove `name` from the namespace. Existing mappings stay valid.
    pub fn unlink(name: &QueueName) -> Result<()> {
        shm_unlink(name.c_name.as_c_str()).map_err(|e| match e {
            Errno::NOENT => QueueError::NotFound {
                name: name.to_string(),
            },
            e => QueueError::ShmUnlink {
                name: name.to_string(),
                source: e.into(),
            },
        })
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Base address of the mapping
    #[inline(always)]
    pub fn base(&self) -> NonNull<u8> {
        self.addr
    }

    /// Get size of the mapping
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn name(&self) -> &QueueName {
        &self.name
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

fn map(fd: &OwnedFd, size: usize, access: Access) -> Result<NonNull<u8>> {
    let prot = match access {
        Access::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
        Access::ReadOnly => ProtFlags::READ,
    };
    let addr = unsafe {
        mmap(std::ptr::null_mut(), size, prot, MapFlags::SHARED, fd, 0)
            .map_err(|e| QueueError::Mmap(e.into()))?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| QueueError::Mmap(std::io::Error::other("mmap returned null")))
}
