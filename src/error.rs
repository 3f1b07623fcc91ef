//! Error and status types for VenomQueue

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for VenomQueue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Stable numeric status codes.
///
/// `Ok`, `Empty`, `Full`, `NotFound`, `Invalid` and `TooBig` are the
/// documented surface. The remaining codes only describe internal failures.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    Empty = -1,
    Full = -2,
    NoMem = -3,
    Invalid = -4,
    Exists = -5,
    NotFound = -6,
    TooBig = -7,
    Corrupted = -8,
    SysErr = -11,
}

impl Status {
    /// Numeric value of the status
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let status = match code {
            0 => Status::Ok,
            -1 => Status::Empty,
            -2 => Status::Full,
            -3 => Status::NoMem,
            -4 => Status::Invalid,
            -5 => Status::Exists,
            -6 => Status::NotFound,
            -7 => Status::TooBig,
            -8 => Status::Corrupted,
            -11 => Status::SysErr,
            _ => return None,
        };
        Some(status)
    }

    /// Short human readable description
    pub const fn description(self) -> &'static str {
        match self {
            Status::Ok => "Success",
            Status::Empty => "Buffer empty",
            Status::Full => "Buffer full",
            Status::NoMem => "Out of memory",
            Status::Invalid => "Invalid argument",
            Status::Exists => "Already exists",
            Status::NotFound => "Not found",
            Status::TooBig => "Message too large",
            Status::Corrupted => "Data corrupted",
            Status::SysErr => "System error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Describe a raw status code, including codes this crate never produces.
pub fn describe_code(code: i32) -> &'static str {
    Status::from_code(code).map_or("Unknown error", Status::description)
}

/// Errors that can occur in VenomQueue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// Nothing to pop
    #[error("Queue is empty")]
    Empty,

    /// No free slot to push into
    #[error("Queue is full")]
    Full,

    /// Payload larger than the queue's slot size
    #[error("Message too large: slot holds {max} bytes, got {len} bytes")]
    TooBig { len: usize, max: usize },

    /// Destination buffer smaller than the queued message
    #[error("Buffer too small: message needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// No segment with this name
    #[error("Queue '{name}' not found")]
    NotFound { name: String },

    #[error("Invalid queue name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Operation requires a role the handle was not opened with
    #[error("Handle was not opened with {role} rights")]
    MissingRole { role: &'static str },

    /// Attach-only open requested a shape the segment does not have
    #[error("Queue shape mismatch: requested {field} {requested}, segment has {found}")]
    ShapeMismatch {
        field: &'static str,
        requested: u64,
        found: u64,
    },

    #[error("Invalid segment magic: expected 0x{expected:016X}, got 0x{found:016X}")]
    InvalidMagic { expected: u64, found: u64 },

    #[error("Incompatible segment version: expected {expected}, got {found}")]
    IncompatibleVersion { expected: u32, found: u32 },

    #[error("Segment fingerprint mismatch: expected 0x{expected:08X}, got 0x{found:08X}")]
    FingerprintMismatch { expected: u32, found: u32 },

    /// The creator never finished initializing the segment
    #[error("Queue '{name}' was never fully initialized")]
    Uninitialized { name: String },

    /// Shared state violates the ring invariants
    #[error("Queue state corrupted: {0}")]
    Corrupted(String),

    #[error("Queue '{name}' already exists")]
    Exists { name: String },

    #[error("Failed to open shared memory '{name}': {source}")]
    ShmOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to unlink shared memory '{name}': {source}")]
    ShmUnlink {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),
}

impl QueueError {
    /// Status code reported for this error
    pub fn status(&self) -> Status {
        match self {
            QueueError::Empty => Status::Empty,
            QueueError::Full => Status::Full,
            QueueError::TooBig { .. } | QueueError::BufferTooSmall { .. } => Status::TooBig,
            QueueError::NotFound { .. } => Status::NotFound,
            QueueError::InvalidName { .. }
            | QueueError::InvalidArgument(_)
            | QueueError::MissingRole { .. }
            | QueueError::ShapeMismatch { .. }
            | QueueError::InvalidMagic { .. }
            | QueueError::IncompatibleVersion { .. }
            | QueueError::FingerprintMismatch { .. }
            | QueueError::Uninitialized { .. } => Status::Invalid,
            QueueError::Corrupted(_) => Status::Corrupted,
            QueueError::Exists { .. } => Status::Exists,
            QueueError::Truncate(e) | QueueError::Mmap(e) if is_out_of_memory(e) => Status::NoMem,
            QueueError::ShmOpen { .. }
            | QueueError::ShmUnlink { .. }
            | QueueError::Truncate(_)
            | QueueError::Mmap(_) => Status::SysErr,
        }
    }

    /// Whether the condition is an expected, retryable capacity or size condition
    pub fn is_transient(&self) -> bool {
        matches!(
            self.status(),
            Status::Empty | Status::Full | Status::TooBig
        )
    }
}

fn is_out_of_memory(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
}
