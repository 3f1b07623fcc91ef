//! VenomQueue - named fixed-capacity message queue in shared memory
//!
//! Independent processes attach to the same queue by name and exchange
//! bounded messages through a ring of fixed-size slots.
//!
//! # Architecture
//!
//! - **Naming** ([`shm`]): validated names, create / attach / unlink of POSIX segments
//! - **Layout** ([`layout`]): header, slot array and the attach fingerprint
//! - **Lock** ([`lock`]): cross-process lock that survives a crashed holder
//! - **Ring** ([`ring`]): FIFO push / pop with crash-repairable ordering
//! - **Handle** ([`queue`]): per-process capability with producer / consumer roles
//!
//! Push and pop never wait for space or data: they fail fast with
//! [`QueueError::Full`] or [`QueueError::Empty`].
//!
//! ```no_run
//! use venom_queue::{OpenFlags, Queue};
//!
//! let producer = Queue::open("/jobs", 1024, 4096, OpenFlags::CREATE | OpenFlags::PRODUCER)?;
//! let consumer = Queue::open("/jobs", 0, 0, OpenFlags::CONSUMER)?;
//!
//! producer.push(b"hello")?;
//! let mut buf = [0u8; 4096];
//! let len = consumer.pop(&mut buf)?;
//! assert_eq!(&buf[..len], b"hello");
//! # Ok::<(), venom_queue::QueueError>(())
//! ```

pub mod config;
pub mod diagnose;
pub mod error;
pub mod layout;
pub mod lock;
pub mod queue;
pub mod ring;
pub mod shm;

pub use config::QueueConfig;
pub use diagnose::{diagnose, Diagnostic, QueueState};
pub use error::{describe_code, QueueError, Result, Status};
pub use queue::{OpenFlags, Queue, QueueStats};
