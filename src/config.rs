//! Queue configuration

use std::env;
use std::time::Duration;

/// Default number of slots
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default payload bytes per slot
pub const DEFAULT_SLOT_SIZE: usize = 4096;

/// Default time an attacher waits for a racing creator to finish initializing
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_millis(100);

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of slots, used only when this open creates the segment.
    /// Zero on an attach-only open means "whatever the segment has".
    pub capacity: usize,
    /// Maximum payload per slot, same rules as `capacity`
    pub slot_size: usize,
    /// How long an attach waits for the creator's initialization to land
    pub attach_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
        }
    }
}

impl QueueConfig {
    /// Read `VENOM_QUEUE_CAPACITY`, `VENOM_QUEUE_SLOT_SIZE` and
    /// `VENOM_QUEUE_ATTACH_TIMEOUT_MS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let capacity = env::var("VENOM_QUEUE_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.capacity);

        let slot_size = env::var("VENOM_QUEUE_SLOT_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.slot_size);

        let attach_timeout = env::var("VENOM_QUEUE_ATTACH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.attach_timeout);

        Self {
            capacity,
            slot_size,
            attach_timeout,
        }
    }

    pub fn with_shape(mut self, capacity: usize, slot_size: usize) -> Self {
        self.capacity = capacity;
        self.slot_size = slot_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.slot_size, 4096);
        assert_eq!(config.attach_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_with_shape_keeps_timeout() {
        let config = QueueConfig::default().with_shape(0, 0);
        assert_eq!((config.capacity, config.slot_size), (0, 0));
        assert_eq!(config.attach_timeout, DEFAULT_ATTACH_TIMEOUT);
    }

    #[test]
    fn test_from_env() {
        // Only this test touches these variables
        env::set_var("VENOM_QUEUE_CAPACITY", "32");
        env::set_var("VENOM_QUEUE_SLOT_SIZE", "not-a-number");
        env::set_var("VENOM_QUEUE_ATTACH_TIMEOUT_MS", "250");

        let config = QueueConfig::from_env();
        assert_eq!(config.capacity, 32);
        assert_eq!(config.slot_size, DEFAULT_SLOT_SIZE);
        assert_eq!(config.attach_timeout, Duration::from_millis(250));

        env::remove_var("VENOM_QUEUE_CAPACITY");
        env::remove_var("VENOM_QUEUE_SLOT_SIZE");
        env::remove_var("VENOM_QUEUE_ATTACH_TIMEOUT_MS");
    }
}
