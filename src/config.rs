use crate::core::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8192;
pub const DEFAULT_MODE: u32 = 0o600;

/// Parameters shared by the kernel-backed and the emulated queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued messages.
    pub capacity: usize,
    /// Maximum payload length in bytes.
    pub max_message_size: usize,
    /// Permission bits for a newly created queue.
    pub mode: u32,
    /// Fail with `CapacityExceeded`/`QueueEmpty` instead of blocking.
    pub nonblocking: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            mode: DEFAULT_MODE,
            nonblocking: false,
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, max_message_size: usize) -> Self {
        Self {
            capacity,
            max_message_size,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be non-zero"));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidConfig("max_message_size must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_kernel_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 10);
        assert_eq!(config.max_message_size, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_dimensions_rejected() {
        assert!(QueueConfig::new(0, 16).validate().is_err());
        assert!(QueueConfig::new(4, 0).validate().is_err());
    }
}
