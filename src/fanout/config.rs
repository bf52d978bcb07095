//! Fan-out configuration

use std::time::Duration;

use super::queue::DEFAULT_QUEUE_CAPACITY;

/// Per-channel fan-out settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Frames buffered between the encoder callback and the dispatcher
    pub queue_capacity: usize,

    /// Longest a single packet write to one connection may take
    pub write_deadline: Duration,

    /// Consecutive missed deadlines before a connection is evicted
    pub stall_limit: u32,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            write_deadline: Duration::from_secs(2),
            stall_limit: 3,
        }
    }
}

impl FanoutConfig {
    pub fn queue_capacity(mut self, frames: usize) -> Self {
        self.queue_capacity = frames;
        self
    }

    pub fn write_deadline(mut self, deadline: Duration) -> Self {
        self.write_deadline = deadline;
        self
    }

    /// A limit of 0 is treated as 1 (evict on the first miss)
    pub fn stall_limit(mut self, misses: u32) -> Self {
        self.stall_limit = misses.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FanoutConfig::default();
        assert_eq!(config.queue_capacity, 30);
        assert_eq!(config.write_deadline, Duration::from_secs(2));
        assert_eq!(config.stall_limit, 3);
    }

    #[test]
    fn test_builder() {
        let config = FanoutConfig::default()
            .queue_capacity(5)
            .write_deadline(Duration::from_millis(250))
            .stall_limit(0);

        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.write_deadline, Duration::from_millis(250));
        assert_eq!(config.stall_limit, 1);
    }
}
