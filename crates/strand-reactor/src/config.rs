//! Reactor configuration.

use std::time::Duration;

use strand_core::pool::{DEFAULT_MAX_CAPACITY, DEFAULT_MIN_CAPACITY};

/// Configuration for a [`SelectorManager`](crate::manager::SelectorManager).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Number of managed selectors (defaults to CPU count).
    pub selectors: usize,

    /// Listener backlog passed to [`channel::listen`](crate::channel::listen).
    pub accept_queue: i32,

    /// Default per-endpoint idle timeout; `None` disables it.
    pub idle_timeout: Option<Duration>,

    /// Buffer pool lease clamp.
    pub buffer_min: usize,
    pub buffer_max: usize,

    /// How long a pending connect may stay unresolved.
    pub connect_timeout: Duration,

    /// Hand fill/write dispatch to the executor instead of running it
    /// inline on the selector thread. Inline is the default: a hand-off
    /// costs a context switch per I/O event, which short handlers never
    /// earn back.
    pub dispatch_io: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            selectors: cpus,
            accept_queue: 1024,
            idle_timeout: Some(Duration::from_secs(30)),
            buffer_min: DEFAULT_MIN_CAPACITY,
            buffer_max: DEFAULT_MAX_CAPACITY,
            connect_timeout: Duration::from_secs(10),
            dispatch_io: false,
        }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of managed selectors (at least 1).
    pub fn selectors(mut self, n: usize) -> Self {
        self.selectors = n.max(1);
        self
    }

    pub fn accept_queue(mut self, backlog: i32) -> Self {
        self.accept_queue = backlog;
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn buffer_sizes(mut self, min: usize, max: usize) -> Self {
        self.buffer_min = min;
        self.buffer_max = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn dispatch_io(mut self, dispatch: bool) -> Self {
        self.dispatch_io = dispatch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReactorConfig::default();
        assert!(config.selectors >= 1);
        assert!(!config.dispatch_io);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_chained_setters() {
        let config = ReactorConfig::new()
            .selectors(0)
            .accept_queue(64)
            .idle_timeout(Some(Duration::from_millis(100)))
            .dispatch_io(true);
        assert_eq!(config.selectors, 1);
        assert_eq!(config.accept_queue, 64);
        assert!(config.dispatch_io);
    }
}
