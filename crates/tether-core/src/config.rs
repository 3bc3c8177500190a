//! Runtime and worker pool configuration.

use std::time::Duration;

use crate::pool_lock::DEFAULT_POOL_SIZE;

/// Default idle time after which a pool thread exits.
pub const DEFAULT_EXPIRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for creating a [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    /// Upper bound on concurrently running worker threads.
    pub max_thread_count: usize,
    /// Idle time before a worker exits. `None` keeps idle workers forever.
    pub expiry_timeout: Option<Duration>,
    /// Name prefix for worker threads.
    pub thread_name: String,
    /// Stack size for worker threads in bytes.
    pub stack_size: Option<usize>,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            max_thread_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            expiry_timeout: Some(DEFAULT_EXPIRY_TIMEOUT),
            thread_name: "tether-worker".to_string(),
            stack_size: None,
        }
    }
}

impl ThreadPoolConfig {
    /// Create a new configuration with custom thread count.
    pub fn with_threads(max_thread_count: usize) -> Self {
        Self {
            max_thread_count,
            ..Default::default()
        }
    }

    /// Set the idle expiry timeout.
    pub fn expiry_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.expiry_timeout = timeout;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the worker stack size.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }
}

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of mutexes guarding per-object connection data.
    pub mutex_pool_size: usize,
    /// Settings for the runtime's worker pool, created on first use.
    pub thread_pool: ThreadPoolConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mutex_pool_size: DEFAULT_POOL_SIZE,
            thread_pool: ThreadPoolConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Set the mutex pool size. Zero is raised to one.
    pub fn with_mutex_pool_size(mut self, size: usize) -> Self {
        self.mutex_pool_size = size.max(1);
        self
    }

    /// Set the worker pool configuration.
    pub fn with_thread_pool(mut self, config: ThreadPoolConfig) -> Self {
        self.thread_pool = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mutex_pool_size, 131);
        assert!(config.thread_pool.max_thread_count >= 1);
        assert_eq!(config.thread_pool.expiry_timeout, Some(DEFAULT_EXPIRY_TIMEOUT));
    }

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::default()
            .with_mutex_pool_size(0)
            .with_thread_pool(
                ThreadPoolConfig::with_threads(3)
                    .expiry_timeout(None)
                    .thread_name("io")
                    .stack_size(1 << 20),
            );
        assert_eq!(config.mutex_pool_size, 1);
        assert_eq!(config.thread_pool.max_thread_count, 3);
        assert_eq!(config.thread_pool.expiry_timeout, None);
        assert_eq!(config.thread_pool.thread_name, "io");
        assert_eq!(config.thread_pool.stack_size, Some(1 << 20));
    }
}
