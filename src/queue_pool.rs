/// Pool of free-event queues for the lifetime matcher
///
/// Each address with pending frees owns a FIFO queue. Queues are emptied and
/// dropped from the address map constantly during a pass, so emptied queues
/// are handed back here and reused instead of being reallocated.
use std::collections::VecDeque;

/// A free event found by the forward scan but not yet claimed by an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeEntry {
    /// Index of the free record in the trace
    pub source_index: usize,
    /// Corrected time of the free (ns)
    pub corrected_time: i64,
}

/// Configuration for the queue pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle queues kept for reuse
    pub retain: usize,
    /// Whether pooling is enabled
    pub enabled: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            retain: 4096,
            enabled: true,
        }
    }
}

impl PoolConfig {
    pub fn new(retain: usize) -> Self {
        PoolConfig {
            retain,
            enabled: true,
        }
    }

    /// Disable pooling (every acquire allocates)
    pub fn disabled() -> Self {
        PoolConfig {
            retain: 0,
            enabled: false,
        }
    }
}

/// Recycles the per-address FIFO queues
#[derive(Debug)]
pub struct FreeQueuePool {
    idle: Vec<VecDeque<FreeEntry>>,
    config: PoolConfig,
    acquired: usize,
    allocated: usize,
    recycled: usize,
}

impl FreeQueuePool {
    pub fn new(config: PoolConfig) -> Self {
        FreeQueuePool {
            idle: Vec::new(),
            config,
            acquired: 0,
            allocated: 0,
            recycled: 0,
        }
    }

    /// Take an empty queue, reusing an idle one when available
    pub fn acquire(&mut self) -> VecDeque<FreeEntry> {
        self.acquired += 1;
        match self.idle.pop() {
            Some(mut queue) => {
                queue.clear();
                self.recycled += 1;
                queue
            }
            None => {
                self.allocated += 1;
                VecDeque::new()
            }
        }
    }

    /// Return a queue for reuse
    ///
    /// Dropped instead when pooling is disabled or the idle list is full.
    pub fn release(&mut self, queue: VecDeque<FreeEntry>) {
        if self.config.enabled && self.idle.len() < self.config.retain {
            self.idle.push(queue);
        }
    }

    /// Idle queues ready for reuse
    pub fn available(&self) -> usize {
        self.idle.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.acquired,
            allocated: self.allocated,
            recycled: self.recycled,
            available: self.idle.len(),
        }
    }
}

impl Default for FreeQueuePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total acquire operations
    pub acquired: usize,
    /// Acquires that had to allocate a new queue
    pub allocated: usize,
    /// Acquires served from the idle list
    pub recycled: usize,
    /// Idle queues at the time of the snapshot
    pub available: usize,
}

impl PoolStats {
    /// Percentage of acquires served from the idle list
    pub fn hit_rate(&self) -> f64 {
        if self.acquired == 0 {
            return 0.0;
        }
        (self.recycled as f64 / self.acquired as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: usize) -> FreeEntry {
        FreeEntry {
            source_index: i,
            corrected_time: i as i64 * 10,
        }
    }

    #[test]
    fn test_acquire_allocates_when_idle_list_empty() {
        let mut pool = FreeQueuePool::default();
        let queue = pool.acquire();
        assert!(queue.is_empty());
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().recycled, 0);
    }

    #[test]
    fn test_released_queue_is_reused_empty() {
        let mut pool = FreeQueuePool::default();
        let mut queue = pool.acquire();
        queue.push_back(entry(1));
        queue.push_back(entry(2));
        let capacity = queue.capacity();
        pool.release(queue);
        assert_eq!(pool.available(), 1);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= capacity);
        assert_eq!(pool.available(), 0);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.hit_rate(), 50.0);
    }

    #[test]
    fn test_retain_cap() {
        let mut pool = FreeQueuePool::new(PoolConfig::new(2));
        for _ in 0..5 {
            pool.release(VecDeque::new());
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_disabled_pool_never_retains() {
        let mut pool = FreeQueuePool::new(PoolConfig::disabled());
        let queue = pool.acquire();
        pool.release(queue);
        assert_eq!(pool.available(), 0);
        pool.acquire();
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn test_hit_rate_empty() {
        assert_eq!(FreeQueuePool::default().stats().hit_rate(), 0.0);
    }
}
