// src/bufpool.rs
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Size classes tuned for HTTP workloads: small responses, the common
/// case, whole-request reads, and large bodies.
pub const BUFFER_SIZES: [usize; 4] = [512, 2048, 8192, 32768];

/// Multi-tier free-list pool for byte buffers.
///
/// `get(n)` hands out a buffer of length `n` backed by the smallest class
/// with capacity ≥ n; anything above the top class is allocated fresh and
/// never pooled. `put` routes strictly by capacity, so buffers that grew
/// past their class are quietly dropped.
pub struct BufferPool {
    tiers: Vec<Mutex<Vec<Vec<u8>>>>,
    sizes: Vec<usize>,
    gets: AtomicU64,
    puts: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_sizes(&BUFFER_SIZES)
    }

    pub fn with_sizes(sizes: &[usize]) -> Self {
        Self {
            tiers: sizes.iter().map(|_| Mutex::new(Vec::new())).collect(),
            sizes: sizes.to_vec(),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Lease a buffer of length `size`.
    pub fn get(&self, size: usize) -> Vec<u8> {
        self.gets.fetch_add(1, Ordering::Relaxed);

        for (i, &class) in self.sizes.iter().enumerate() {
            if size <= class {
                let mut buf = match self.tiers[i].lock().pop() {
                    Some(b) => b,
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        Vec::with_capacity(class)
                    }
                };
                buf.resize(size, 0);
                return buf;
            }
        }

        // Oversize: allocate directly, never pooled.
        self.misses.fetch_add(1, Ordering::Relaxed);
        vec![0; size]
    }

    /// Return a buffer. Off-class capacities are discarded.
    pub fn put(&self, mut buf: Vec<u8>) {
        let capacity = buf.capacity();

        for (i, &class) in self.sizes.iter().enumerate() {
            if capacity == class {
                buf.clear();
                self.tiers[i].lock().push(buf);
                self.puts.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Pre-populate tiers so roughly `total_bytes` of buffer memory is
    /// resident before serving begins, split evenly across classes. This is
    /// the arena-sizing analogue of collector tuning: the baseline is
    /// retained for the life of the pool.
    pub fn preload(&self, total_bytes: usize) {
        if total_bytes == 0 {
            return;
        }
        let per_tier = total_bytes / self.sizes.len();
        for (i, &class) in self.sizes.iter().enumerate() {
            let count = per_tier / class;
            let mut tier = self.tiers[i].lock();
            tier.reserve(count);
            for _ in 0..count {
                tier.push(Vec::with_capacity(class));
            }
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            idle_per_tier: self
                .tiers
                .iter()
                .map(|t| t.lock().len() as u64)
                .collect(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    pub gets: u64,
    pub puts: u64,
    pub misses: u64,
    pub idle_per_tier: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_rounds_up_to_class() {
        let pool = BufferPool::new();

        let buf = pool.get(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 512);

        let buf = pool.get(8192);
        assert_eq!(buf.len(), 8192);
        assert_eq!(buf.capacity(), 8192);
    }

    #[test]
    fn test_oversize_not_pooled() {
        let pool = BufferPool::new();
        let buf = pool.get(100_000);
        assert_eq!(buf.len(), 100_000);
        pool.put(buf);
        let stats = pool.stats();
        assert_eq!(stats.puts, 0);
    }

    #[test]
    fn test_put_then_get_reuses() {
        let pool = BufferPool::new();
        let mut buf = pool.get(2048);
        buf[0] = 0xAB;
        pool.put(buf);

        // Same class comes back from the free list, length reset.
        let buf = pool.get(1500);
        assert_eq!(buf.len(), 1500);
        assert_eq!(buf.capacity(), 2048);
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_preload_populates_tiers() {
        let pool = BufferPool::new();
        pool.preload(4 * 32768);
        let stats = pool.stats();
        assert!(stats.idle_per_tier.iter().any(|&n| n > 0));
    }
}
