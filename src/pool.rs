// src/pool.rs
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Configuration for a [`SmartPool`]. Unset knobs fall back to the
/// defaults: warmup 100, idle cap 1000, target hit rate 0.90.
pub struct SmartPoolConfig<T> {
    pub new: Factory<T>,
    pub reset: Option<ResetFn<T>>,
    pub warmup_size: usize,
    pub max_idle_size: usize,
    pub target_hit_rate: f64,
}

impl<T> SmartPoolConfig<T> {
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            new: Box::new(factory),
            reset: None,
            warmup_size: 100,
            max_idle_size: 1000,
            target_hit_rate: 0.90,
        }
    }

    pub fn reset(mut self, reset: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        self.reset = Some(Box::new(reset));
        self
    }

    pub fn warmup_size(mut self, n: usize) -> Self {
        self.warmup_size = n;
        self
    }

    pub fn max_idle_size(mut self, n: usize) -> Self {
        self.max_idle_size = n;
        self
    }

    pub fn target_hit_rate(mut self, rate: f64) -> Self {
        self.target_hit_rate = rate;
        self
    }
}

/// Warm-startable object pool with statistics and a periodic auto-tune.
///
/// A `get` that finds the pool empty mints a fresh object through the
/// factory, so exhaustion is impossible by construction; the hit rate
/// `(gets − news) / gets` tracks how often the factory was avoided.
pub struct SmartPool<T> {
    idle: Mutex<Vec<T>>,
    new_fn: Factory<T>,
    reset_fn: Option<ResetFn<T>>,

    gets: AtomicU64,
    puts: AtomicU64,
    news: AtomicU64,
    start_time: Instant,

    warmup_size: usize,
    max_idle_size: usize,
    target_hit_rate: f64,
}

impl<T: Send + 'static> SmartPool<T> {
    pub fn new(config: SmartPoolConfig<T>) -> Arc<Self> {
        let pool = Arc::new(Self {
            idle: Mutex::new(Vec::with_capacity(config.warmup_size)),
            new_fn: config.new,
            reset_fn: config.reset,
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            news: AtomicU64::new(0),
            start_time: Instant::now(),
            warmup_size: config.warmup_size,
            max_idle_size: config.max_idle_size,
            target_hit_rate: config.target_hit_rate,
        });

        pool.warmup();
        pool
    }

    /// Acquire an object, minting one if the pool is empty.
    pub fn get(&self) -> T {
        self.gets.fetch_add(1, Ordering::Relaxed);

        if let Some(obj) = self.idle.lock().pop() {
            return obj;
        }

        self.news.fetch_add(1, Ordering::Relaxed);
        (self.new_fn)()
    }

    /// Return an object. Reset runs in place; the idle cap drops the
    /// excess.
    pub fn put(&self, mut obj: T) {
        self.puts.fetch_add(1, Ordering::Relaxed);

        if let Some(reset) = &self.reset_fn {
            reset(&mut obj);
        }

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle_size {
            idle.push(obj);
        }
    }

    /// Pre-populate the pool so the first `warmup_size` gets avoid the
    /// factory path.
    pub fn warmup(&self) {
        let mut idle = self.idle.lock();
        for _ in 0..self.warmup_size {
            idle.push((self.new_fn)());
        }
    }

    pub fn stats(&self) -> SmartPoolStats {
        let gets = self.gets.load(Ordering::Relaxed);
        let puts = self.puts.load(Ordering::Relaxed);
        let news = self.news.load(Ordering::Relaxed);

        let hit_rate = if gets > 0 && gets > news {
            (gets - news) as f64 / gets as f64
        } else {
            0.0
        };

        SmartPoolStats {
            gets,
            puts,
            news,
            hit_rate,
            uptime: self.start_time.elapsed(),
            reuse_rate: puts as f64 / (gets + 1) as f64,
        }
    }

    /// One auto-tune step: once the pool has seen enough traffic, a hit
    /// rate below target mints 10% of the warmup size into the pool.
    pub fn optimize(&self) {
        let stats = self.stats();

        if stats.gets >= 1000 && stats.hit_rate < self.target_hit_rate {
            let additional = self.warmup_size / 10;
            debug!(
                hit_rate = stats.hit_rate,
                additional, "pool below target hit rate, warming up"
            );
            let mut idle = self.idle.lock();
            for _ in 0..additional {
                idle.push((self.new_fn)());
            }
        }
    }

    /// Run [`optimize`](Self::optimize) on a periodic tick until the
    /// returned handle is stopped.
    pub fn start_auto_optimize(self: &Arc<Self>, interval: Duration) -> TickerHandle {
        let pool = Arc::clone(self);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = std::thread::Builder::new()
            .name("ravel-pool-tuner".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => pool.optimize(),
                    _ => return,
                }
            })
            .expect("failed to spawn pool tuner thread");

        TickerHandle {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

#[derive(Debug, Clone)]
pub struct SmartPoolStats {
    pub gets: u64,
    pub puts: u64,
    pub news: u64,
    pub hit_rate: f64,
    pub uptime: Duration,
    pub reuse_rate: f64,
}

/// Stops a background ticker thread on drop.
pub struct TickerHandle {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl TickerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TickerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Process-wide memory posture applied before serving begins. In a
/// collected runtime this would be collector tuning; here it maps to arena
/// pre-sizing: buffer-pool baseline plus object-pool warmup.
#[derive(Debug, Clone, Copy)]
pub struct MemoryProfile {
    /// Bytes of buffer memory kept resident from startup.
    pub baseline_bytes: usize,
    /// Warmup size for the context and request pools.
    pub object_warmup: usize,
    /// Target hit rate for the auto-tuner.
    pub target_hit_rate: f64,
}

impl MemoryProfile {
    /// Less frequent allocation work, larger resident baseline.
    pub fn high_throughput() -> Self {
        Self {
            baseline_bytes: 100 << 20,
            object_warmup: 500,
            target_hit_rate: 0.95,
        }
    }

    /// Moderate footprint for latency-sensitive deployments.
    pub fn low_latency() -> Self {
        Self {
            baseline_bytes: 30 << 20,
            object_warmup: 100,
            target_hit_rate: 0.90,
        }
    }

    /// No pre-sizing at all; useful for tests.
    pub fn minimal() -> Self {
        Self {
            baseline_bytes: 0,
            object_warmup: 8,
            target_hit_rate: 0.90,
        }
    }
}
