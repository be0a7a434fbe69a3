// src/conn.rs
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Processing,
    Writing,
    KeepAlive,
}

/// An accepted socket moving through the per-connection state machine.
///
/// The read buffer is leased from the byte pool for the life of the
/// connection; the Request slot is only occupied between parse and
/// dispatch. At most one pipeline stage touches a Connection at a time.
pub struct Connection {
    pub fd: RawFd,
    pub state: ConnState,
    pub read_buf: Option<Vec<u8>>,
    pub read_offset: usize,
    pub request: Option<Request>,
    pub last_active: Option<Instant>,
    /// First byte of the current request, for read-timeout enforcement.
    pub request_started: Option<Instant>,
    pub keep_alive: bool,
    pub requests_served: u32,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            fd: -1,
            state: ConnState::Reading,
            read_buf: None,
            read_offset: 0,
            request: None,
            last_active: None,
            request_started: None,
            keep_alive: false,
            requests_served: 0,
        }
    }

    /// Return the record to its pooled baseline. Leased resources must be
    /// handed back to their own pools before this runs.
    pub fn reset(&mut self) {
        self.fd = -1;
        self.state = ConnState::Reading;
        self.read_buf = None;
        self.read_offset = 0;
        self.request = None;
        self.last_active = None;
        self.request_started = None;
        self.keep_alive = false;
        self.requests_served = 0;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity-bounded pool of Connection records.
pub struct ConnectionPool {
    idle: Mutex<Vec<Connection>>,
    capacity: usize,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> Connection {
        self.gets.fetch_add(1, Ordering::Relaxed);
        self.idle.lock().pop().unwrap_or_else(Connection::new)
    }

    pub fn put(&self, mut conn: Connection) {
        conn.reset();
        self.puts.fetch_add(1, Ordering::Relaxed);
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(conn);
        }
    }

    /// (gets, puts, reuse ratio)
    pub fn stats(&self) -> (u64, u64, f64) {
        let gets = self.gets.load(Ordering::Relaxed);
        let puts = self.puts.load(Ordering::Relaxed);
        let rate = if gets > 0 {
            puts as f64 / gets as f64
        } else {
            0.0
        };
        (gets, puts, rate)
    }
}
