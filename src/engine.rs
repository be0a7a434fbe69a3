// src/engine.rs
//
// The event loop: accepts connections, drives the per-connection state
// machine off poller readiness, parses and dispatches requests through the
// middleware pipeline, and applies keep-alive and close semantics. One
// thread runs the loop; the idle reaper, pool tuners, and stats reporter
// tick on background threads; worker threads take offloaded tasks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bufpool::BufferPool;
use crate::conn::{ConnState, Connection, ConnectionPool};
use crate::context::Context;
use crate::error::RavelResult;
use crate::http::{append_int, Method, Request};
use crate::middleware::{AsyncMiddleware, Pipeline, SyncMiddleware};
use crate::parser::{self, ParseError};
use crate::poller::{Poller, EVENT_BATCH};
use crate::pool::{MemoryProfile, SmartPool, SmartPoolConfig};
use crate::router::{Handler, Params, Router};
use crate::syscalls;
use crate::workers::{Task, WorkerPool};

const KEEPALIVE_PROBE_DELAY_SECS: i32 = 30;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    /// Worker thread count; 0 means one per logical CPU.
    pub workers: usize,
    /// Keep-alive connections are closed after serving this many requests.
    pub max_requests_per_conn: u32,
    pub read_buffer_size: usize,
    pub memory_profile: MemoryProfile,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(5),
            workers: 0,
            max_requests_per_conn: 10_000,
            read_buffer_size: 8192,
            memory_profile: MemoryProfile::high_throughput(),
        }
    }
}

/// What to do with the connection after handling an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
    Detach,
}

/// State shared with the reaper and reporter threads.
struct Shared {
    connections: RwLock<HashMap<RawFd, Arc<Mutex<Connection>>>>,
    poller: Poller,
    context_pool: Arc<SmartPool<Context>>,
    request_pool: Arc<SmartPool<Request>>,
    byte_pool: Arc<BufferPool>,
    connection_pool: ConnectionPool,
    worker_pool: Arc<WorkerPool>,
    idle_timeout: Duration,
    read_timeout: Duration,
}

impl Shared {
    /// Tear a connection down in strict order: poller first so no further
    /// events arrive, then pooled resources, then the fd, then the record.
    fn close_connection(&self, fd: RawFd) {
        let entry = self.connections.write().remove(&fd);
        let Some(arc) = entry else { return };

        let _ = self.poller.remove(fd);

        {
            let mut conn = arc.lock();
            if let Some(req) = conn.request.take() {
                self.request_pool.put(req);
            }
            if let Some(buf) = conn.read_buf.take() {
                self.byte_pool.put(buf);
            }
            syscalls::close_fd(fd);
        }

        if let Ok(mutex) = Arc::try_unwrap(arc) {
            self.connection_pool.put(mutex.into_inner());
        }
    }

    /// Forget a connection without closing its socket: the detaching
    /// handler owns the fd from here on.
    fn detach_connection(&self, fd: RawFd) {
        let entry = self.connections.write().remove(&fd);
        let Some(arc) = entry else { return };

        let _ = self.poller.remove(fd);

        {
            let mut conn = arc.lock();
            if let Some(req) = conn.request.take() {
                self.request_pool.put(req);
            }
            if let Some(buf) = conn.read_buf.take() {
                self.byte_pool.put(buf);
            }
        }

        if let Ok(mutex) = Arc::try_unwrap(arc) {
            self.connection_pool.put(mutex.into_inner());
        }
    }

    /// One reaper sweep: close every non-Processing connection that has
    /// idled past the limit, plus reads that stalled past the read
    /// timeout.
    fn reap_idle(&self) {
        let now = Instant::now();
        let mut to_close = Vec::new();

        {
            let table = self.connections.read();
            for (&fd, arc) in table.iter() {
                // A busy connection holds its lock; busy is not idle.
                let Some(conn) = arc.try_lock() else { continue };
                if conn.state == ConnState::Processing {
                    continue;
                }

                let idle_expired = conn
                    .last_active
                    .map_or(false, |t| now.duration_since(t) > self.idle_timeout);
                let read_stalled = conn
                    .request_started
                    .map_or(false, |t| now.duration_since(t) > self.read_timeout);

                if idle_expired || read_stalled {
                    to_close.push(fd);
                }
            }
        }

        for fd in to_close {
            debug!(fd, "reaping idle connection");
            self.close_connection(fd);
        }
    }
}

/// The HTTP engine: router, pollers, pools, and the acceptor loop.
pub struct Engine {
    config: EngineConfig,
    router: Router,
    pipeline: Pipeline,
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    listen_fd: Option<RawFd>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> RavelResult<Self> {
        let profile = config.memory_profile;

        let byte_pool = Arc::new(BufferPool::new());
        byte_pool.preload(profile.baseline_bytes);

        let context_pool = SmartPool::new(
            SmartPoolConfig::new(Context::new)
                .reset(|ctx: &mut Context| ctx.reset(-1, None))
                .warmup_size(profile.object_warmup)
                .target_hit_rate(profile.target_hit_rate),
        );

        let request_pool = SmartPool::new(
            SmartPoolConfig::new(Request::new)
                .reset(Request::reset)
                .warmup_size(profile.object_warmup)
                .target_hit_rate(profile.target_hit_rate),
        );

        let worker_pool = WorkerPool::new(config.workers);

        info!(
            context_warmup = profile.object_warmup,
            request_warmup = profile.object_warmup,
            baseline_bytes = profile.baseline_bytes,
            workers = worker_pool.num_workers(),
            "pools initialized"
        );

        let shared = Arc::new(Shared {
            connections: RwLock::new(HashMap::with_capacity(10_000)),
            poller: Poller::new()?,
            context_pool,
            request_pool,
            byte_pool,
            connection_pool: ConnectionPool::new(10_000),
            worker_pool,
            idle_timeout: config.idle_timeout,
            read_timeout: config.read_timeout,
        });

        Ok(Self {
            config,
            router: Router::new(),
            pipeline: Pipeline::new(),
            shared,
            shutdown: Arc::new(AtomicBool::new(false)),
            listen_fd: None,
        })
    }

    // ---- Route registration ----

    pub fn route<H: Handler>(&mut self, method: Method, path: &str, handler: H) {
        self.router.add(method, path, Arc::new(handler));
    }

    pub fn get<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Get, path, handler);
    }

    pub fn post<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Post, path, handler);
    }

    pub fn put<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Put, path, handler);
    }

    pub fn delete<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Delete, path, handler);
    }

    pub fn patch<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Patch, path, handler);
    }

    pub fn head<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Head, path, handler);
    }

    pub fn options<H: Handler>(&mut self, path: &str, handler: H) {
        self.route(Method::Options, path, handler);
    }

    // ---- Middleware ----

    pub fn use_middleware(&mut self, middleware: SyncMiddleware) {
        self.pipeline.use_sync(middleware);
    }

    pub fn use_async_middleware(&mut self, middleware: AsyncMiddleware) {
        self.pipeline.use_async(middleware);
    }

    pub fn enable_recovery(&mut self) {
        self.pipeline.enable_recovery();
    }

    // ---- Offloading ----

    /// Submit a task to the work-stealing pool. Returns false after
    /// shutdown.
    pub fn spawn(&self, task: Task) -> bool {
        self.shared.worker_pool.submit(task)
    }

    /// Flag observed by the run loop; setting it drains and stops the
    /// engine. Hand this to a signal handler or a test harness.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.read().len()
    }

    // ---- Serving ----

    /// Bind the listener and report the bound address (useful with port
    /// 0). Must precede [`run`](Self::run).
    pub fn bind(&mut self, addr: &str) -> RavelResult<SocketAddr> {
        let fd = syscalls::create_listen_socket(addr)?;
        self.listen_fd = Some(fd);
        let local = syscalls::local_addr(fd)?;
        info!(%local, "listening");
        Ok(local)
    }

    /// Convenience: bind then run.
    pub fn run_addr(&mut self, addr: &str) -> RavelResult<()> {
        self.bind(addr)?;
        self.run()
    }

    /// Drive the event loop until the shutdown flag is set, then drain.
    pub fn run(&mut self) -> RavelResult<()> {
        let listen_fd = self
            .listen_fd
            .expect("run() requires a successful bind() first");

        self.shared.poller.add(listen_fd)?;

        let reaper = spawn_reaper(Arc::clone(&self.shared), Arc::clone(&self.shutdown));
        let reporter = spawn_reporter(Arc::clone(&self.shared), Arc::clone(&self.shutdown));
        let _ctx_tuner = self
            .shared
            .context_pool
            .start_auto_optimize(Duration::from_secs(30));
        let _req_tuner = self
            .shared
            .request_pool
            .start_auto_optimize(Duration::from_secs(30));

        let mut ready: Vec<RawFd> = Vec::with_capacity(EVENT_BATCH);

        while !self.shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.shared.poller.wait(&mut ready, 100) {
                error!(error = %e, "poller wait error");
                continue;
            }

            for i in 0..ready.len() {
                let fd = ready[i];
                if fd == listen_fd {
                    self.accept_connections(listen_fd);
                } else {
                    self.handle_event(fd);
                }
            }
        }

        info!("shutting down: draining connections");
        let _ = self.shared.poller.remove(listen_fd);
        syscalls::close_fd(listen_fd);
        self.listen_fd = None;

        let open: Vec<RawFd> = self.shared.connections.read().keys().copied().collect();
        for fd in open {
            self.shared.close_connection(fd);
        }

        self.shared.worker_pool.close();
        let _ = reaper.join();
        let _ = reporter.join();

        info!("engine stopped");
        Ok(())
    }

    /// Drain the accept queue: non-blocking accept until would-block.
    fn accept_connections(&self, listen_fd: RawFd) {
        loop {
            let fd = match syscalls::accept_connection(listen_fd) {
                Ok(Some(fd)) => fd,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    return;
                }
            };

            if self.shared.connections.read().len() >= self.config.max_connections {
                warn!(fd, "connection limit reached, refusing");
                syscalls::close_fd(fd);
                continue;
            }

            syscalls::set_client_socket_opts(fd, KEEPALIVE_PROBE_DELAY_SECS);

            let mut conn = self.shared.connection_pool.get();
            conn.fd = fd;
            conn.state = ConnState::Reading;
            conn.read_buf = Some(self.shared.byte_pool.get(self.config.read_buffer_size));
            conn.read_offset = 0;
            conn.keep_alive = true;
            conn.last_active = Some(Instant::now());

            if let Err(e) = self.shared.poller.add(fd) {
                warn!(fd, error = %e, "poller registration failed");
                if let Some(buf) = conn.read_buf.take() {
                    self.shared.byte_pool.put(buf);
                }
                self.shared.connection_pool.put(conn);
                syscalls::close_fd(fd);
                continue;
            }

            self.shared
                .connections
                .write()
                .insert(fd, Arc::new(Mutex::new(conn)));
        }
    }

    fn handle_event(&self, fd: RawFd) {
        let Some(arc) = self.shared.connections.read().get(&fd).cloned() else {
            return;
        };

        let flow = {
            let mut conn = arc.lock();
            conn.last_active = Some(Instant::now());

            match conn.state {
                ConnState::Reading | ConnState::KeepAlive => self.handle_read(&mut conn),
                ConnState::Writing => {
                    conn.state = ConnState::KeepAlive;
                    Flow::Continue
                }
                ConnState::Processing => Flow::Continue,
            }
        };

        match flow {
            Flow::Continue => {}
            Flow::Close => self.shared.close_connection(fd),
            Flow::Detach => self.shared.detach_connection(fd),
        }
    }

    fn handle_read(&self, conn: &mut Connection) -> Flow {
        let fd = conn.fd;

        if conn.read_buf.is_none() {
            conn.read_buf = Some(self.shared.byte_pool.get(self.config.read_buffer_size));
        }

        {
            let buf = conn.read_buf.as_mut().unwrap();
            if conn.read_offset >= buf.len() {
                // A previous pass already diagnosed an over-long request.
                self.send_error(fd, 400, "Bad Request");
                return Flow::Close;
            }

            match syscalls::read_fd(fd, &mut buf[conn.read_offset..]) {
                Ok(0) => return Flow::Close, // peer closed
                Ok(n) => {
                    if conn.read_offset == 0 {
                        conn.request_started = Some(Instant::now());
                    }
                    conn.read_offset += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Flow::Continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Flow::Continue,
                Err(_) => return Flow::Close,
            }
        }

        self.process_buffer(conn)
    }

    /// Walk the read buffer request by request (pipelining), dispatching
    /// each in arrival order. Leftover partial bytes are compacted to the
    /// front for the next readiness event.
    fn process_buffer(&self, conn: &mut Connection) -> Flow {
        let mut pos = 0usize;

        loop {
            let mut req = self.shared.request_pool.get();

            let parse_result = {
                let buf = conn.read_buf.as_ref().unwrap();
                parser::parse_request(&buf[pos..conn.read_offset], &mut req)
            };

            match parse_result {
                Ok(consumed) => {
                    pos += consumed;
                    conn.state = ConnState::Processing;
                    conn.request_started = None;
                    conn.requests_served += 1;

                    match self.dispatch(conn, req) {
                        Flow::Close => return Flow::Close,
                        Flow::Detach => return Flow::Detach,
                        Flow::Continue => {
                            conn.state = ConnState::Reading;
                            conn.last_active = Some(Instant::now());

                            if conn.requests_served >= self.config.max_requests_per_conn {
                                debug!(fd = conn.fd, "request cap reached, closing");
                                return Flow::Close;
                            }

                            if pos >= conn.read_offset {
                                conn.read_offset = 0;
                                return Flow::Continue;
                            }
                            // More pipelined bytes: keep parsing.
                        }
                    }
                }
                Err(ParseError::Incomplete) => {
                    self.shared.request_pool.put(req);

                    let buf_len = conn.read_buf.as_ref().unwrap().len();
                    if pos == 0 && conn.read_offset >= buf_len {
                        // One request overflowing the buffer is a hard 400.
                        self.send_error(conn.fd, 400, "Bad Request");
                        return Flow::Close;
                    }
                    if pos > 0 {
                        let buf = conn.read_buf.as_mut().unwrap();
                        buf.copy_within(pos..conn.read_offset, 0);
                        conn.read_offset -= pos;
                    }
                    if conn.read_offset > 0 && conn.request_started.is_none() {
                        conn.request_started = Some(Instant::now());
                    }
                    return Flow::Continue;
                }
                Err(ParseError::Invalid) => {
                    self.shared.request_pool.put(req);
                    self.send_error(conn.fd, 400, "Bad Request");
                    return Flow::Close;
                }
            }
        }
    }

    /// Route, run the pipeline, and decide keep-alive.
    fn dispatch(&self, conn: &mut Connection, req: Request) -> Flow {
        let method = Method::from_bytes(req.method.as_bytes());

        // HTTP/1.0 closes after the response; so does Connection: close.
        let keep_alive =
            req.proto != "HTTP/1.0" && !req.connection.eq_ignore_ascii_case("close");

        let mut params = Params::new();
        let found = self.router.find(method, &req.path, &mut params);

        let Some(handler) = found.cloned() else {
            drop(params);
            self.shared.request_pool.put(req);
            if !self.send_error(conn.fd, 404, "Not Found") {
                return Flow::Close;
            }
            return if keep_alive { Flow::Continue } else { Flow::Close };
        };

        let mut ctx = self.shared.context_pool.get();
        ctx.reset(conn.fd, None);
        ctx.set_write_timeout(self.config.write_timeout);
        for (k, v) in params.iter() {
            ctx.set_param(k, v);
        }
        drop(params);
        ctx.attach_request(req);

        let panicked = catch_unwind(AssertUnwindSafe(|| {
            self.pipeline
                .execute(&mut ctx, &handler, Some(&self.shared.worker_pool));
        }))
        .is_err();

        let detached = ctx.is_detached();
        let io_failed = ctx.io_failed();
        if let Some(req) = ctx.take_request() {
            self.shared.request_pool.put(req);
        }
        self.shared.context_pool.put(ctx);

        if panicked {
            // No recovery installed: the connection is forfeit.
            warn!(fd = conn.fd, "handler panicked without recovery, closing");
            return Flow::Close;
        }
        if detached {
            debug!(fd = conn.fd, "handler detached connection");
            return Flow::Detach;
        }
        if io_failed {
            return Flow::Close;
        }

        if keep_alive {
            Flow::Continue
        } else {
            Flow::Close
        }
    }

    /// Minimal error response straight to the fd, bypassing the context.
    /// Returns false when the write fails.
    fn send_error(&self, fd: RawFd, code: u16, message: &str) -> bool {
        let mut resp = Vec::with_capacity(128);
        resp.extend_from_slice(b"HTTP/1.1 ");
        append_int(&mut resp, code as i64);
        resp.push(b' ');
        resp.extend_from_slice(message.as_bytes());
        resp.extend_from_slice(b"\r\nContent-Type: text/plain\r\nContent-Length: ");
        append_int(&mut resp, message.len() as i64);
        resp.extend_from_slice(b"\r\n\r\n");
        resp.extend_from_slice(message.as_bytes());

        let deadline = Some(Instant::now() + self.config.write_timeout);
        syscalls::write_full(fd, &resp, deadline).is_ok()
    }

    pub fn pool_stats(&self) -> PoolStats {
        let (conn_gets, conn_puts, conn_rate) = self.shared.connection_pool.stats();
        let ctx = self.shared.context_pool.stats();
        let req = self.shared.request_pool.stats();
        let bytes = self.shared.byte_pool.stats();
        let workers = self.shared.worker_pool.stats();

        PoolStats {
            connection: PoolCounters {
                gets: conn_gets,
                puts: conn_puts,
                hit_rate: conn_rate,
            },
            context: PoolCounters {
                gets: ctx.gets,
                puts: ctx.puts,
                hit_rate: ctx.hit_rate,
            },
            request: PoolCounters {
                gets: req.gets,
                puts: req.puts,
                hit_rate: req.hit_rate,
            },
            byte_pool: ByteCounters {
                gets: bytes.gets,
                puts: bytes.puts,
                misses: bytes.misses,
                idle_per_tier: bytes.idle_per_tier,
            },
            workers: WorkerCounters {
                num_workers: workers.num_workers,
                tasks_submitted: workers.tasks_submitted,
                tasks_completed: workers.tasks_completed,
                steals_success: workers.steals_success,
                steals_failed: workers.steals_failed,
            },
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(fd) = self.listen_fd.take() {
            syscalls::close_fd(fd);
        }
        self.shared.worker_pool.close();
    }
}

fn spawn_reaper(shared: Arc<Shared>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("ravel-reaper".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                // 1 s tick, sliced so shutdown is observed promptly.
                for _ in 0..10 {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                shared.reap_idle();
            }
        })
        .expect("failed to spawn reaper thread")
}

fn spawn_reporter(shared: Arc<Shared>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("ravel-stats".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                for _ in 0..50 {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                let ctx = shared.context_pool.stats();
                let req = shared.request_pool.stats();
                let workers = shared.worker_pool.stats();
                debug!(
                    connections = shared.connections.read().len(),
                    context_hit_rate = ctx.hit_rate,
                    request_hit_rate = req.hit_rate,
                    tasks_completed = workers.tasks_completed,
                    steals = workers.steals_success,
                    "engine stats"
                );
            }
        })
        .expect("failed to spawn stats thread")
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolCounters {
    pub gets: u64,
    pub puts: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ByteCounters {
    pub gets: u64,
    pub puts: u64,
    pub misses: u64,
    pub idle_per_tier: Vec<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerCounters {
    pub num_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub steals_success: u64,
    pub steals_failed: u64,
}

/// Aggregate statistics across every pool the engine owns.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connection: PoolCounters,
    pub context: PoolCounters,
    pub request: PoolCounters,
    pub byte_pool: ByteCounters,
    pub workers: WorkerCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            memory_profile: MemoryProfile::minimal(),
            workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_engine_builds_and_registers_routes() {
        let mut engine = Engine::new(test_config()).unwrap();
        engine.get("/", |ctx: &mut Context| ctx.string(200, "ok"));
        engine.post("/items", |ctx: &mut Context| ctx.string(201, "made"));
        engine.get("/items/:id", |ctx: &mut Context| {
            let id = ctx.param("id").to_string();
            ctx.string(200, &id);
        });
        assert_eq!(engine.router.route_count(), 3);
    }

    #[test]
    fn test_pool_stats_snapshot() {
        let engine = Engine::new(test_config()).unwrap();
        let stats = engine.pool_stats();
        assert_eq!(stats.workers.num_workers, 2);
        assert_eq!(stats.context.gets, 0);
    }

    #[test]
    fn test_spawn_offloads() {
        let engine = Engine::new(test_config()).unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&flag);
        assert!(engine.spawn(Box::new(move || f.store(true, Ordering::SeqCst))));

        let deadline = Instant::now() + Duration::from_secs(2);
        while !flag.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
