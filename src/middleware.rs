// src/middleware.rs
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info};

use crate::context::Context;
use crate::router::ArcHandler;
use crate::workers::WorkerPool;

pub type SyncMiddleware = Arc<dyn Fn(&mut Context) + Send + Sync>;
pub type AsyncMiddleware = Arc<dyn Fn(&RequestRecord) + Send + Sync>;

/// Owned, read-only snapshot of a finished request, handed to async
/// middlewares. They run on worker threads after the context may already
/// be back in its pool, so they never see the Context itself.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    pub status: u16,
}

impl RequestRecord {
    fn capture(ctx: &Context) -> Self {
        Self {
            method: ctx.method().to_string(),
            path: ctx.path().to_string(),
            status: ctx.status_code(),
        }
    }
}

/// Ordered middleware chain with abort short-circuiting, an optional
/// recovery boundary, and an async fan-out stage.
pub struct Pipeline {
    sync: Vec<SyncMiddleware>,
    asyncs: Vec<AsyncMiddleware>,
    recover: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            sync: Vec::with_capacity(16),
            asyncs: Vec::with_capacity(8),
            recover: false,
        }
    }

    pub fn use_sync(&mut self, handler: SyncMiddleware) -> &mut Self {
        self.sync.push(handler);
        self
    }

    pub fn use_async(&mut self, handler: AsyncMiddleware) -> &mut Self {
        self.asyncs.push(handler);
        self
    }

    /// Install the recovery boundary: a panic anywhere downstream turns
    /// into an aborted context and a 500 JSON response instead of
    /// propagating.
    pub fn enable_recovery(&mut self) -> &mut Self {
        self.recover = true;
        self
    }

    pub fn has_recovery(&self) -> bool {
        self.recover
    }

    fn run_chain(&self, ctx: &mut Context, terminal: &ArcHandler) {
        for middleware in &self.sync {
            middleware(ctx);
            if ctx.is_aborted() {
                return;
            }
        }
        terminal.handle(ctx);
    }

    /// Run the chain, then fan the async list out to the worker pool. With
    /// recovery installed, a downstream panic is absorbed here; without
    /// it, the panic propagates to the caller's boundary.
    pub fn execute(
        &self,
        ctx: &mut Context,
        terminal: &ArcHandler,
        workers: Option<&Arc<WorkerPool>>,
    ) {
        if self.recover {
            let result = catch_unwind(AssertUnwindSafe(|| self.run_chain(ctx, terminal)));
            if result.is_err() {
                error!("handler panicked, recovered");
                ctx.abort();
                if ctx.headers_sent() {
                    // Response already on the wire: nothing sane to send.
                    ctx.mark_io_failed();
                } else {
                    ctx.json(500, &serde_json::json!({"error": "Internal Server Error"}));
                }
            }
        } else {
            self.run_chain(ctx, terminal);
        }

        if ctx.is_aborted() || self.asyncs.is_empty() {
            return;
        }

        let record = RequestRecord::capture(ctx);
        for middleware in &self.asyncs {
            let task_mw = Arc::clone(middleware);
            let task_record = record.clone();
            let scheduled = match workers {
                Some(pool) => pool.submit(Box::new(move || task_mw(&task_record))),
                None => false,
            };
            if !scheduled {
                middleware(&record);
            }
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

// ---- Stock middlewares ----

/// Monotonic request id, surfaced as the X-Request-ID response header.
pub fn request_id() -> SyncMiddleware {
    let counter = Arc::new(AtomicU64::new(0));
    Arc::new(move |ctx: &mut Context| {
        let id = counter.fetch_add(1, Ordering::Relaxed) + 1;
        ctx.set_header("X-Request-ID", &id.to_string());
    })
}

/// Standard CORS headers; preflight OPTIONS aborts with an empty 204.
pub fn cors() -> SyncMiddleware {
    Arc::new(|ctx: &mut Context| {
        ctx.set_header("Access-Control-Allow-Origin", "*");
        ctx.set_header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        );
        ctx.set_header("Access-Control-Allow-Headers", "Content-Type, Authorization");

        if ctx.method() == "OPTIONS" {
            ctx.abort();
            ctx.empty(204);
        }
    })
}

struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
}

/// Token bucket: capacity `requests_per_second`, refilled in full once a
/// second has passed. An empty bucket aborts with a 429 JSON error.
pub fn rate_limiter(requests_per_second: u32) -> SyncMiddleware {
    let bucket = Arc::new(Mutex::new(TokenBucket {
        tokens: requests_per_second,
        last_refill: Instant::now(),
    }));

    Arc::new(move |ctx: &mut Context| {
        let mut b = bucket.lock();

        if b.last_refill.elapsed() > Duration::from_secs(1) {
            b.tokens = requests_per_second;
            b.last_refill = Instant::now();
        }

        if b.tokens > 0 {
            b.tokens -= 1;
            return;
        }
        drop(b);

        ctx.abort();
        ctx.json(429, &serde_json::json!({"error": "Too Many Requests"}));
    })
}

/// Async request logger. Read-only by construction.
pub fn logger() -> AsyncMiddleware {
    Arc::new(|record: &RequestRecord| {
        info!(
            method = %record.method,
            path = %record.path,
            status = record.status,
            "request"
        );
    })
}

/// Aggregate request counters updated off the event loop.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    pub total: AtomicU64,
    pub status_2xx: AtomicU64,
    pub status_4xx: AtomicU64,
    pub status_5xx: AtomicU64,
}

pub fn metrics(counters: Arc<RequestMetrics>) -> AsyncMiddleware {
    Arc::new(move |record: &RequestRecord| {
        counters.total.fetch_add(1, Ordering::Relaxed);
        match record.status {
            200..=299 => counters.status_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => counters.status_4xx.fetch_add(1, Ordering::Relaxed),
            500..=599 => counters.status_5xx.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;
    use crate::parser::parse_request;
    use std::sync::atomic::AtomicUsize;

    fn terminal(hits: &Arc<AtomicUsize>) -> ArcHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |_ctx: &mut Context| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn ctx_for(raw: &[u8]) -> Context {
        let mut req = Request::new();
        parse_request(raw, &mut req).unwrap();
        let mut ctx = Context::new();
        ctx.reset(-1, Some(req));
        ctx
    }

    #[test]
    fn test_chain_runs_in_order_then_terminal() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();

        for i in 0..3 {
            let order = Arc::clone(&order);
            pipeline.use_sync(Arc::new(move |_ctx: &mut Context| {
                order.lock().push(i);
            }));
        }

        let order_t = Arc::clone(&order);
        let terminal: ArcHandler = Arc::new(move |_ctx: &mut Context| {
            order_t.lock().push(99);
        });

        let mut ctx = Context::new();
        pipeline.execute(&mut ctx, &terminal, None);
        assert_eq!(*order.lock(), vec![0, 1, 2, 99]);
    }

    #[test]
    fn test_abort_skips_rest_and_terminal() {
        let hits = Arc::new(AtomicUsize::new(0));
        let later = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();

        pipeline.use_sync(Arc::new(|ctx: &mut Context| ctx.abort()));
        let later_c = Arc::clone(&later);
        pipeline.use_sync(Arc::new(move |_ctx: &mut Context| {
            later_c.fetch_add(1, Ordering::SeqCst);
        }));

        let mut ctx = Context::new();
        pipeline.execute(&mut ctx, &terminal(&hits), None);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recovery_produces_500() {
        let mut pipeline = Pipeline::new();
        pipeline.enable_recovery();

        let panicking: ArcHandler = Arc::new(|_ctx: &mut Context| panic!("boom"));
        let mut ctx = Context::new();
        pipeline.execute(&mut ctx, &panicking, None);

        assert!(ctx.is_aborted());
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(resp.ends_with("{\"error\":\"Internal Server Error\"}"));
    }

    #[test]
    fn test_no_recovery_propagates_panic() {
        let pipeline = Pipeline::new();
        let panicking: ArcHandler = Arc::new(|_ctx: &mut Context| panic!("boom"));

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = Context::new();
            pipeline.execute(&mut ctx, &panicking, None);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_request_id_sets_header() {
        let mw = request_id();
        let mut ctx = Context::new();
        mw(&mut ctx);
        ctx.string(200, "ok");
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.contains("X-Request-ID: 1\r\n"));
    }

    #[test]
    fn test_cors_preflight_aborts_204() {
        let mw = cors();
        let mut ctx = ctx_for(b"OPTIONS /any HTTP/1.1\r\nHost: x\r\n\r\n");
        mw(&mut ctx);

        assert!(ctx.is_aborted());
        let resp = String::from_utf8(ctx.response_bytes().to_vec()).unwrap();
        assert!(resp.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(resp.contains("Access-Control-Allow-Origin: *\r\n"));
    }

    #[test]
    fn test_cors_passthrough_for_get() {
        let mw = cors();
        let mut ctx = ctx_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        mw(&mut ctx);
        assert!(!ctx.is_aborted());
    }

    #[test]
    fn test_rate_limiter_sequence() {
        let mw = rate_limiter(2);

        for expected_aborted in [false, false, true] {
            let mut ctx = ctx_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
            mw(&mut ctx);
            assert_eq!(ctx.is_aborted(), expected_aborted);
        }

        std::thread::sleep(Duration::from_millis(1100));
        let mut ctx = ctx_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        mw(&mut ctx);
        assert!(!ctx.is_aborted());
    }

    #[test]
    fn test_async_middlewares_get_snapshot() {
        let pool = WorkerPool::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = Pipeline::new();
        let seen_c = Arc::clone(&seen);
        pipeline.use_async(Arc::new(move |record: &RequestRecord| {
            seen_c
                .lock()
                .push((record.method.clone(), record.path.clone(), record.status));
        }));

        let terminal: ArcHandler = Arc::new(|ctx: &mut Context| ctx.string(200, "ok"));
        let mut ctx = ctx_for(b"GET /watched HTTP/1.1\r\nHost: x\r\n\r\n");
        pipeline.execute(&mut ctx, &terminal, Some(&pool));

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() {
            assert!(Instant::now() < deadline, "async middleware never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            seen.lock()[0],
            ("GET".to_string(), "/watched".to_string(), 200)
        );
    }

    #[test]
    fn test_async_skipped_when_aborted() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new();
        pipeline.use_sync(Arc::new(|ctx: &mut Context| ctx.abort()));
        let ran_c = Arc::clone(&ran);
        pipeline.use_async(Arc::new(move |_record: &RequestRecord| {
            ran_c.fetch_add(1, Ordering::SeqCst);
        }));

        let hits = Arc::new(AtomicUsize::new(0));
        let mut ctx = Context::new();
        pipeline.execute(&mut ctx, &terminal(&hits), None);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_metrics_counts_by_class() {
        let counters = Arc::new(RequestMetrics::default());
        let mw = metrics(Arc::clone(&counters));

        mw(&RequestRecord {
            method: "GET".into(),
            path: "/".into(),
            status: 200,
        });
        mw(&RequestRecord {
            method: "GET".into(),
            path: "/".into(),
            status: 404,
        });

        assert_eq!(counters.total.load(Ordering::Relaxed), 2);
        assert_eq!(counters.status_2xx.load(Ordering::Relaxed), 1);
        assert_eq!(counters.status_4xx.load(Ordering::Relaxed), 1);
    }
}
