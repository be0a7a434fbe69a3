// src/main.rs
use std::sync::atomic::Ordering;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ravel::{Config, Context, Engine};

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() {
    init_logging();

    let config = Config::load();
    info!(port = config.port, env = %config.env, "starting ravel");

    let mut engine = match Engine::new(config.engine_config()) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "engine init failed");
            std::process::exit(1);
        }
    };

    register_routes(&mut engine);

    // SIGINT/SIGTERM flips the shutdown flag; the run loop drains and
    // returns, and the process exits 0.
    let shutdown = engine.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("signal received, shutting down");
        shutdown.store(true, Ordering::Release);
    }) {
        error!(error = %e, "failed to install signal handler");
    }

    if let Err(e) = engine.run_addr(&config.listen_addr()) {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}

fn register_routes(engine: &mut Engine) {
    engine.enable_recovery();
    engine.use_middleware(ravel::middleware::request_id());
    engine.use_async_middleware(ravel::middleware::logger());

    engine.get("/", |ctx: &mut Context| {
        ctx.string(200, "Welcome to ravel!");
    });

    engine.get("/api/status", |ctx: &mut Context| {
        ctx.json(
            200,
            &serde_json::json!({
                "status": "ok",
                "server": "ravel",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        );
    });

    engine.get("/api/users/:id", |ctx: &mut Context| {
        let id = ctx.param("id").to_string();
        ctx.json(200, &serde_json::json!({ "user_id": id }));
    });

    engine.get("/api/search", |ctx: &mut Context| {
        let query = ctx.query("q").to_string();
        let page = ctx.query("page").to_string();
        ctx.json(200, &serde_json::json!({ "query": query, "page": page }));
    });

    engine.post("/api/users", |ctx: &mut Context| {
        ctx.json(201, &serde_json::json!({ "message": "User created" }));
    });

    engine.get("/static/*path", |ctx: &mut Context| {
        let rel = ctx.param("path").to_string();
        if rel.contains("..") {
            ctx.error(400, "invalid path");
            return;
        }
        let _ = ctx.serve_file(&format!("public/{}", rel));
    });
}
