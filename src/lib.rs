// src/lib.rs
pub mod bufpool;
pub mod config;
pub mod conn;
pub mod context;
pub mod engine;
pub mod error;
pub mod http;
pub mod middleware;
pub mod parser;
pub mod poller;
pub mod pool;
pub mod router;
pub mod syscalls;
pub mod workers;

// Re-exports for users
pub use config::Config;
pub use context::Context;
pub use engine::{Engine, EngineConfig};
pub use error::{RavelError, RavelResult};
pub use http::{Method, Request};
pub use middleware::Pipeline;
pub use pool::MemoryProfile;
pub use router::{Handler, Router};
