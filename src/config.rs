// src/config.rs
use std::time::Duration;

use clap::Parser;

use crate::engine::EngineConfig;
use crate::pool::MemoryProfile;

/// Server configuration from flags, each overridable by a RAVEL_-prefixed
/// environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "ravel", about = "High-throughput HTTP/1.1 server", version)]
pub struct Config {
    /// HTTP server port
    #[arg(long, default_value_t = 8080, env = "RAVEL_PORT")]
    pub port: u16,

    /// HTTP read timeout (seconds)
    #[arg(long, default_value_t = 10, env = "RAVEL_READ_TIMEOUT")]
    pub read_timeout: u64,

    /// HTTP write timeout (seconds)
    #[arg(long, default_value_t = 30, env = "RAVEL_WRITE_TIMEOUT")]
    pub write_timeout: u64,

    /// Environment (development/production)
    #[arg(long, default_value = "development", env = "RAVEL_ENV")]
    pub env: String,
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Engine settings derived from the CLI surface. Development keeps the
    /// smaller low-latency footprint; production pre-sizes for throughput.
    pub fn engine_config(&self) -> EngineConfig {
        let memory_profile = if self.env == "production" {
            MemoryProfile::high_throughput()
        } else {
            MemoryProfile::low_latency()
        };

        EngineConfig {
            read_timeout: Duration::from_secs(self.read_timeout),
            write_timeout: Duration::from_secs(self.write_timeout),
            memory_profile,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::parse_from(["ravel"]);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.read_timeout, 10);
        assert_eq!(cfg.write_timeout, 30);
        assert_eq!(cfg.env, "development");
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_flag_overrides() {
        let cfg = Config::parse_from([
            "ravel",
            "--port",
            "9090",
            "--read-timeout",
            "5",
            "--env",
            "production",
        ]);
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.read_timeout, 5);
        assert_eq!(cfg.env, "production");

        let ec = cfg.engine_config();
        assert_eq!(ec.read_timeout, Duration::from_secs(5));
    }
}
