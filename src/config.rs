use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;
use clap::Parser;

use crate::engine::EngineConfig;
use crate::limits::{MAX_BCRYPT_COST, MAX_CONNECTIONS, MIN_BCRYPT_COST};
use crate::wire::SlotPolicy;

/// Slotbook - booking consistency engine speaking the PostgreSQL wire protocol
#[derive(Parser, Debug, Clone)]
#[command(name = "slotbook", version, long_about = None)]
pub struct Config {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0", env = "SLOTBOOK_BIND")]
    pub bind: String,

    /// Listen port
    #[arg(long, default_value_t = 5433, env = "SLOTBOOK_PORT")]
    pub port: u16,

    /// Directory holding the write-ahead log
    #[arg(long, default_value = "./data", env = "SLOTBOOK_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Password every client connection must present
    #[arg(long, default_value = "slotbook", env = "SLOTBOOK_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, default_value_t = MAX_CONNECTIONS, env = "SLOTBOOK_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// WAL appends between compactions
    #[arg(long, default_value_t = 1000, env = "SLOTBOOK_COMPACT_THRESHOLD")]
    pub compact_threshold: u64,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "SLOTBOOK_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    #[arg(long, env = "SLOTBOOK_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "SLOTBOOK_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Required slot length in minutes; 0 accepts any length
    #[arg(long, default_value_t = 60, env = "SLOTBOOK_SLOT_MINUTES")]
    pub slot_minutes: u32,

    /// Lifetime of a login session
    #[arg(long, default_value_t = 3600, env = "SLOTBOOK_SESSION_TTL_SECS")]
    pub session_ttl_secs: u32,

    /// bcrypt work factor for stored secrets
    #[arg(long, default_value_t = bcrypt::DEFAULT_COST, env = "SLOTBOOK_BCRYPT_COST",
          value_parser = clap::value_parser!(u32).range(i64::from(MIN_BCRYPT_COST)..=i64::from(MAX_BCRYPT_COST)))]
    pub bcrypt_cost: u32,

    /// How long a transaction waits for one row lock
    #[arg(long, default_value_t = 2000, env = "SLOTBOOK_LOCK_TIMEOUT_MS")]
    pub lock_timeout_ms: u64,

    #[arg(long, default_value_t = 3, env = "SLOTBOOK_TXN_MAX_ATTEMPTS",
          value_parser = clap::value_parser!(u32).range(1..))]
    pub txn_max_attempts: u32,

    #[arg(long, default_value_t = 10, env = "SLOTBOOK_RETRY_BACKOFF_MS")]
    pub retry_backoff_ms: u64,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            txn_max_attempts: self.txn_max_attempts,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            bcrypt_cost: self.bcrypt_cost,
        }
    }

    pub fn slot_policy(&self) -> SlotPolicy {
        SlotPolicy { minutes: self.slot_minutes }
    }

    pub fn session_ttl(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.session_ttl_secs))
    }
}
