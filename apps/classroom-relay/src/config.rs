use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub instance_id: String,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub redis_cluster_nodes: Vec<String>,
    pub room_ttl: Duration,
    pub block_timeout: Duration,
    pub attendance_grace: Duration,
    pub sweep_interval: Duration,
    pub sweep_lock_ttl: Duration,
    pub accounting_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = std::env::var("CLASSROOM_RELAY_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8090".into())
            .parse()
            .context("CLASSROOM_RELAY_ADDR is not a socket address")?;
        let log_filter =
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,classroom_relay=debug".into());
        let instance_id = std::env::var("CLASSROOM_INSTANCE_ID")
            .unwrap_or_else(|_| format!("relay-{}", uuid::Uuid::new_v4()));
        let store_backend = StoreBackend::from_env();
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let redis_cluster_nodes = std::env::var("REDIS_CLUSTER_NODES")
            .map(|raw| parse_nodes(&raw))
            .unwrap_or_default();
        let room_ttl = Duration::from_secs(env_or("CLASSROOM_ROOM_TTL_SECS", 24 * 60 * 60)?);
        let block_timeout = Duration::from_millis(env_or("CLASSROOM_BLOCK_TIMEOUT_MS", 5_000)?);
        let attendance_grace = Duration::from_secs(env_or("ATTENDANCE_GRACE_SECS", 300)?);
        let sweep_interval = Duration::from_millis(env_or("ATTENDANCE_SWEEP_INTERVAL_MS", 30_000)?);
        let sweep_lock_ttl = Duration::from_millis(env_or("ATTENDANCE_LOCK_TTL_MS", 25_000)?);
        let accounting_url = std::env::var("ACCOUNTING_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        Ok(Self {
            bind_addr,
            log_filter,
            instance_id,
            store_backend,
            redis_url,
            redis_cluster_nodes,
            room_ttl,
            block_timeout,
            attendance_grace,
            sweep_interval,
            sweep_lock_ttl,
            accounting_url,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process-local store; state is lost on exit and not shared between instances.
    Memory,
    Redis,
}

impl StoreBackend {
    fn from_env() -> Self {
        match std::env::var("CLASSROOM_STORE_BACKEND")
            .unwrap_or_else(|_| "redis".into())
            .as_str()
        {
            "memory" => StoreBackend::Memory,
            _ => StoreBackend::Redis,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn parse_nodes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(|node| {
            if node.contains("://") {
                node.to_string()
            } else {
                format!("redis://{node}")
            }
        })
        .collect()
}
