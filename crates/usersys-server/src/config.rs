use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Upper bound for any configured duration: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// `usersysd` settings, read from the environment after `.env` is loaded.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    pub session_ttl: Duration,
    pub read_timeout: Duration,
    /// Users to create at startup if the database is empty. 0 disables.
    pub seed_users: u64,
    pub seed_password: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let host = var("USERSYS_RPC_HOST", "0.0.0.0");
        let port: u16 = parse(&lookup, "USERSYS_RPC_PORT", 9090)?;
        let listen_addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        Ok(Self {
            listen_addr,
            db_path: var("USERSYS_DB_PATH", "usersys.db").into(),
            session_ttl: seconds(&lookup, "USERSYS_SESSION_TTL_SECS", 3600)?,
            read_timeout: seconds(&lookup, "USERSYS_READ_TIMEOUT_SECS", 30)?,
            seed_users: parse(&lookup, "USERSYS_SEED_USERS", 0)?,
            seed_password: var("USERSYS_SEED_PASSWORD", "password"),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value {:?}", key, raw)),
        None => Ok(default),
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    let secs: u64 = parse(lookup, key, default)?;
    if secs > MAX_DURATION_SECS {
        bail!("{} of {}s exceeds the maximum of {}s", key, secs, MAX_DURATION_SECS);
    }
    Ok(Duration::from_secs(secs))
}
