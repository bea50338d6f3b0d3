use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use usersys_client::ClientOptions;

const MAX_CONNECT_TIMEOUT_MS: u64 = 60 * 60 * 1000;
const MAX_CALL_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    pub client_options: ClientOptions,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let host = var("USERSYS_HTTP_HOST", "0.0.0.0");
        let port = var("USERSYS_HTTP_PORT", "8080");
        let listen_addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid HTTP listen address {}:{}", host, port))?;

        let rpc_addr = resolve(&var("USERSYS_RPC_ADDR", "127.0.0.1:9090"))?;

        let connect_ms = bounded(
            &var("USERSYS_CONNECT_TIMEOUT_MS", "3000"),
            "USERSYS_CONNECT_TIMEOUT_MS",
            MAX_CONNECT_TIMEOUT_MS,
        )?;
        let call_secs = bounded(
            &var("USERSYS_CALL_TIMEOUT_SECS", "10"),
            "USERSYS_CALL_TIMEOUT_SECS",
            MAX_CALL_TIMEOUT_SECS,
        )?;

        Ok(Self {
            listen_addr,
            rpc_addr,
            client_options: ClientOptions {
                connect_timeout: Duration::from_millis(connect_ms),
                call_timeout: Duration::from_secs(call_secs),
            },
        })
    }
}

/// `host:port`, where host may be a name. Resolved once, at startup.
fn resolve(raw: &str) -> Result<SocketAddr> {
    raw.to_socket_addrs()
        .with_context(|| format!("USERSYS_RPC_ADDR has invalid value {:?}", raw))?
        .next()
        .ok_or_else(|| anyhow!("USERSYS_RPC_ADDR {:?} resolved to no addresses", raw))
}

fn bounded(raw: &str, key: &str, max: u64) -> Result<u64> {
    let value: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{} has invalid value {:?}", key, raw))?;
    if value > max {
        bail!("{} of {} exceeds the maximum of {}", key, value, max);
    }
    Ok(value)
}
