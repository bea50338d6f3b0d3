use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use usersys_db::{Database, InMemorySessionStore};
use usersys_server::{Dispatcher, RpcServer, ServerConfig, ServerOptions, auth};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "usersysd=debug,usersys_server=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let db = Database::open(&config.db_path)
        .with_context(|| format!("open database {}", config.db_path.display()))?;

    if config.seed_users > 0 && db.count_users()? == 0 {
        info!("Seeding {} test users", config.seed_users);
        let hash = auth::hash_password(&config.seed_password)?;
        db.seed_users(config.seed_users, &hash)?;
    }
    info!("User store ready ({} users)", db.count_users()?);

    let sessions = Arc::new(InMemorySessionStore::new());
    sessions.spawn_sweeper(SWEEP_INTERVAL)?;

    let dispatcher = Dispatcher::new(Arc::new(db), sessions, config.session_ttl);
    let server = RpcServer::bind(
        config.listen_addr,
        dispatcher,
        ServerOptions {
            read_timeout: config.read_timeout,
        },
    )
    .with_context(|| format!("bind {}", config.listen_addr))?;

    let handle = server.handle();
    let mut accept = tokio::task::spawn_blocking(move || server.run());

    tokio::select! {
        res = &mut accept => {
            if let Err(e) = res {
                error!("Accept loop panicked: {}", e);
            }
        }
        _ = shutdown_signal() => {
            handle.stop();
            let _ = accept.await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
