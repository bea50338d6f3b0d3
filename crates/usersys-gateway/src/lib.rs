//! HTTP/JSON front end for the user service.
//!
//! Every route maps onto one or two RPC calls. The gateway holds no session
//! state and never looks inside tokens; it only forwards them.

pub mod config;
pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use usersys_client::{ClientOptions, RpcClient};

pub use config::GatewayConfig;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub rpc_addr: SocketAddr,
    pub client_options: ClientOptions,
}

impl AppStateInner {
    /// A fresh client per request; one `RpcClient` allows a single call in
    /// flight.
    pub fn client(&self) -> RpcClient {
        RpcClient::with_options(self.rpc_addr, self.client_options.clone())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/login", post(routes::login))
        .route(
            "/api/profile",
            get(routes::get_profile).put(routes::update_profile),
        )
        .route("/api/update-info", post(routes::update_info))
        .route("/api/logout", post(routes::logout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
