pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod server;

pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use server::{RpcServer, ServerHandle, ServerOptions};
