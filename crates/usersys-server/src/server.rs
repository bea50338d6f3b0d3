//! Accept loop and connection bookkeeping.
//!
//! One OS thread per accepted connection. Each worker serves a single
//! request and exits. Every live stream is tracked so that `stop` can cut
//! in-flight workers off instead of waiting for them.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use usersys_protocol::TransportError;

use crate::connection::handle_connection;
use crate::dispatcher::Dispatcher;

const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed `accept` so fd exhaustion doesn't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Budget for reading the request and writing the reply, from accept.
    pub read_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
        }
    }
}

pub struct RpcServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    options: ServerOptions,
    shared: Arc<Shared>,
}

struct Shared {
    local_addr: SocketAddr,
    running: AtomicBool,
    connections: Mutex<HashMap<Uuid, TcpStream>>,
    served: Mutex<u32>,
}

/// Control and introspection for a running server. Cheap to clone.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl RpcServer {
    /// Bind the listening socket. This is the only fatal server error.
    pub fn bind(
        addr: SocketAddr,
        dispatcher: Dispatcher,
        options: ServerOptions,
    ) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            dispatcher,
            options,
            shared: Arc::new(Shared {
                local_addr,
                running: AtomicBool::new(true),
                connections: Mutex::new(HashMap::new()),
                served: Mutex::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until `ServerHandle::stop` is called.
    pub fn run(self) {
        info!("RPC server listening on {}", self.shared.local_addr);

        for incoming in self.listener.incoming() {
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            match incoming {
                Ok(stream) => self.serve(stream),
                Err(e) => {
                    error!("RPC accept error: {}", e);
                    std::thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }

        info!("RPC server on {} stopped", self.shared.local_addr);
    }

    /// Run the accept loop on its own thread.
    pub fn spawn(self) -> io::Result<(ServerHandle, JoinHandle<()>)> {
        let handle = self.handle();
        let join = std::thread::Builder::new()
            .name("usersys-accept".into())
            .spawn(move || self.run())?;
        Ok((handle, join))
    }

    fn serve(&self, stream: TcpStream) {
        let peer = stream.peer_addr().ok();
        let _ = stream.set_nodelay(true);

        let tracked = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!("Dropping connection from {:?}: {}", peer, e);
                return;
            }
        };

        let id = Uuid::new_v4();
        {
            let mut connections = self.shared.connections();
            // `stop` flips the flag before draining, so checking under the
            // lock guarantees nothing is registered after the drain.
            if !self.shared.running.load(Ordering::SeqCst) {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
            connections.insert(id, tracked);
        }

        let seq = {
            let mut served = self.shared.served.lock().unwrap_or_else(PoisonError::into_inner);
            *served = served.wrapping_add(1);
            *served
        };
        debug!(seq, peer = ?peer, "connection accepted");

        let registration = Registration {
            shared: self.shared.clone(),
            id,
        };
        let dispatcher = self.dispatcher.clone();
        let timeout = self.options.read_timeout;
        let spawned = std::thread::Builder::new()
            .name("usersys-conn".into())
            .spawn(move || {
                let _registration = registration;
                match handle_connection(stream, &dispatcher, timeout) {
                    Ok(()) => debug!(seq, "connection closed"),
                    Err(TransportError::TimedOut) => {
                        warn!(seq, peer = ?peer, "connection dropped: deadline elapsed")
                    }
                    Err(e) => warn!(seq, peer = ?peer, "connection dropped: {}", e),
                }
            });

        // On failure the closure, and with it the registration, is dropped.
        if let Err(e) = spawned {
            error!("Failed to spawn connection worker: {}", e);
        }
    }
}

/// A stream's entry in the live set. Dropping it removes the entry and shuts
/// the tracked clone down, including when the worker unwinds from a panic.
struct Registration {
    shared: Arc<Shared>,
    id: Uuid,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(stream) = self.shared.connections().remove(&self.id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Shared {
    fn connections(&self) -> MutexGuard<'_, HashMap<Uuid, TcpStream>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Close every tracked connection and the listener. No drain period:
    /// in-flight workers see their socket I/O fail and exit. Idempotent.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let streams: Vec<TcpStream> = self
            .shared
            .connections()
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        for stream in &streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!("Stopping RPC server, closed {} live connections", streams.len());

        // Unblock `accept`; the loop sees `running == false` and exits,
        // dropping the listener.
        let wake = wake_addr(self.shared.local_addr);
        if let Err(e) = TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
            debug!("Wake-up connect to {} failed: {}", wake, e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Connections accepted and not yet closed.
    pub fn live_connections(&self) -> usize {
        self.shared.connections().len()
    }

    /// Connections accepted since start.
    pub fn request_count(&self) -> u32 {
        *self.shared.served.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn wake_addr(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}
