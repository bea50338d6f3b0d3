//! Blocking client for the user service.
//!
//! Every call opens a fresh TCP connection, writes one framed request, reads
//! one framed response and closes. Calls on one client are serialised.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use usersys_protocol::{
    LoginReply, LoginRequest, ProfileReply, Request, Response, TokenRequest, TransportError,
    UpdateProfileRequest, UserProfile, deadline_after, read_frame, write_frame,
};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The round trip never completed. The server may or may not have acted.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with status ERROR.
    #[error("rejected: {message}")]
    Rejected { kind: u32, message: String },

    /// SUCCESS reply whose payload is not the expected shape.
    #[error("malformed reply payload: {0}")]
    MalformedReply(#[source] serde_json::Error),
}

impl ClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The server's message for a rejected call.
    pub fn rejection(&self) -> Option<&str> {
        match self {
            Self::Rejected { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Applies to the TCP connect only.
    pub connect_timeout: Duration,
    /// Absolute budget for writing the request and reading the reply.
    pub call_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(10),
        }
    }
}

pub struct RpcClient {
    addr: SocketAddr,
    options: ClientOptions,
    call_lock: Mutex<()>,
    next_id: Mutex<u32>,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_options(addr, ClientOptions::default())
    }

    pub fn with_options(addr: SocketAddr, options: ClientOptions) -> Self {
        Self {
            addr,
            options,
            call_lock: Mutex::new(()),
            next_id: Mutex::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// One raw round trip. ERROR responses are returned, not raised; only a
    /// failure to complete the exchange is an error.
    pub fn call(&self, request: Request) -> Result<Response, TransportError> {
        let _in_flight = self.call_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let id = self.next_id();
        let kind = request.message_type();
        let frame = request.into_message(id)?.encode()?;

        let mut stream = TcpStream::connect_timeout(&self.addr, self.options.connect_timeout)
            .map_err(TransportError::Connect)?;
        let deadline = deadline_after(self.options.call_timeout)?;

        write_frame(&mut stream, &frame, deadline)?;
        let body = read_frame(&mut stream, deadline)?;
        let response = Response::from_body(&body)?;

        if response.id != id {
            return Err(TransportError::IdMismatch {
                expected: id,
                got: response.id,
            });
        }

        debug!(kind = kind.name(), id, status = ?response.status, "call complete");
        Ok(response)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<LoginReply, ClientError> {
        let response = self.call_ok(Request::Login(LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        }))?;
        payload(response)
    }

    pub fn get_profile(&self, token: &str) -> Result<UserProfile, ClientError> {
        let response = self.call_ok(Request::GetProfile(TokenRequest {
            token: token.to_string(),
        }))?;
        Ok(payload::<ProfileReply>(response)?.user)
    }

    pub fn update_profile(
        &self,
        token: &str,
        nickname: &str,
        profile_pic: &str,
    ) -> Result<UserProfile, ClientError> {
        let response = self.call_ok(Request::UpdateProfile(UpdateProfileRequest {
            token: token.to_string(),
            nickname: nickname.to_string(),
            profile_pic: profile_pic.to_string(),
        }))?;
        Ok(payload::<ProfileReply>(response)?.user)
    }

    pub fn logout(&self, token: &str) -> Result<(), ClientError> {
        self.call_ok(Request::Logout(TokenRequest {
            token: token.to_string(),
        }))?;
        Ok(())
    }

    pub fn heartbeat(&self) -> Result<(), ClientError> {
        self.call_ok(Request::Heartbeat)?;
        Ok(())
    }

    fn call_ok(&self, request: Request) -> Result<Response, ClientError> {
        let response = self.call(request)?;
        if !response.is_success() {
            return Err(ClientError::Rejected {
                kind: response.kind,
                message: response.message,
            });
        }
        Ok(response)
    }

    fn next_id(&self) -> u32 {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        *next = next.wrapping_add(1);
        *next
    }
}

fn payload<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    serde_json::from_value(response.payload).map_err(ClientError::MalformedReply)
}
