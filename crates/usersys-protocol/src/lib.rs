//! Usersys RPC protocol: the private wire format between the gateway and the
//! user service.
//!
//! One request per TCP connection:
//! - client writes one framed `Message`
//! - server writes one framed `Response`
//! - server closes the connection
//!
//! Frames are a 4-byte big-endian length followed by a JSON body.

pub mod envelope;
pub mod error;
pub mod frame;
pub mod request;

pub use envelope::{Message, MessageType, Response, Status, reason};
pub use error::{FramingError, PayloadError, ProtocolError, TransportError};
pub use frame::{
    DeadlineRead, DeadlineWrite, LENGTH_PREFIX, MAX_FRAME_SIZE, deadline_after, decode_frame,
    encode_frame, read_frame, write_frame,
};
pub use request::{
    LoginReply, LoginRequest, ProfileReply, Request, RequestError, TokenRequest,
    UpdateProfileRequest, UserProfile,
};
