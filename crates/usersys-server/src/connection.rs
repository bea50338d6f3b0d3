use std::net::{Shutdown, TcpStream};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use usersys_protocol::{
    DeadlineRead, DeadlineWrite, Message, Response, TransportError, deadline_after, read_frame,
    reason, write_frame,
};

use crate::dispatcher::Dispatcher;

/// Serve exactly one request on `stream`, then close it.
///
/// The whole exchange, reading the request and writing the reply, must fit
/// inside `timeout` measured from the moment this is called. Framing errors,
/// timeouts and I/O failures drop the connection without a reply. A frame
/// whose body is not an envelope is answered with a `malformed message`
/// error carrying type 0 and id 0.
pub fn handle_connection(
    mut stream: TcpStream,
    dispatcher: &Dispatcher,
    timeout: Duration,
) -> Result<(), TransportError> {
    let result =
        deadline_after(timeout).and_then(|deadline| exchange(&mut stream, dispatcher, deadline));
    let _ = stream.shutdown(Shutdown::Both);
    result
}

fn exchange<S: DeadlineRead + DeadlineWrite + ?Sized>(
    stream: &mut S,
    dispatcher: &Dispatcher,
    deadline: Instant,
) -> Result<(), TransportError> {
    let body = read_frame(stream, deadline)?;

    let response = match Message::from_body(&body) {
        Ok(message) => {
            debug!(kind = message.kind, id = message.id, "request received");
            dispatcher.dispatch(&message)
        }
        Err(e) => {
            warn!("Malformed envelope ({} bytes): {}", body.len(), e);
            Response::error(0, 0, reason::MALFORMED_MESSAGE)
        }
    };

    let frame = response.encode()?;
    write_frame(stream, &frame, deadline)
}
