//! Length-prefixed framing.
//!
//! ```text
//! [0..4]  Body length (u32 BE)
//! [4..]   Body (JSON envelope)
//! ```
//!
//! The reader always knows how many bytes to buffer before parsing, so a
//! body that arrives in several TCP segments is reassembled here and never
//! reaches the JSON layer half-finished.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::error::{FramingError, TransportError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Maximum body size (16 MB). Envelopes are tiny; anything near this is junk.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A byte source whose blocking reads can be bounded.
pub trait DeadlineRead: Read {
    /// Bound the next blocking read to at most `limit`.
    fn limit_next_read(&mut self, limit: Duration) -> io::Result<()>;
}

/// A byte sink whose blocking writes can be bounded.
pub trait DeadlineWrite: Write {
    /// Bound the next blocking write to at most `limit`.
    fn limit_next_write(&mut self, limit: Duration) -> io::Result<()>;
}

impl DeadlineRead for TcpStream {
    fn limit_next_read(&mut self, limit: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(limit))
    }
}

impl DeadlineWrite for TcpStream {
    fn limit_next_write(&mut self, limit: Duration) -> io::Result<()> {
        self.set_write_timeout(Some(limit))
    }
}

impl<T: AsRef<[u8]>> DeadlineRead for io::Cursor<T> {
    fn limit_next_read(&mut self, _limit: Duration) -> io::Result<()> {
        Ok(())
    }
}

impl DeadlineWrite for Vec<u8> {
    fn limit_next_write(&mut self, _limit: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// The absolute deadline `timeout` from now.
pub fn deadline_after(timeout: Duration) -> Result<Instant, TransportError> {
    Instant::now()
        .checked_add(timeout)
        .ok_or(TransportError::TimeoutOutOfRange(timeout))
}

/// Prefix `body` with its length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FramingError> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(FramingError::TooLarge {
            declared: body.len(),
        });
    }

    let mut buf = Vec::with_capacity(LENGTH_PREFIX + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Borrow the body of the first frame in `buf`. Trailing bytes are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<&[u8], FramingError> {
    if buf.len() < LENGTH_PREFIX {
        return Err(FramingError::ShortPrefix {
            available: buf.len(),
        });
    }

    let declared = declared_len(&buf[..LENGTH_PREFIX])?;
    let available = buf.len() - LENGTH_PREFIX;
    if available < declared {
        return Err(FramingError::ShortBody {
            declared,
            available,
        });
    }

    Ok(&buf[LENGTH_PREFIX..LENGTH_PREFIX + declared])
}

/// Read one frame body from `reader`, giving up at `deadline`.
///
/// The deadline is absolute: a peer trickling one byte at a time cannot keep
/// the read alive past it.
pub fn read_frame<R: DeadlineRead + ?Sized>(
    reader: &mut R,
    deadline: Instant,
) -> Result<Vec<u8>, TransportError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    let got = fill(reader, &mut prefix, deadline)?;
    if got < LENGTH_PREFIX {
        return Err(FramingError::ShortPrefix { available: got }.into());
    }

    let declared = declared_len(&prefix)?;
    let mut body = vec![0u8; declared];
    let got = fill(reader, &mut body, deadline)?;
    if got < declared {
        return Err(FramingError::ShortBody {
            declared,
            available: got,
        }
        .into());
    }

    Ok(body)
}

/// Write a complete, already framed buffer, giving up at `deadline`.
pub fn write_frame<W: DeadlineWrite + ?Sized>(
    writer: &mut W,
    frame: &[u8],
    deadline: Instant,
) -> Result<(), TransportError> {
    let mut written = 0;
    while written < frame.len() {
        writer
            .limit_next_write(remaining(deadline)?)
            .map_err(TransportError::Write)?;
        match writer.write(&frame[written..]) {
            Ok(0) => {
                return Err(TransportError::Write(io::Error::from(
                    io::ErrorKind::WriteZero,
                )));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) => return Err(TransportError::TimedOut),
            Err(e) => return Err(TransportError::Write(e)),
        }
    }
    writer.flush().map_err(TransportError::Write)
}

fn declared_len(prefix: &[u8]) -> Result<usize, FramingError> {
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(FramingError::TooLarge { declared });
    }
    Ok(declared)
}

/// Read until `buf` is full or the peer closes. Returns bytes filled.
fn fill<R: DeadlineRead + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<usize, TransportError> {
    let mut filled = 0;
    while filled < buf.len() {
        reader
            .limit_next_read(remaining(deadline)?)
            .map_err(TransportError::Read)?;
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) => return Err(TransportError::TimedOut),
            Err(e) => return Err(TransportError::Read(e)),
        }
    }
    Ok(filled)
}

fn remaining(deadline: Instant) -> Result<Duration, TransportError> {
    match deadline.checked_duration_since(Instant::now()) {
        Some(left) if !left.is_zero() => Ok(left),
        _ => Err(TransportError::TimedOut),
    }
}

// Socket timeouts surface as WouldBlock on Unix and TimedOut on Windows.
fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
