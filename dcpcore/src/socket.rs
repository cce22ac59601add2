// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A timed, length-prefixed TCP socket wrapper (spec §4.1).
//!
//! Unlike the teacher's `Connection`, which buffers frames over an async
//! `TcpStream`, this crate runs one thread per connection (§5), so the
//! socket here is a thin blocking wrapper with a single rearmed deadline
//! applied to every read and write.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::TransportError;

/// A connected TCP stream with one deadline applied to every operation,
/// rearmed at the start of each call.
#[derive(Debug)]
pub struct Socket {
    stream: TcpStream,
    deadline: Duration,
}

impl Socket {
    /// Connects to `addr`, failing with [`TransportError::ConnectTimeout`] or
    /// [`TransportError::ConnectRefused`] if it cannot within `timeout`.
    ///
    /// # Errors
    /// * The address cannot be resolved.
    /// * The connection attempt times out or is refused.
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self, TransportError> {
        let addr = addr
            .to_socket_addrs()
            .map_err(TransportError::Io)?
            .next()
            .ok_or(TransportError::ConnectRefused)?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                TransportError::ConnectTimeout(timeout)
            } else if e.kind() == std::io::ErrorKind::ConnectionRefused {
                TransportError::ConnectRefused
            } else {
                TransportError::Io(e)
            }
        })?;
        Ok(Self::from_stream(stream, timeout))
    }

    /// Wraps an already-connected stream (e.g. one returned by
    /// `TcpListener::accept`), applying `deadline` to every operation.
    #[must_use]
    pub fn from_stream(stream: TcpStream, deadline: Duration) -> Self {
        Self { stream, deadline }
    }

    fn rearm(&self) -> Result<(), TransportError> {
        self.stream
            .set_read_timeout(Some(self.deadline))
            .map_err(TransportError::Io)?;
        self.stream
            .set_write_timeout(Some(self.deadline))
            .map_err(TransportError::Io)
    }

    /// Writes all of `bytes`, blocking until complete or the deadline fires.
    ///
    /// # Errors
    /// * The deadline elapses before every byte is written.
    /// * The peer closes the connection mid-write.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.rearm()?;
        let started = Instant::now();
        self.stream.write_all(bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                TransportError::WriteTimeout
            } else {
                TransportError::Io(e)
            }
        })?;
        trace!(bytes = bytes.len(), elapsed = ?started.elapsed(), "wrote socket bytes");
        Ok(())
    }

    /// Reads exactly `exact_len` bytes, blocking until complete or the
    /// deadline fires.
    ///
    /// # Errors
    /// * The deadline elapses before every byte arrives.
    /// * The peer closes the connection before `exact_len` bytes arrive.
    pub fn read(&mut self, exact_len: usize) -> Result<Vec<u8>, TransportError> {
        self.rearm()?;
        let mut buf = vec![0u8; exact_len];
        self.stream.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::ReadTimeout
            }
            std::io::ErrorKind::UnexpectedEof => TransportError::PeerClosed,
            _ => TransportError::Io(e),
        })?;
        Ok(buf)
    }

    /// Writes `v` as four big-endian bytes.
    ///
    /// # Errors
    /// * See [`Socket::write`].
    pub fn write_u32(&mut self, v: u32) -> Result<(), TransportError> {
        self.write(&v.to_be_bytes())
    }

    /// Reads four big-endian bytes and returns them as a `u32`.
    ///
    /// # Errors
    /// * See [`Socket::read`].
    pub fn read_u32(&mut self) -> Result<u32, TransportError> {
        let bytes = self.read(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("read(4) returns 4 bytes")))
    }

    /// Writes a length-prefixed message: a big-endian `u32` length followed
    /// by `body`.
    ///
    /// # Errors
    /// * See [`Socket::write`].
    pub fn write_frame(&mut self, body: &[u8]) -> Result<(), TransportError> {
        self.write_u32(body.len() as u32)?;
        self.write(body)
    }

    /// Reads a length-prefixed message: a big-endian `u32` length followed by
    /// that many bytes.
    ///
    /// # Errors
    /// * See [`Socket::read`].
    pub fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let len = self.read_u32()? as usize;
        self.read(len)
    }

    /// Interrupts any in-flight operation on this socket by shutting down
    /// both directions, used when a terminate flag is observed (spec §5).
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Splits into read/write independent halves sharing the same
    /// underlying stream, for use from a dedicated reader/writer pair of
    /// threads.
    ///
    /// # Errors
    /// * The underlying stream cannot be cloned.
    pub fn try_clone(&self) -> Result<Self, TransportError> {
        Ok(Self {
            stream: self.stream.try_clone().map_err(TransportError::Io)?,
            deadline: self.deadline,
        })
    }
}

/// Appends a trailing NUL to `text`, the convention for text messages inside
/// a length-prefixed frame (spec §4.1).
#[must_use]
pub fn nul_terminate(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// Strips a single trailing NUL, if present, and interprets the rest as
/// UTF-8.
///
/// # Errors
/// * The bytes before the terminator are not valid UTF-8.
pub fn read_nul_terminated(bytes: &[u8]) -> Result<String, TransportError> {
    let trimmed = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    String::from_utf8(trimmed.to_vec())
        .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use super::{Socket, nul_terminate, read_nul_terminated};

    #[test]
    fn nul_termination_round_trips() {
        let framed = nul_terminate("encode 1 1920 1080");
        assert_eq!(*framed.last().unwrap(), 0);
        assert_eq!(read_nul_terminated(&framed).unwrap(), "encode 1 1920 1080");
    }

    #[test]
    fn write_frame_then_read_frame_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = Socket::from_stream(stream, Duration::from_secs(5));
            let frame = socket.read_frame().unwrap();
            socket.write_frame(&frame).unwrap();
        });

        let mut client = Socket::connect(addr, Duration::from_secs(5)).unwrap();
        client.write_frame(b"hello").unwrap();
        let echoed = client.read_frame().unwrap();
        assert_eq!(echoed, b"hello");

        server.join().unwrap();
    }

    #[test]
    fn read_past_peer_close_is_peer_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
        });

        let mut client = Socket::connect(addr, Duration::from_secs(5)).unwrap();
        server.join().unwrap();
        let result = client.read(4);
        assert!(result.is_err());
    }

    #[test]
    fn connect_refused_on_closed_port() {
        // Port 1 is a well-known reserved port unlikely to accept connections.
        let result = Socket::connect("127.0.0.1:1", Duration::from_millis(200));
        assert!(result.is_err());
    }
}
