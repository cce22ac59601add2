// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Wire-protocol client: connect to a remote encoding server, send one raw
//! frame, receive back its JPEG2000 codestream (spec §4.3).

use std::time::Duration;

use tracing::debug;

use crate::error::CoreError;
use crate::hash::content_hash;
use crate::model::{EncodedFrame, PreparedFrame, ServerDescription};
use crate::socket::{Socket, nul_terminate};
use crate::wire::{EncodeRequest, as_error_reply, as_protocol_error_reply, colour_conversion_to_json};

/// Connection deadline for every socket operation in the remote path (spec
/// §4.3, §5).
pub const REMOTE_DEADLINE: Duration = Duration::from_secs(20);

/// Exchanges one frame with `server` over a fresh connection.
///
/// # Errors
/// * Returns [`CoreError::Transport`] on any socket failure or deadline.
/// * Returns [`CoreError::RemoteEncodeFailed`] if the server reports an
///   `ERROR` reply.
/// * Returns [`CoreError::Protocol`] if the server reports a protocol version
///   mismatch; the caller should mark `server` unusable rather than retry.
pub fn encode_remote(
    index: u32,
    frame: &PreparedFrame,
    server: &ServerDescription,
    protocol_version: u32,
    j2k_bandwidth: u64,
    fps: u32,
) -> Result<EncodedFrame, CoreError> {
    frame.planes().validate()?;

    let addr = format!("{}:{}", server.host(), server.port());
    let mut socket = Socket::connect(addr, REMOTE_DEADLINE).map_err(CoreError::Transport)?;

    let request = EncodeRequest {
        version: protocol_version,
        width: frame.planes().width(),
        height: frame.planes().height(),
        pixel_format: *frame.planes().format(),
        out_width: frame.planes().width(),
        out_height: frame.planes().height(),
        eye: frame.eye(),
        index,
        fps,
        colour_conversion_json: colour_conversion_to_json(frame.colour_conversion()),
        j2k_bandwidth,
        resolution: frame.resolution(),
    };
    let metadata = nul_terminate(&request.to_metadata_line());
    socket.write_frame(&metadata).map_err(CoreError::Transport)?;

    for plane_index in 0..frame.planes().plane_count() {
        socket
            .write(frame.planes().plane(plane_index))
            .map_err(CoreError::Transport)?;
    }

    let reply = socket.read_frame().map_err(CoreError::Transport)?;

    if let Some(message) = as_protocol_error_reply(&reply) {
        return Err(CoreError::Protocol(message));
    }
    if let Some(message) = as_error_reply(&reply) {
        return Err(CoreError::RemoteEncodeFailed(message));
    }

    debug!(server = server.host(), index, bytes = reply.len(), "remote encode completed");

    let hash = content_hash(&reply);
    Ok(EncodedFrame::builder()
        .index(index)
        .eye(frame.eye())
        .data(reply)
        .hash(hash)
        .build())
}

/// Per-server exponential backoff schedule (spec §4.3): starts at 10s,
/// increases additively by 10s per consecutive failure, capped at 60s.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    consecutive_failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }
}

impl Backoff {
    /// The duration a worker bound to this server should sleep before its
    /// next attempt.
    #[must_use]
    pub fn duration(self) -> Duration {
        let seconds = 10u64.saturating_mul(u64::from(self.consecutive_failures) + 1).min(60);
        Duration::from_secs(seconds)
    }

    /// Records a failed attempt, lengthening the backoff.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Records a successful attempt, resetting the backoff.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    use super::{Backoff, encode_remote};
    use crate::model::{Eye, PixelFormat, PixelPlanes, PreparedFrame, Resolution, ServerDescription};
    use crate::socket::Socket;
    use crate::wire::{EncodeRequest, error_reply, protocol_error_reply};

    fn sample_frame() -> PreparedFrame {
        let planes = PixelPlanes::builder()
            .format(PixelFormat::Rgb24)
            .width(2)
            .height(2)
            .strides(vec![6])
            .planes(vec![vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]])
            .build();
        PreparedFrame::builder()
            .planes(planes)
            .eye(Eye::Mono)
            .resolution(Resolution::TwoK)
            .build()
    }

    #[test]
    fn backoff_schedule_matches_spec() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.duration(), Duration::from_secs(10));
        backoff.record_failure();
        assert_eq!(backoff.duration(), Duration::from_secs(20));
        for _ in 0..10 {
            backoff.record_failure();
        }
        assert_eq!(backoff.duration(), Duration::from_secs(60));
        backoff.record_success();
        assert_eq!(backoff.duration(), Duration::from_secs(10));
    }

    #[test]
    fn encode_remote_round_trips_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = Socket::from_stream(stream, Duration::from_secs(5));
            let metadata_bytes = socket.read_frame().unwrap();
            let metadata = String::from_utf8(
                metadata_bytes.strip_suffix(&[0]).unwrap().to_vec(),
            )
            .unwrap();
            let request = EncodeRequest::from_metadata_line(&metadata).unwrap();
            let plane_len = request.width as usize * request.height as usize * 3;
            let _plane = socket.read(plane_len).unwrap();
            socket.write_frame(b"\xFF\x4F\xFF\xD9").unwrap();
        });

        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port)
            .thread_count(1)
            .build();
        let frame = sample_frame();
        let encoded = encode_remote(3, &frame, &description, 1, 250_000_000, 24).unwrap();
        assert_eq!(encoded.index(), 3);
        assert_eq!(encoded.data(), b"\xFF\x4F\xFF\xD9");

        server.join().unwrap();
    }

    #[test]
    fn encode_remote_surfaces_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = Socket::from_stream(stream, Duration::from_secs(5));
            let _metadata = socket.read_frame().unwrap();
            let _plane = socket.read(12).unwrap();
            socket.write_frame(&error_reply("out of memory")).unwrap();
        });

        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port)
            .thread_count(1)
            .build();
        let frame = sample_frame();
        let result = encode_remote(0, &frame, &description, 1, 250_000_000, 24);
        assert!(matches!(result, Err(crate::error::CoreError::RemoteEncodeFailed(_))));

        server.join().unwrap();
    }

    #[test]
    fn encode_remote_surfaces_protocol_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = Socket::from_stream(stream, Duration::from_secs(5));
            let _metadata = socket.read_frame().unwrap();
            let _plane = socket.read(12).unwrap();
            socket
                .write_frame(&protocol_error_reply("server speaks version 1, client sent 2"))
                .unwrap();
        });

        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(port)
            .thread_count(1)
            .build();
        let frame = sample_frame();
        let result = encode_remote(0, &frame, &description, 2, 250_000_000, 24);
        assert!(matches!(result, Err(crate::error::CoreError::Protocol(_))));

        server.join().unwrap();
    }

    #[test]
    fn encode_remote_fails_when_nothing_listens() {
        let description = ServerDescription::builder()
            .host("127.0.0.1".to_string())
            .port(1)
            .thread_count(1)
            .build();
        let frame = sample_frame();
        let result = encode_remote(0, &frame, &description, 1, 250_000_000, 24);
        assert!(result.is_err());
    }
}
