// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::io;

use clap::error::ErrorKind;
use thiserror::Error;

/// The closed set of errors that can occur anywhere in the encoding pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A socket operation did not complete before its deadline, or the peer
    /// went away mid-exchange.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A peer sent a message that did not parse, or negotiated an
    /// incompatible protocol version.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The local JPEG2000 encoder failed on this attempt.
    #[error("local encode failed: {0}")]
    LocalEncodeFailed(String),
    /// A remote server reported an encode failure for this frame.
    #[error("remote encode failed: {0}")]
    RemoteEncodeFailed(String),
    /// Writing essence or frame-info bytes to disk failed. Fatal to the job.
    #[error("write I/O error: {0}")]
    WriteIo(#[from] io::Error),
    /// The frame cache has a record for this index but its hash disagrees
    /// with the freshly-prepared frame.
    #[error("frame cache mismatch at index {index}")]
    FrameCacheMismatch {
        /// DCP frame index whose cached hash disagreed.
        index: u32,
    },
    /// A job's terminate flag was observed; the caller should treat this as
    /// a clean, non-fatal shutdown rather than an error to report.
    #[error("cancelled")]
    Cancelled,
    /// The data model's own invariants were violated (e.g. mismatched plane
    /// count/stride/length in `PixelPlanes`).
    #[error("invalid pixel planes: {0}")]
    InvalidPixelPlanes(String),
    /// A `FrameInfo` record on disk did not parse as 48 well-formed bytes.
    #[error("invalid frame-info record: {0}")]
    InvalidFrameInfo(String),
    /// The configuration failed to load or deserialize.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Errors specific to the socket/transport layer (§4.1, §7's `TransportError`).
#[derive(Debug, Error)]
pub enum TransportError {
    /// `connect()` did not complete before its deadline.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
    /// The peer actively refused the connection.
    #[error("connection refused")]
    ConnectRefused,
    /// A `write()` did not complete before the deadline.
    #[error("write timed out")]
    WriteTimeout,
    /// A `read()` did not complete before the deadline.
    #[error("read timed out")]
    ReadTimeout,
    /// The peer closed the connection before the expected bytes arrived.
    #[error("peer closed connection")]
    PeerClosed,
    /// Any other I/O failure on the underlying socket.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Converts a top-level `anyhow::Error` into a process exit code, matching
/// the CLI contract in spec §6 (0 on success, non-zero on any job error).
#[allow(clippy::needless_pass_by_value)]
#[must_use]
pub fn clap_or_error(err: anyhow::Error) -> i32 {
    let disp_err = || {
        eprintln!("{err:?}");
        1
    };
    match err.downcast_ref::<clap::Error>() {
        Some(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                println!("{e}");
                0
            }
            _ => disp_err(),
        },
        None => disp_err(),
    }
}

/// Indicates successful execution of a job-running function, exit code 0.
#[must_use]
pub fn success((): ()) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::{CoreError, TransportError, clap_or_error, success};

    #[test]
    fn success_is_zero() {
        assert_eq!(success(()), 0);
    }

    #[test]
    fn clap_or_error_reports_failure() {
        assert_eq!(1, clap_or_error(anyhow::anyhow!("boom")));
    }

    #[test]
    fn clap_or_error_display_help_is_clean_exit() {
        let mut cmd = clap::Command::new("dcpcore");
        let clap_err = cmd.error(clap::error::ErrorKind::DisplayHelp, "help");
        assert_eq!(0, clap_or_error(anyhow::Error::new(clap_err)));
    }

    #[test]
    fn transport_error_wraps_into_core_error() {
        let err: CoreError = TransportError::ConnectRefused.into();
        assert_eq!(err.to_string(), "transport error: connection refused");
    }

    #[test]
    fn frame_cache_mismatch_reports_index() {
        let err = CoreError::FrameCacheMismatch { index: 42 };
        assert_eq!(err.to_string(), "frame cache mismatch at index 42");
    }
}
