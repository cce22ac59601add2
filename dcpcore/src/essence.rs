// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A simplified MXF OP-Atom essence wrapper (spec §6).
//!
//! Real OP-Atom wrapping carries a full partition/header/index/footer
//! structure defined by SMPTE 429-3 and 336 (KLV). Reproducing that exactly
//! is out of reach here without a full MXF toolkit; this module instead
//! appends each essence unit as a single KLV packet — a 16-byte
//! essence-type key, a 4-byte big-endian BER-style length, and the payload —
//! which is enough to keep the documented invariant that `FrameInfo`
//! records describe byte ranges that parse back out cleanly, without
//! claiming SMPTE conformance.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::CoreError;

/// 16-byte key tagging a JPEG2000 picture essence KLV packet. Not a real
/// SMPTE 336 UL; chosen to be recognizable in a hex dump.
pub const PICTURE_ESSENCE_KEY: [u8; 16] = *b"DCPJ2KPICTURE!!\0";

/// 16-byte key tagging a PCM audio essence KLV packet.
pub const AUDIO_ESSENCE_KEY: [u8; 16] = *b"DCPPCMAUDIO!!!\0\0";

/// An append-only essence file: each unit is written as one KLV packet and
/// the writer tracks the running byte offset so callers can build
/// `FrameInfo` records without re-querying the filesystem.
pub struct EssenceFile {
    file: File,
    key: [u8; 16],
    offset: u64,
}

impl EssenceFile {
    /// Creates (or truncates) the essence file at `path`, tagging every
    /// packet written to it with `key`.
    ///
    /// # Errors
    /// * `path` cannot be created.
    pub fn create(path: &Path, key: [u8; 16]) -> Result<Self, CoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(CoreError::WriteIo)?;
        Ok(Self {
            file,
            key,
            offset: 0,
        })
    }

    /// Opens an existing essence file for append, continuing the offset
    /// counter from its current length.
    ///
    /// # Errors
    /// * `path` cannot be opened or its length queried.
    pub fn open_append(path: &Path, key: [u8; 16]) -> Result<Self, CoreError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(CoreError::WriteIo)?;
        let offset = file.metadata().map_err(CoreError::WriteIo)?.len();
        Ok(Self { file, key, offset })
    }

    /// Appends one KLV packet wrapping `payload`, returning the byte offset
    /// and size of the payload itself (not including the KLV header) so the
    /// caller can build a `FrameInfo` record that addresses exactly the
    /// payload bytes.
    ///
    /// # Errors
    /// * The underlying write fails.
    pub fn append(&mut self, payload: &[u8]) -> Result<(u64, u64), CoreError> {
        self.file.write_all(&self.key).map_err(CoreError::WriteIo)?;
        let len = payload.len() as u32;
        self.file
            .write_all(&len.to_be_bytes())
            .map_err(CoreError::WriteIo)?;
        let payload_offset = self.offset + 16 + 4;
        self.file.write_all(payload).map_err(CoreError::WriteIo)?;
        self.offset = payload_offset + payload.len() as u64;
        Ok((payload_offset, payload.len() as u64))
    }

    /// Flushes any buffered writes to disk.
    ///
    /// # Errors
    /// * The underlying flush fails.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        self.file.flush().map_err(CoreError::WriteIo)
    }

    /// Reads back the payload bytes at `[offset, offset + size)`, for
    /// fake-write and the testable invariant that a `FrameInfo` entry
    /// addresses a parseable codestream.
    ///
    /// # Errors
    /// * The read fails or runs past the end of the file.
    pub fn read_payload_at(path: &Path, offset: u64, size: u64) -> Result<Vec<u8>, CoreError> {
        let mut file = File::open(path).map_err(CoreError::WriteIo)?;
        file.seek(SeekFrom::Start(offset)).map_err(CoreError::WriteIo)?;
        let mut buf = vec![0u8; size as usize];
        std::io::Read::read_exact(&mut file, &mut buf).map_err(CoreError::WriteIo)?;
        Ok(buf)
    }
}
