// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Detects already-encoded frames from a prior run's FrameInfo file, so the
//! coordinator can fake-write instead of re-encoding (spec §4.8).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::CoreError;
use crate::model::{Eye, FRAME_INFO_RECORD_LEN, FrameInfo};

/// A read-only view over a prior run's FrameInfo file.
pub struct FrameCache {
    file: File,
    /// Number of consecutive indices, starting at 0, that have valid
    /// records for every eye required (one for MONO, two for 3D).
    first_missing: u32,
}

impl FrameCache {
    /// Opens `path` and scans it to determine [`FrameCache::first_missing`].
    ///
    /// `stereoscopic` controls whether one or two records per index are
    /// required for a complete prefix.
    ///
    /// # Errors
    /// * `path` cannot be opened or read.
    pub fn open(path: &Path, stereoscopic: bool) -> Result<Self, CoreError> {
        let mut file = File::open(path).map_err(CoreError::WriteIo)?;
        let len = file.metadata().map_err(CoreError::WriteIo)?.len();
        let record_len = FRAME_INFO_RECORD_LEN as u64 * if stereoscopic { 2 } else { 1 };
        let complete_indices = if record_len == 0 { 0 } else { len / record_len };

        let mut first_missing = 0u32;
        let mut buf = [0u8; FRAME_INFO_RECORD_LEN];
        for index in 0..complete_indices {
            let ok = if stereoscopic {
                read_record_at(&mut file, &mut buf, index * 2 * FRAME_INFO_RECORD_LEN as u64).is_ok()
                    && read_record_at(
                        &mut file,
                        &mut buf,
                        index * 2 * FRAME_INFO_RECORD_LEN as u64 + FRAME_INFO_RECORD_LEN as u64,
                    )
                    .is_ok()
            } else {
                read_record_at(&mut file, &mut buf, index * FRAME_INFO_RECORD_LEN as u64).is_ok()
            };
            if !ok {
                break;
            }
            first_missing = u32::try_from(index + 1).unwrap_or(u32::MAX);
        }

        Ok(Self {
            file,
            first_missing,
        })
    }

    /// The smallest index not fully covered by valid records; the
    /// coordinator may only fake-write indices below this.
    #[must_use]
    pub fn first_missing(&self) -> u32 {
        self.first_missing
    }

    /// Looks up the `FrameInfo` for `(index, eye)`, if present and within
    /// the valid prefix.
    ///
    /// # Errors
    /// * The record position cannot be seeked to or read.
    pub fn lookup(&mut self, index: u32, eye: Eye) -> Result<Option<FrameInfo>, CoreError> {
        if index >= self.first_missing {
            return Ok(None);
        }
        let position = FrameInfo::record_position(index, eye);
        let mut buf = [0u8; FRAME_INFO_RECORD_LEN];
        match read_record_at(&mut self.file, &mut buf, position) {
            Ok(()) => Ok(Some(FrameInfo::from_bytes(&buf)?)),
            Err(_) => Ok(None),
        }
    }
}

fn read_record_at(
    file: &mut File,
    buf: &mut [u8; FRAME_INFO_RECORD_LEN],
    position: u64,
) -> Result<(), CoreError> {
    file.seek(SeekFrom::Start(position)).map_err(CoreError::WriteIo)?;
    file.read_exact(buf).map_err(CoreError::WriteIo)?;
    FrameInfo::from_bytes(buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::FrameCache;
    use crate::model::{Eye, FrameInfo};

    fn write_mono_cache(records: &[FrameInfo]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for record in records {
            file.write_all(&record.to_bytes()).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn mono_cache_reports_first_missing_as_full_length() {
        let records = vec![
            FrameInfo::new(0, 100, [1u8; 16]),
            FrameInfo::new(100, 100, [2u8; 16]),
            FrameInfo::new(200, 100, [3u8; 16]),
        ];
        let file = write_mono_cache(&records);
        let cache = FrameCache::open(file.path(), false).unwrap();
        assert_eq!(cache.first_missing(), 3);
    }

    #[test]
    fn lookup_returns_matching_record() {
        let records = vec![
            FrameInfo::new(0, 100, [1u8; 16]),
            FrameInfo::new(100, 50, [2u8; 16]),
        ];
        let file = write_mono_cache(&records);
        let mut cache = FrameCache::open(file.path(), false).unwrap();
        let found = cache.lookup(1, Eye::Mono).unwrap().unwrap();
        assert_eq!(found, records[1]);
    }

    #[test]
    fn lookup_beyond_first_missing_is_none() {
        let records = vec![FrameInfo::new(0, 100, [1u8; 16])];
        let file = write_mono_cache(&records);
        let mut cache = FrameCache::open(file.path(), false).unwrap();
        assert!(cache.lookup(5, Eye::Mono).unwrap().is_none());
    }

    #[test]
    fn stereoscopic_cache_requires_both_eyes_per_index() {
        let mut file = NamedTempFile::new().unwrap();
        // Only LEFT for index 0; RIGHT missing, so first_missing stays 0.
        file.write_all(&FrameInfo::new(0, 100, [1u8; 16]).to_bytes())
            .unwrap();
        file.flush().unwrap();
        let cache = FrameCache::open(file.path(), true).unwrap();
        assert_eq!(cache.first_missing(), 0);
    }
}
