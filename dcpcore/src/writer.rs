// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Orders completed frames by index and assembles the picture/audio
//! essence files plus the FrameInfo index (spec §4.7).

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;
use tracing::trace;

use crate::error::CoreError;
use crate::essence::{AUDIO_ESSENCE_KEY, EssenceFile, PICTURE_ESSENCE_KEY};
use crate::model::{Eye, FrameInfo, PcmBlock};

/// What the ordered map holds for one `(index, eye)` key, pending its turn
/// to be emitted.
enum PendingEntry {
    /// Freshly-encoded bytes, to be appended to the essence file.
    Bytes(Vec<u8>),
    /// A prior run's already-written bytes, read back for a fake-write.
    FakeBytes(Vec<u8>),
    /// Reuse the last fully-written frame's bytes.
    Repeat,
}

impl PendingEntry {
    const TAG_BYTES: u8 = 0;
    const TAG_FAKE_BYTES: u8 = 1;
    const TAG_REPEAT: u8 = 2;

    fn tag(&self) -> u8 {
        match self {
            Self::Bytes(_) => Self::TAG_BYTES,
            Self::FakeBytes(_) => Self::TAG_FAKE_BYTES,
            Self::Repeat => Self::TAG_REPEAT,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) | Self::FakeBytes(bytes) => bytes,
            Self::Repeat => &[],
        }
    }

    fn from_tag_and_payload(tag: u8, payload: Vec<u8>) -> Self {
        match tag {
            Self::TAG_FAKE_BYTES => Self::FakeBytes(payload),
            Self::TAG_REPEAT => Self::Repeat,
            _ => Self::Bytes(payload),
        }
    }
}

/// Where one spilled entry lives in the spill file: a byte offset plus
/// record length (tag + length prefix + payload).
#[derive(Clone, Copy)]
struct SpillRecord {
    offset: u64,
    payload_len: u32,
}

/// Orders completed frames into the picture essence, interleaves audio, and
/// maintains the FrameInfo index. Internally synchronized: every public
/// method takes `&self`, matching the "coordinator posts completions from
/// many worker threads" usage pattern (spec §5).
pub struct Writer {
    state: Mutex<WriterState>,
}

struct WriterState {
    picture: EssenceFile,
    audio: EssenceFile,
    frame_info_path: PathBuf,
    pending: BTreeMap<(u32, Eye), PendingEntry>,
    cursor: (u32, Eye),
    stereoscopic: bool,
    cap: usize,
    spill: Option<NamedTempFile>,
    spill_index: BTreeMap<(u32, Eye), SpillRecord>,
    spill_cursor: u64,
    last_written: Option<Vec<u8>>,
    frame_info: Vec<(u32, Eye, FrameInfo)>,
    audio_frames_written: u64,
    first_error: Option<CoreError>,
}

impl Writer {
    /// Opens new essence files at `picture_path`/`audio_path`, starting the
    /// ordering cursor at `(0, MONO)` for a flat film or `(0, LEFT)` for a
    /// stereoscopic one.
    ///
    /// `reorder_cap` bounds the in-memory pending map before entries spill
    /// to a temporary file (default per spec §4.7 is `8 * local_threads`).
    ///
    /// # Errors
    /// * Either essence file cannot be created.
    pub fn create(
        picture_path: &Path,
        audio_path: &Path,
        frame_info_path: &Path,
        stereoscopic: bool,
        reorder_cap: usize,
    ) -> Result<Self, CoreError> {
        let picture = EssenceFile::create(picture_path, PICTURE_ESSENCE_KEY)?;
        let audio = EssenceFile::create(audio_path, AUDIO_ESSENCE_KEY)?;
        let cursor = (0, if stereoscopic { Eye::Left } else { Eye::Mono });
        Ok(Self {
            state: Mutex::new(WriterState {
                picture,
                audio,
                frame_info_path: frame_info_path.to_path_buf(),
                pending: BTreeMap::new(),
                cursor,
                stereoscopic,
                cap: reorder_cap.max(1),
                spill: None,
                spill_index: BTreeMap::new(),
                spill_cursor: 0,
                last_written: None,
                frame_info: Vec::new(),
                audio_frames_written: 0,
                first_error: None,
            }),
        })
    }

    /// Accepts a completed frame at any index, buffering it until the
    /// cursor reaches its key (spec §4.7).
    pub fn write_video(&self, index: u32, eye: Eye, data: Vec<u8>) {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        state.pending.insert((index, eye), PendingEntry::Bytes(data));
        state.drain();
        state.spill_if_needed();
    }

    /// Reads the FrameInfo for `(index, eye)` from `cache` and re-emits
    /// identical essence bytes into the new file (spec §4.7, §4.8).
    ///
    /// # Errors
    /// * The referenced bytes cannot be read back from `source_essence_path`.
    pub fn fake_write(
        &self,
        index: u32,
        eye: Eye,
        source_essence_path: &Path,
        info: FrameInfo,
    ) -> Result<(), CoreError> {
        let bytes = EssenceFile::read_payload_at(source_essence_path, info.offset(), info.size())?;
        let mut state = self.state.lock().expect("writer mutex poisoned");
        state
            .pending
            .insert((index, eye), PendingEntry::FakeBytes(bytes));
        state.drain();
        state.spill_if_needed();
        Ok(())
    }

    /// Re-emits the last fully-written frame's bytes at `(index, eye)`
    /// (spec §4.7, §9).
    pub fn repeat(&self, index: u32, eye: Eye) {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        state.pending.insert((index, eye), PendingEntry::Repeat);
        state.drain();
        state.spill_if_needed();
    }

    /// Appends `block` to the audio essence segment (spec §4.7).
    pub fn write_audio(&self, block: &PcmBlock) {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        if let Err(err) = state.audio.append(block.samples()) {
            state.record_error(err);
            return;
        }
        state.audio_frames_written += block.frame_count() as u64;
    }

    /// Flushes remaining buffered entries, closes the essence files, and
    /// writes the FrameInfo file.
    ///
    /// # Errors
    /// * Returns the first write error encountered during the writer's
    ///   lifetime, if any.
    pub fn finish(self) -> Result<(), CoreError> {
        let mut state = self.state.into_inner().expect("writer mutex poisoned");
        state.picture.flush()?;
        state.audio.flush()?;

        let mut frame_info_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&state.frame_info_path)
            .map_err(CoreError::WriteIo)?;
        for (index, eye, info) in &state.frame_info {
            let position = FrameInfo::record_position(*index, *eye);
            frame_info_file
                .seek(SeekFrom::Start(position))
                .map_err(CoreError::WriteIo)?;
            frame_info_file
                .write_all(&info.to_bytes())
                .map_err(CoreError::WriteIo)?;
        }
        frame_info_file.flush().map_err(CoreError::WriteIo)?;

        if let Some(err) = state.first_error.take() {
            return Err(err);
        }
        Ok(())
    }

    /// In-memory snapshot of FrameInfo records written so far, keyed by
    /// `(index, eye)`; exposed for tests and for the coordinator's
    /// progress reporting.
    #[must_use]
    pub fn frame_info_snapshot(&self) -> Vec<(u32, Eye, FrameInfo)> {
        self.state
            .lock()
            .expect("writer mutex poisoned")
            .frame_info
            .clone()
    }

    /// Running count of audio frames appended so far.
    #[must_use]
    pub fn audio_frames_written(&self) -> u64 {
        self.state
            .lock()
            .expect("writer mutex poisoned")
            .audio_frames_written
    }
}

impl WriterState {
    fn record_error(&mut self, err: CoreError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }

    fn next_cursor(&self) -> (u32, Eye) {
        let (index, eye) = self.cursor;
        match eye {
            Eye::Mono => (index + 1, Eye::Mono),
            Eye::Left => (index, Eye::Right),
            Eye::Right => (index + 1, Eye::Left),
        }
    }

    fn drain(&mut self) {
        loop {
            let cursor = self.cursor;
            let entry = match self.pending.remove(&cursor) {
                Some(entry) => entry,
                None => match self.reload_spilled(cursor) {
                    Some(entry) => entry,
                    None => break,
                },
            };
            let (index, eye) = self.cursor;
            let bytes = match entry {
                PendingEntry::Bytes(bytes) | PendingEntry::FakeBytes(bytes) => bytes,
                PendingEntry::Repeat => self.last_written.clone().unwrap_or_default(),
            };

            let result = self.picture.append(&bytes);
            match result {
                Ok((offset, size)) => {
                    let hash = crate::hash::content_hash(&bytes);
                    let info = FrameInfo::new(offset, size, hash);
                    self.frame_info.push((index, eye, info));
                    self.last_written = Some(bytes);
                    trace!(index, ?eye, offset, size, "wrote frame to essence");
                }
                Err(err) => {
                    self.record_error(err);
                    break;
                }
            }

            self.cursor = self.next_cursor();
        }
    }

    /// Spills the tail entries (furthest from the cursor) to a temporary
    /// file so the producer can race ahead of the writer without exhausting
    /// RAM (spec §4.7). Each spilled entry is indexed by `(index, eye)` in
    /// `spill_index` so `reload_spilled` can bring it back once the cursor
    /// reaches it.
    fn spill_if_needed(&mut self) {
        if self.pending.len() <= self.cap {
            return;
        }
        if self.spill.is_none() {
            self.spill = NamedTempFile::new().ok();
        }
        let Some(spill) = self.spill.as_mut() else {
            return;
        };
        while self.pending.len() > self.cap {
            let Some((&key, _)) = self.pending.iter().next_back() else {
                break;
            };
            let Some(entry) = self.pending.remove(&key) else {
                break;
            };
            let tag = entry.tag();
            let payload = entry.payload();
            let record = [&[tag][..], &(payload.len() as u32).to_be_bytes()[..]].concat();
            if spill.write_all(&record).is_err() || spill.write_all(payload).is_err() {
                break;
            }
            self.spill_index.insert(
                key,
                SpillRecord {
                    offset: self.spill_cursor,
                    payload_len: payload.len() as u32,
                },
            );
            self.spill_cursor += record.len() as u64 + payload.len() as u64;
        }
    }

    /// Reads a previously-spilled entry for `key` back into memory, if one
    /// was spilled (spec §4.7: the writer "reloads them when the cursor
    /// reaches them").
    fn reload_spilled(&mut self, key: (u32, Eye)) -> Option<PendingEntry> {
        let record = self.spill_index.remove(&key)?;
        let spill = self.spill.as_ref()?;
        let mut file = File::open(spill.path()).ok()?;
        file.seek(SeekFrom::Start(record.offset)).ok()?;
        let mut header = [0u8; 5];
        file.read_exact(&mut header).ok()?;
        let tag = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        debug_assert_eq!(len, record.payload_len);
        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload).ok()?;
        Some(PendingEntry::from_tag_and_payload(tag, payload))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::Writer;
    use crate::model::Eye;

    #[test]
    fn out_of_order_completions_land_in_index_order() {
        let dir = tempdir().unwrap();
        let writer = Writer::create(
            &dir.path().join("picture.mxf"),
            &dir.path().join("audio.mxf"),
            &dir.path().join("frame_info"),
            false,
            8,
        )
        .unwrap();

        writer.write_video(2, Eye::Mono, b"frame-2".to_vec());
        writer.write_video(0, Eye::Mono, b"frame-0".to_vec());
        writer.write_video(1, Eye::Mono, b"frame-1".to_vec());

        let snapshot = writer.frame_info_snapshot();
        let indices: Vec<u32> = snapshot.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        writer.finish().unwrap();
    }

    #[test]
    fn stereoscopic_emits_left_before_right() {
        let dir = tempdir().unwrap();
        let writer = Writer::create(
            &dir.path().join("picture.mxf"),
            &dir.path().join("audio.mxf"),
            &dir.path().join("frame_info"),
            true,
            8,
        )
        .unwrap();

        writer.write_video(0, Eye::Right, b"right-0".to_vec());
        writer.write_video(0, Eye::Left, b"left-0".to_vec());

        let snapshot = writer.frame_info_snapshot();
        assert_eq!(snapshot[0].1, Eye::Left);
        assert_eq!(snapshot[1].1, Eye::Right);

        writer.finish().unwrap();
    }

    #[test]
    fn repeat_reuses_last_written_bytes() {
        let dir = tempdir().unwrap();
        let writer = Writer::create(
            &dir.path().join("picture.mxf"),
            &dir.path().join("audio.mxf"),
            &dir.path().join("frame_info"),
            false,
            8,
        )
        .unwrap();

        writer.write_video(0, Eye::Mono, b"abcd".to_vec());
        writer.repeat(1, Eye::Mono);

        let snapshot = writer.frame_info_snapshot();
        assert_eq!(snapshot[0].2.size(), snapshot[1].2.size());
        assert_eq!(snapshot[0].2.hash(), snapshot[1].2.hash());

        writer.finish().unwrap();
    }

    #[test]
    fn spilled_entries_reload_when_cursor_reaches_them() {
        let dir = tempdir().unwrap();
        let writer = Writer::create(
            &dir.path().join("picture.mxf"),
            &dir.path().join("audio.mxf"),
            &dir.path().join("frame_info"),
            false,
            2,
        )
        .unwrap();

        // Submit frames 1..=5 out of order before frame 0, forcing the tail
        // past the cap of 2 into the spill file.
        for index in (1..=5).rev() {
            writer.write_video(index, Eye::Mono, format!("frame-{index}").into_bytes());
        }
        writer.write_video(0, Eye::Mono, b"frame-0".to_vec());

        let snapshot = writer.frame_info_snapshot();
        let indices: Vec<u32> = snapshot.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);

        writer.finish().unwrap();
    }

    #[test]
    fn spilled_repeat_entry_reloads_as_repeat() {
        let dir = tempdir().unwrap();
        let writer = Writer::create(
            &dir.path().join("picture.mxf"),
            &dir.path().join("audio.mxf"),
            &dir.path().join("frame_info"),
            false,
            1,
        )
        .unwrap();

        writer.write_video(3, Eye::Mono, b"frame-3".to_vec());
        writer.repeat(2, Eye::Mono);
        writer.write_video(1, Eye::Mono, b"frame-1".to_vec());
        writer.write_video(0, Eye::Mono, b"frame-0".to_vec());

        let snapshot = writer.frame_info_snapshot();
        let indices: Vec<u32> = snapshot.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        // index 2 was a spilled Repeat entry: it must reload as a repeat of
        // the last frame written before the cursor reached it (index 1),
        // not as an empty frame.
        assert_eq!(snapshot[2].2.size(), snapshot[1].2.size());
        assert_eq!(snapshot[2].2.hash(), snapshot[1].2.hash());

        writer.finish().unwrap();
    }

    #[test]
    fn audio_frame_count_accumulates() {
        let dir = tempdir().unwrap();
        let writer = Writer::create(
            &dir.path().join("picture.mxf"),
            &dir.path().join("audio.mxf"),
            &dir.path().join("frame_info"),
            false,
            8,
        )
        .unwrap();

        let block = crate::model::PcmBlock::builder()
            .channels(2)
            .sample_rate(48_000)
            .samples(vec![0u8; 16])
            .build();
        writer.write_audio(&block);
        assert_eq!(writer.audio_frames_written(), 4);

        writer.finish().unwrap();
    }
}
