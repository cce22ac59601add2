// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The minimal "collaborator" this CLI plays: it does not decode, scale, or
//! colour-convert anything. It reads already-prepared pixel planes straight
//! off disk and hands them to the coordinator, exactly as the pipeline's
//! upstream caller is expected to.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use dcpcore::{Eye, PixelFormat, PixelPlanes};

/// The fixed shape every frame file in an input directory is expected to
/// match.
#[derive(Clone, Copy, Debug)]
pub struct FrameLayout {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl FrameLayout {
    fn strides(&self) -> Vec<usize> {
        (0..self.format.plane_count())
            .map(|plane| self.width as usize * self.format.bytes_per_pixel(plane))
            .collect()
    }

    fn total_len(&self) -> usize {
        self.strides().iter().map(|stride| stride * self.height as usize).sum()
    }
}

/// Reads one frame file into [`PixelPlanes`], splitting the flat buffer
/// according to `layout`.
pub fn read_planes(path: &Path, layout: FrameLayout) -> Result<PixelPlanes> {
    let bytes = fs::read(path).with_context(|| format!("reading frame file {}", path.display()))?;
    let expected = layout.total_len();
    if bytes.len() != expected {
        bail!(
            "{} is {} bytes, expected {expected} for {:?} {}x{}",
            path.display(),
            bytes.len(),
            layout.format,
            layout.width,
            layout.height
        );
    }

    let strides = layout.strides();
    let mut planes = Vec::with_capacity(strides.len());
    let mut cursor = 0usize;
    for stride in &strides {
        let plane_len = stride * layout.height as usize;
        planes.push(bytes[cursor..cursor + plane_len].to_vec());
        cursor += plane_len;
    }

    Ok(PixelPlanes::builder()
        .format(layout.format)
        .width(layout.width)
        .height(layout.height)
        .strides(strides)
        .planes(planes)
        .build())
}

/// One frame file discovered in an input directory: its DCP index, eye, and
/// path, in submission order.
pub struct FrameEntry {
    pub index: u32,
    pub eye: Eye,
    pub path: PathBuf,
}

/// Scans `dir` for frame files named `frame_<index>.raw` (mono) or
/// `frame_<index>.left.raw` / `frame_<index>.right.raw` (stereoscopic),
/// returning them in presentation order.
///
/// # Errors
/// * `dir` cannot be read.
/// * A file name does not match the expected pattern.
pub fn scan(dir: &Path, stereoscopic: bool) -> Result<Vec<FrameEntry>> {
    let mut entries = Vec::new();
    for item in fs::read_dir(dir).with_context(|| format!("reading input directory {}", dir.display()))? {
        let item = item?;
        let path = item.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some((index, eye)) = parse_frame_name(name, stereoscopic) {
            entries.push(FrameEntry { index, eye, path });
        }
    }
    entries.sort_by_key(|entry| (entry.index, eye_order(entry.eye)));
    Ok(entries)
}

fn eye_order(eye: Eye) -> u8 {
    match eye {
        Eye::Mono | Eye::Left => 0,
        Eye::Right => 1,
    }
}

fn parse_frame_name(name: &str, stereoscopic: bool) -> Option<(u32, Eye)> {
    let stem = name.strip_suffix(".raw")?;
    let stem = stem.strip_prefix("frame_")?;
    if stereoscopic {
        let (index_part, eye_part) = stem.rsplit_once('.')?;
        let eye = match eye_part {
            "left" => Eye::Left,
            "right" => Eye::Right,
            _ => return None,
        };
        Some((index_part.parse().ok()?, eye))
    } else {
        Some((stem.parse().ok()?, Eye::Mono))
    }
}
