// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::path::PathBuf;

use clap::Parser;

/// Encodes a directory of prepared picture frames (and optional PCM audio)
/// into a DCP picture/audio essence pair, fanning out across local and
/// discovered remote encode servers.
#[derive(Debug, Parser)]
#[command(name = "dcpencode", version, about)]
pub struct Cli {
    /// Directory of input frames, named `frame_<index>.<eye>.raw` (or
    /// `frame_<index>.raw` for non-stereoscopic content), each holding tightly
    /// packed pixel planes matching `--pixel-format`/`--width`/`--height`.
    #[arg(long)]
    pub input_dir: PathBuf,

    /// Optional file of interleaved 16-bit PCM samples at `--sample-rate`,
    /// `--channels` channels, submitted alongside the picture frames.
    #[arg(long)]
    pub audio_file: Option<PathBuf>,

    /// Directory the picture/audio essence and frame-info files are written
    /// into.
    #[arg(long)]
    pub output_dir: PathBuf,

    /// Frame width in pixels.
    #[arg(long)]
    pub width: u32,

    /// Frame height in pixels.
    #[arg(long)]
    pub height: u32,

    /// Input pixel format.
    #[arg(long, default_value = "rgb24")]
    pub pixel_format: String,

    /// Output JPEG2000 resolution.
    #[arg(long, default_value = "2k")]
    pub resolution: String,

    /// Timeline frame rate.
    #[arg(long, default_value_t = 24)]
    pub fps: u32,

    /// PCM sample rate, in Hz.
    #[arg(long, default_value_t = 48_000)]
    pub sample_rate: u32,

    /// PCM channel count.
    #[arg(long, default_value_t = 2)]
    pub channels: u16,

    /// Encodes the input as a stereoscopic (3D) title: each frame index
    /// must have matching `.left.raw`/`.right.raw` files.
    #[arg(long)]
    pub stereoscopic: bool,

    /// Resumes from a prior run's frame-info file and essence, fake-writing
    /// any frame already recorded there instead of re-encoding it. Requires
    /// `--prior-frame-info` and `--prior-picture-essence`.
    #[arg(long, requires_all = ["prior_frame_info", "prior_picture_essence"])]
    pub resume: bool,

    /// A prior run's frame-info file, consulted when `--resume` is set.
    #[arg(long)]
    pub prior_frame_info: Option<PathBuf>,

    /// A prior run's picture essence file, read back from for fake-writes.
    #[arg(long)]
    pub prior_picture_essence: Option<PathBuf>,

    /// Overrides the configured local worker thread count.
    #[arg(long)]
    pub local_threads: Option<u32>,

    /// Overrides the configured JPEG2000 target bandwidth, in bits/second.
    #[arg(long)]
    pub j2k_bandwidth: Option<u64>,

    /// Enables broadcast discovery of remote encode servers in addition to
    /// any explicitly-listed ones.
    #[arg(long)]
    pub use_any_servers: bool,

    /// Disables broadcast discovery, overriding the configuration file.
    #[arg(long, conflicts_with = "use_any_servers")]
    pub no_use_any_servers: bool,

    /// An explicit remote server host to probe, in addition to (or instead
    /// of) broadcast discovery. May be given multiple times.
    #[arg(long = "server")]
    pub servers: Vec<String>,

    /// In-memory reorder window before pending frames spill to disk.
    #[arg(long)]
    pub reorder_cap: Option<usize>,

    /// Path to a TOML configuration file, overriding the default location.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory log files are written into.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Increases logging verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decreases logging verbosity; may be repeated.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Prints build information and exits.
    #[arg(long)]
    pub build_info: bool,
}
