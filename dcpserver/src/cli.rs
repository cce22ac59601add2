// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::path::PathBuf;

use clap::Parser;

/// Runs a long-lived encode server: accepts one-shot encode requests,
/// answers discovery probes, and periodically announces itself (spec §4.5).
#[derive(Debug, Parser)]
#[command(name = "dcpserver", version, about)]
pub struct Cli {
    /// Hostname or address advertised to clients in discovery replies.
    #[arg(long)]
    pub host: Option<String>,

    /// Overrides the configured request port; probing listens on `port + 1`.
    #[arg(long)]
    pub port: Option<u16>,

    /// Overrides the configured local worker thread count.
    #[arg(long)]
    pub threads: Option<u32>,

    /// Overrides the configured JPEG2000 target bandwidth, in bits/second.
    #[arg(long)]
    pub j2k_bandwidth: Option<u64>,

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
