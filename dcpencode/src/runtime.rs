// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};
use clap::Parser as _;
use dcpcore::j2k::CinemaProfileEncoder;
use dcpcore::{
    Config, EncodeCoordinator, Eye, FrameCache, PcmBlock, PixelFormat, PreparedFrame, Resolution,
    Writer, init_tracing, load,
};
use tracing::info;

use crate::cli::Cli;
use crate::frames::{self, FrameLayout};

/// Parses the command line, loads configuration, and drives one encode job
/// to completion.
pub fn run<I, T>(args: Option<I>) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = if let Some(args) = args {
        Cli::try_parse_from(args)?
    } else {
        Cli::try_parse()?
    };

    if cli.build_info {
        print_build_info();
        return Ok(());
    }

    let config_path = cli.config.clone().or_else(dcpcore::config::default_config_path);
    let mut config = load(config_path.as_ref()).context("loading configuration")?;
    apply_overrides(&mut config, &cli);

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| dirs2::data_local_dir().map(|dir| dir.join("dcpomatic").join("logs")))
        .unwrap_or_else(|| PathBuf::from("."));
    init_tracing(&config, &log_dir, "dcpencode.log").context("initializing tracing")?;

    info!(threads = config.local_encoding_threads(), "starting encode job");

    std::fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("creating output directory {}", cli.output_dir.display()))?;

    let format = parse_pixel_format(&cli.pixel_format)?;
    let resolution = parse_resolution(&cli.resolution)?;
    let layout = FrameLayout {
        format,
        width: cli.width,
        height: cli.height,
    };

    let entries = frames::scan(&cli.input_dir, cli.stereoscopic)?;
    if entries.is_empty() {
        bail!("no frame files found in {}", cli.input_dir.display());
    }

    let uuid = uuid::Uuid::new_v4();
    let picture_path = cli.output_dir.join(format!("j2c_{uuid}.mxf"));
    let audio_path = cli.output_dir.join(format!("pcm_{uuid}.mxf"));
    let frame_info_path = cli.output_dir.join(format!("frame_info_{uuid}"));

    let reorder_cap = cli
        .reorder_cap
        .unwrap_or_else(|| 8 * config.local_encoding_threads() as usize);

    let writer = Writer::create(
        &picture_path,
        &audio_path,
        &frame_info_path,
        cli.stereoscopic,
        reorder_cap,
    )
    .context("creating essence files")?;

    let frame_cache = if cli.resume {
        let path = cli
            .prior_frame_info
            .as_ref()
            .expect("clap requires --prior-frame-info alongside --resume");
        Some(FrameCache::open(path, cli.stereoscopic).context("opening prior frame-info cache")?)
    } else {
        None
    };
    let prior_essence_path = cli.prior_picture_essence.clone();

    let queue_cap = 2 * config.local_encoding_threads() as usize;
    let coordinator = EncodeCoordinator::new(
        writer,
        Box::new(CinemaProfileEncoder::new()),
        queue_cap,
        config.j2k_bandwidth(),
        cli.fps,
        config.protocol_version(),
        cli.stereoscopic,
        frame_cache,
        prior_essence_path,
    );

    let discovery = if config.use_any_servers() || !config.explicit_servers().is_empty() {
        Some((
            config.server_port_base(),
            config.use_any_servers(),
            config.explicit_servers().clone(),
        ))
    } else {
        None
    };
    coordinator.begin(config.local_encoding_threads(), discovery);

    let audio_bytes = cli
        .audio_file
        .as_ref()
        .map(std::fs::read)
        .transpose()
        .context("reading audio file")?;
    let bytes_per_audio_frame = usize::from(cli.channels) * 2;
    let audio_frames_per_video_frame = if cli.fps == 0 {
        0
    } else {
        (cli.sample_rate / cli.fps) as usize
    };

    let mut audio_cursor = 0usize;
    let total = entries.len();
    for (position, entry) in entries.iter().enumerate() {
        let planes = frames::read_planes(&entry.path, layout)?;
        let frame = PreparedFrame::builder()
            .planes(planes)
            .eye(entry.eye)
            .resolution(resolution)
            .build();
        coordinator.submit_video(frame, false);

        if let Some(bytes) = audio_bytes.as_ref()
            && matches!(entry.eye, Eye::Mono | Eye::Left)
            && audio_frames_per_video_frame > 0
        {
            let block_len = audio_frames_per_video_frame * bytes_per_audio_frame;
            let start = audio_cursor * block_len;
            if start < bytes.len() {
                let end = (start + block_len).min(bytes.len());
                let block = PcmBlock::builder()
                    .channels(cli.channels)
                    .sample_rate(cli.sample_rate)
                    .samples(bytes[start..end].to_vec())
                    .build();
                coordinator.submit_audio(&block);
                audio_cursor += 1;
            }
        }

        if position % 100 == 0 {
            info!(position, total, rate = coordinator.current_rate(), "encoding progress");
        }
    }

    coordinator.finish().context("flushing essence and frame-info files")?;
    info!(picture = %picture_path.display(), audio = %audio_path.display(), "encode complete");
    Ok(())
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(threads) = cli.local_threads {
        config.set_local_encoding_threads(threads);
    }
    if let Some(bandwidth) = cli.j2k_bandwidth {
        config.set_j2k_bandwidth(bandwidth);
    }
    if cli.use_any_servers {
        config.set_use_any_servers(true);
    }
    if cli.no_use_any_servers {
        config.set_use_any_servers(false);
    }
    if !cli.servers.is_empty() {
        let mut servers = config.explicit_servers().clone();
        servers.extend(cli.servers.iter().cloned());
        config.set_explicit_servers(servers);
    }
    config.set_verbose(cli.verbose);
    config.set_quiet(cli.quiet);
}

fn parse_pixel_format(value: &str) -> Result<PixelFormat> {
    match value.to_ascii_lowercase().as_str() {
        "rgb24" => Ok(PixelFormat::Rgb24),
        "rgb48le" => Ok(PixelFormat::Rgb48Le),
        "yuv420p" => Ok(PixelFormat::Yuv420P),
        "yuv422p" => Ok(PixelFormat::Yuv422P),
        "yuv444p" => Ok(PixelFormat::Yuv444P),
        other => bail!("unknown pixel format {other:?}"),
    }
}

fn parse_resolution(value: &str) -> Result<Resolution> {
    match value.to_ascii_lowercase().as_str() {
        "2k" => Ok(Resolution::TwoK),
        "4k" => Ok(Resolution::FourK),
        other => bail!("unknown resolution {other:?}"),
    }
}

fn print_build_info() {
    use vergen_pretty::{Pretty, vergen_pretty_env};

    if let Ok(pretty) = Pretty::builder().env(vergen_pretty_env!()).build() {
        let _ = pretty.display(&mut std::io::stdout());
    }
}
