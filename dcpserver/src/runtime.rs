// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser as _;
use dcpcore::{Daemon, ServerDescription, init_tracing, load};
use tracing::{info, warn};

use crate::cli::Cli;

/// Parses the command line, loads configuration, and runs the encode
/// server until the process is killed.
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
    if let Some(port) = cli.port {
        config.set_server_port_base(port);
    }
    if let Some(threads) = cli.threads {
        config.set_local_encoding_threads(threads);
    }
    if let Some(bandwidth) = cli.j2k_bandwidth {
        config.set_j2k_bandwidth(bandwidth);
    }
    config.set_verbose(cli.verbose);
    config.set_quiet(cli.quiet);

    let log_dir = cli
        .log_dir
        .clone()
        .or_else(|| dirs2::data_local_dir().map(|dir| dir.join("dcpomatic").join("logs")))
        .unwrap_or_else(|| PathBuf::from("."));
    init_tracing(&config, &log_dir, "dcpserver.log").context("initializing tracing")?;

    let host = resolve_host(cli.host.clone());

    let description = ServerDescription::builder()
        .host(host.clone())
        .port(config.server_port_base())
        .thread_count(config.local_encoding_threads())
        .build();

    info!(
        host,
        port = config.server_port_base(),
        threads = config.local_encoding_threads(),
        "starting encode server"
    );

    let _daemon = Daemon::start(
        config.server_port_base(),
        config.local_encoding_threads(),
        config.j2k_bandwidth(),
        config.protocol_version(),
        description,
    )
    .context("starting daemon")?;

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Falls back to `localhost` (with a warning) when no `--host` is given,
/// since [`ServerDescription`] needs something to advertise to clients.
fn resolve_host(cli_host: Option<String>) -> String {
    cli_host.unwrap_or_else(|| {
        warn!("no --host given; advertising \"localhost\", which only works for local clients");
        "localhost".to_string()
    })
}

fn print_build_info() {
    use vergen_pretty::{Pretty, vergen_pretty_env};

    if let Ok(pretty) = Pretty::builder().env(vergen_pretty_env!()).build() {
        let _ = pretty.display(&mut std::io::stdout());
    }
}

#[cfg(test)]
mod tests {
    use super::resolve_host;

    #[test]
    fn resolve_host_passes_through_explicit_value() {
        assert_eq!(resolve_host(Some("encode1.example".to_string())), "encode1.example");
    }

    #[test]
    fn resolve_host_falls_back_to_localhost() {
        assert_eq!(resolve_host(None), "localhost");
    }
}
