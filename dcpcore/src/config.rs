// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::path::PathBuf;

use config::{Config as RawConfig, Environment, File};
use getset::{CopyGetters, Getters, Setters};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber_init::{TracingConfig, get_effective_level};

use crate::error::CoreError;
use crate::tracing::TracingConfigExt;

/// The configuration keys consumed by the pipeline, per spec §6's table.
#[derive(Clone, CopyGetters, Debug, Deserialize, Getters, PartialEq, Serialize, Setters)]
pub struct Config {
    /// Size of the local worker pool.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    local_encoding_threads: u32,
    /// Base port for encode requests; `base + 1` carries discovery.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    server_port_base: u16,
    /// Enables UDP broadcast discovery of remote servers.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    use_any_servers: bool,
    /// Hosts probed for remote servers even when broadcast is disabled.
    #[getset(get = "pub")]
    #[getset(set = "pub")]
    explicit_servers: Vec<String>,
    /// Target bits per second for the picture essence.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    j2k_bandwidth: u64,
    /// Handshake value exchanged first in the wire protocol (§4.3).
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    protocol_version: u32,
    /// Verbosity level applied on top of the base log level.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    verbose: u8,
    /// Quiet level applied on top of the base log level.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    quiet: u8,
    /// Whether to also log to stdout, in addition to the rotating file.
    #[getset(get_copy = "pub")]
    #[getset(set = "pub")]
    enable_stdout: bool,
    /// Extra `tracing` directives, comma-separated, appended to the level.
    #[getset(get = "pub")]
    directives: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_encoding_threads: default_local_encoding_threads(),
            server_port_base: 6192,
            use_any_servers: true,
            explicit_servers: Vec::new(),
            j2k_bandwidth: 250_000_000,
            protocol_version: 1,
            verbose: 0,
            quiet: 0,
            enable_stdout: true,
            directives: None,
        }
    }
}

fn default_local_encoding_threads() -> u32 {
    std::thread::available_parallelism().map_or(1, |n| n.get() as u32)
}

impl TracingConfig for Config {
    fn quiet(&self) -> u8 {
        self.quiet
    }

    fn verbose(&self) -> u8 {
        self.verbose
    }
}

impl TracingConfigExt for Config {
    fn enable_stdout(&self) -> bool {
        self.enable_stdout
    }

    fn directives(&self) -> Option<&String> {
        self.directives.as_ref()
    }

    fn level(&self) -> Level {
        get_effective_level(self.quiet(), self.verbose())
    }
}

/// Loads a `Config` by layering, lowest to highest priority: built-in
/// defaults, a TOML file at `path` (if it exists), then environment
/// variables prefixed `DCPOMATIC_`.
///
/// # Errors
/// * The file exists but fails to parse.
/// * The merged configuration fails to deserialize into `Config`.
pub fn load(path: Option<&PathBuf>) -> Result<Config, CoreError> {
    let defaults = Config::default();
    let mut builder = RawConfig::builder().add_source(
        config::Config::try_from(&defaults)
            .map_err(CoreError::Config)?
            .clone(),
    );
    if let Some(path) = path
        && path.exists()
    {
        builder = builder.add_source(File::from(path.as_path()));
    }
    builder = builder.add_source(Environment::with_prefix("DCPOMATIC").separator("__"));
    let raw = builder.build().map_err(CoreError::Config)?;
    raw.try_deserialize().map_err(CoreError::Config)
}

/// Default location for the TOML configuration file, under the platform
/// config directory (`~/.config/dcpomatic/dcpomatic.toml` on Linux).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    let mut dir = dirs2::config_dir()?;
    dir.push("dcpomatic");
    dir.push("dcpomatic.toml");
    Some(dir)
}

#[cfg(test)]
mod tests {
    use super::{Config, load};

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.local_encoding_threads() >= 1);
        assert_eq!(config.server_port_base(), 6192);
        assert!(config.use_any_servers());
        assert!(config.explicit_servers().is_empty());
        assert_eq!(config.protocol_version(), 1);
    }

    #[test]
    fn load_with_no_file_returns_defaults() {
        let config = load(None).expect("defaults alone must deserialize");
        assert_eq!(config, Config::default());
    }
}
