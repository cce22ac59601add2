// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{Level, level_filters::LevelFilter, subscriber::DefaultGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry};
#[cfg(not(test))]
use tracing_subscriber_init::try_init;
use tracing_subscriber_init::{Iso8601, TracingConfig, UtcTime, compact};

use crate::error::CoreError;

/// Extension trait adding the bits of tracing configuration the teacher's
/// `TracingConfig` doesn't cover: whether to also log to stdout, extra
/// directives, and the effective level.
pub trait TracingConfigExt: TracingConfig {
    /// Whether stdout logging is enabled in addition to the rotating file.
    fn enable_stdout(&self) -> bool;
    /// Extra `tracing` directives, comma-separated.
    fn directives(&self) -> Option<&String>;
    /// The effective level after applying verbose/quiet.
    fn level(&self) -> Level;
}

/// Initializes the global `tracing` subscriber: an optional stdout layer plus
/// a daily-rotating file layer under `log_dir`, replacing the original C++
/// implementation's single mutex-guarded `Log` file.
///
/// # Errors
/// * The log directory cannot be created.
pub fn init_tracing<T>(config: &T, log_dir: &PathBuf, log_file_stem: &str) -> Result<()>
where
    T: TracingConfigExt,
{
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.enable_stdout() {
        let (layer, level_filter) = compact(config);
        let directives = directives(config, level_filter);
        let filter = EnvFilter::builder()
            .with_default_directive(level_filter.into())
            .parse_lossy(directives);
        layers.push(
            layer
                .with_timer(UtcTime::new(Iso8601::DEFAULT))
                .with_filter(filter)
                .boxed(),
        );
    }

    std::fs::create_dir_all(log_dir)?;
    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, log_file_stem);
    let (layer, level_filter) = compact(config);
    let directives = directives(config, level_filter);
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .parse_lossy(directives);
    layers.push(
        layer
            .with_timer(UtcTime::new(Iso8601::DEFAULT))
            .with_writer(appender)
            .with_filter(filter)
            .boxed(),
    );

    let _guard_opt = try_initialize(layers).map_err(CoreError::Transport)?;
    Ok(())
}

#[cfg(not(test))]
#[cfg_attr(coverage_nightly, coverage(off))]
fn try_initialize(
    layers: Vec<Box<dyn Layer<Registry> + Send + Sync + 'static>>,
) -> Result<Option<DefaultGuard>, crate::error::TransportError> {
    // try_init never returns a transport error; the signature matches the
    // test-mode variant below so call sites don't need two code paths.
    try_init(layers).ok();
    Ok(None)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
fn try_initialize(
    layers: Vec<Box<dyn Layer<Registry> + Send + Sync + 'static>>,
) -> Result<Option<DefaultGuard>, crate::error::TransportError> {
    use tracing_subscriber_init::set_default;
    Ok(Some(set_default(layers)))
}

fn directives<T>(config: &T, level_filter: LevelFilter) -> String
where
    T: TracingConfigExt,
{
    let base = match level_filter.into_level() {
        Some(Level::TRACE) => "trace",
        Some(Level::DEBUG) => "debug",
        Some(Level::INFO) => "info",
        Some(Level::WARN) => "warn",
        Some(Level::ERROR) => "error",
        None => "info",
    };
    config
        .directives()
        .map_or_else(|| base.to_string(), |extra| format!("{base},{extra}"))
}

#[cfg(test)]
mod tests {
    use tracing::Level;
    use tracing_subscriber_init::TracingConfig;

    use super::{TracingConfigExt, directives, init_tracing};

    struct TestConfig {
        verbose: u8,
        quiet: u8,
        level: Level,
        directives: Option<String>,
        enable_stdout: bool,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            Self {
                verbose: 0,
                quiet: 0,
                level: Level::INFO,
                directives: None,
                enable_stdout: false,
            }
        }
    }

    impl TracingConfig for TestConfig {
        fn quiet(&self) -> u8 {
            self.quiet
        }

        fn verbose(&self) -> u8 {
            self.verbose
        }
    }

    impl TracingConfigExt for TestConfig {
        fn enable_stdout(&self) -> bool {
            self.enable_stdout
        }

        fn directives(&self) -> Option<&String> {
            self.directives.as_ref()
        }

        fn level(&self) -> Level {
            self.level
        }
    }

    #[test]
    fn init_tracing_works() {
        let dir = tempfile::tempdir().unwrap();
        let config = TestConfig::default();
        assert!(init_tracing(&config, &dir.path().to_path_buf(), "dcpomatic.log").is_ok());
    }

    #[test]
    fn init_tracing_works_with_directives_and_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let config = TestConfig {
            directives: Some("dcpcore=trace".to_string()),
            enable_stdout: true,
            ..TestConfig::default()
        };
        assert!(init_tracing(&config, &dir.path().to_path_buf(), "dcpomatic.log").is_ok());
    }

    #[test]
    fn test_directives() {
        let config = TestConfig::default();
        assert_eq!(
            directives(&config, tracing::level_filters::LevelFilter::OFF),
            "info"
        );
        assert_eq!(
            directives(&config, tracing::level_filters::LevelFilter::TRACE),
            "trace"
        );
    }
}
