// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging setup for sandkern binaries
//!
//! Binaries flatten [`CliLoggingArgs`] into their clap struct and call
//! [`CliLoggingArgs::init`]. `RUST_LOG` always wins over the CLI level.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use tracing::Level;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Plaintext,
    /// One JSON object per event
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("invalid log format '{other}', use 'plaintext' or 'json'")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&Level::from(*self).as_str().to_lowercase())
    }
}

/// Logging flags shared by every binary; use with `#[command(flatten)]`
///
/// Logs go to stderr unless `--log-file` or `--log-dir` is given, so they
/// never interleave with TTY output on stdout.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    #[arg(long, value_enum, help = "Log verbosity level (default: info)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    #[arg(long, value_enum, help = "Log output format (default: plaintext)")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    #[arg(long, help = "Directory for log files")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    #[arg(
        long,
        help = "Log filename, relative to --log-dir when both are given; a bare name alone lands in the standard log directory"
    )]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl CliLoggingArgs {
    pub fn init(self, component: &str) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or_default().into();
        let format = self.log_format.unwrap_or_default();
        match self.log_path(component) {
            Some(path) => init_to_file(component, level, format, &path),
            None => init(component, level, format),
        }
    }

    /// Where file logging should go, or `None` for stderr
    pub fn log_path(&self, component: &str) -> Option<PathBuf> {
        match (&self.log_dir, &self.log_file) {
            (None, None) => None,
            (Some(dir), None) => Some(Path::new(dir).join(format!("{component}.log"))),
            (None, Some(file)) => {
                let file = Path::new(file);
                if file.parent().is_some_and(|parent| parent.as_os_str().is_empty()) {
                    Some(standard_log_path(component).with_file_name(file))
                } else {
                    Some(file.to_path_buf())
                }
            }
            (Some(dir), Some(file)) => {
                let file = Path::new(file);
                if file.is_absolute() {
                    Some(file.to_path_buf())
                } else {
                    Some(Path::new(dir).join(file))
                }
            }
        }
    }
}

/// Platform log location for `component`; bare `--log-file` names land beside it
pub fn standard_log_path(component: &str) -> PathBuf {
    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    path.push("sandkern");
    path.push(format!("{component}.log"));
    path
}

pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;
    init_with_writer(component, default_level, format, file)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter(component, default_level));

    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            tracing_subscriber::registry().with(filter).with(layer).try_init()?;
        }
    }
    Ok(())
}

fn default_filter(component: &str, level: Level) -> EnvFilter {
    // crate targets use underscores even when the binary name has dashes
    let target = component.replace('-', "_");
    EnvFilter::new(format!("{level},{target}={level}"))
}
