// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon settings
//!
//! Layers, lowest first: built-in defaults, a TOML file, `SANDKERN_*`
//! environment variables, then command-line flags (applied by the binary).
//! Nested keys use `__` in variable names, e.g.
//! `SANDKERN_KERNEL__HANDSHAKE_TIMEOUT_SECS=5`. `SANDKERN_BOOT_SCRIPT` takes
//! `;`-separated lines.

use std::path::{Path, PathBuf};

use anyhow::Context;
use sandkern_core::KernelConfig;
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "SANDKERN";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub kernel: KernelConfig,
    /// Executable spawned as the root process
    pub init: String,
    /// TTY attached to the host terminal
    pub console_tty: u32,
    /// Command lines written to the init script at boot
    pub boot_script: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            init: "/system/program/init".to_string(),
            console_tty: 0,
            boot_script: vec!["echo sandkern ready".to_string(), "ls /".to_string()],
        }
    }
}

/// `<config dir>/sandkern/config.toml`, read when no file is given explicitly
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sandkern").join("config.toml"))
}

pub fn load(path: Option<&Path>) -> anyhow::Result<DaemonConfig> {
    load_with_env(path, None)
}

/// Like [`load`], reading variables from `env` instead of the process environment
pub fn load_with_env(
    path: Option<&Path>,
    env: Option<config::Map<String, String>>,
) -> anyhow::Result<DaemonConfig> {
    let file = match path {
        Some(path) => Some((path.to_path_buf(), true)),
        None => default_config_path().map(|path| (path, false)),
    };

    let mut builder = config::Config::builder();
    if let Some((path, required)) = &file {
        builder = builder.add_source(
            config::File::from(path.as_path())
                .format(config::FileFormat::Toml)
                .required(*required),
        );
    }
    let built = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(";")
                .with_list_parse_key("boot_script")
                .try_parsing(true)
                .source(env),
        )
        .build()
        .with_context(|| match &file {
            Some((path, _)) => format!("loading settings from {}", path.display()),
            None => "loading settings".to_string(),
        })?;

    built.try_deserialize().context("invalid settings")
}
