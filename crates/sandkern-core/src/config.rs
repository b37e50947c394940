// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables of a kernel instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Seconds a spawned context has to complete `processInit` before it is reaped
    pub handshake_timeout_secs: u64,
    /// Longest interpreter indirection chain `exec` will follow
    pub max_interpreter_depth: u32,
    /// Directory under which TTY device files are created
    pub tty_directory: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 60,
            max_interpreter_depth: 8,
            tty_directory: "/system/device/tty".to_string(),
        }
    }
}

impl KernelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
