// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! sandkernd internals: settings, boot sequence, builtin programs and the
//! console pump between TTY 0 and the host terminal

pub mod boot;
pub mod builtins;
pub mod console;
pub mod settings;

pub use boot::{boot, System};
pub use settings::DaemonConfig;
