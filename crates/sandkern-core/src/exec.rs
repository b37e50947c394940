// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Executable descriptors and interpreter chain resolution

use sandkern_proto::{AccessFlag, ByteCount, EntryType, OpenType, Operation, StatusFlag};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExecError, FsError};
use crate::vfs::{IoFlags, OpenOptions, Vfs};

/// Interpreter value marking a descriptor whose payload is the launch target
pub const DIRECT_LAUNCH: &str = "direct";

/// Versions at or above this are rejected
pub const UNSUPPORTED_VERSION: u32 = 200;

pub const CURRENT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executable {
    pub version: u32,
    pub interpreter: String,
    pub data: Vec<u8>,
}

impl Executable {
    pub fn direct(target: &str) -> Self {
        Self {
            version: CURRENT_VERSION,
            interpreter: DIRECT_LAUNCH.to_string(),
            data: target.as_bytes().to_vec(),
        }
    }

    /// Descriptor run through another executable, shebang style
    pub fn interpreted(interpreter: &str, data: Vec<u8>) -> Self {
        Self {
            version: CURRENT_VERSION,
            interpreter: interpreter.to_string(),
            data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ExecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ExecError> {
        let executable: Executable = serde_json::from_slice(bytes)?;
        if executable.version >= UNSUPPORTED_VERSION {
            return Err(ExecError::UnsupportedVersion(executable.version));
        }
        Ok(executable)
    }

    pub fn is_direct(&self) -> bool {
        self.interpreter == DIRECT_LAUNCH
    }
}

/// Target and argument vector after following the interpreter chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchPlan {
    pub target: String,
    pub args: Vec<String>,
}

async fn load(vfs: &Vfs, path: &str) -> Result<Executable, ExecError> {
    let entry = vfs.stat(path)?;
    match entry.kind {
        EntryType::Directory => return Err(FsError::IsADirectory.into()),
        EntryType::FunctionalFile => return Err(FsError::InvalidEntryType.into()),
        EntryType::File => {}
    }
    if !entry.attributes.execute {
        return Err(FsError::OperationInaccessible(Operation::Execute).into());
    }

    let handle = vfs.open(
        path,
        &OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Normal, OpenType::Normal),
    )?;
    let bytes = vfs.read(handle, ByteCount::All, 0, IoFlags::PRIVILEGED).await;
    vfs.close(handle);
    Executable::from_bytes(&bytes?)
}

/// Follow interpreter indirections from `path` to a launch target
///
/// Each indirection prepends the path of the descriptor being interpreted to
/// the argument vector.
pub async fn resolve(
    vfs: &Vfs,
    path: &str,
    args: Vec<String>,
    max_depth: u32,
) -> Result<LaunchPlan, ExecError> {
    let mut path = path.to_string();
    let mut args = args;
    let mut depth = 0;

    loop {
        let executable = load(vfs, &path).await?;
        if executable.is_direct() {
            let target = String::from_utf8(executable.data).map_err(|_| ExecError::InvalidTarget)?;
            debug!(%path, %target, depth, "resolved executable");
            return Ok(LaunchPlan { target, args });
        }

        depth += 1;
        if depth > max_depth {
            return Err(ExecError::InterpreterDepthExceeded(max_depth));
        }
        args.insert(0, std::mem::replace(&mut path, executable.interpreter));
    }
}
