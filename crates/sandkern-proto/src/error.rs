// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Wire error taxonomy and envelope decoding errors

use serde::{Deserialize, Serialize};

use crate::types::Operation;

/// Failure carried back to the caller inside a syscall response
///
/// Members are named and carry at most one parameter so that callers can
/// branch on the kind rather than parse messages.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "detail")]
pub enum SyscallError {
    #[error("no such entry")]
    NoSuchEntry,
    #[error("no such file handle")]
    NoSuchFileHandle,
    #[error("entry exists")]
    EntryExists,
    #[error("invalid entry type")]
    InvalidEntryType,
    #[error("operation inaccessible: {0}")]
    OperationInaccessible(Operation),
    #[error("parent doesn't exist")]
    ParentDoesntExist,
    #[error("is a directory")]
    IsADirectory,
    #[error("out of range")]
    OutOfRange,
    #[error("no such process")]
    NoSuchProcess,
    #[error("not executable")]
    NotExecutable,
    #[error("unsupported executable version {0}")]
    UnsupportedExecutable(u32),
    #[error("interpreter chain deeper than {0}")]
    InterpreterDepthExceeded(u32),
    #[error("spawn failed: {0}")]
    SpawnFailed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Malformed envelope or argument list
#[derive(thiserror::Error, Debug)]
pub enum ProtoError {
    #[error("message type {0:?} is not a kernel syscall")]
    NotASyscall(String),
    #[error("unknown syscall {0:?}")]
    UnknownSyscall(String),
    #[error("missing argument {index} for {syscall}")]
    MissingArgument { syscall: &'static str, index: usize },
    #[error("invalid argument {index} for {syscall}: {source}")]
    InvalidArgument {
        syscall: &'static str,
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
