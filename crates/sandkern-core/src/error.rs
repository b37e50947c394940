// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the sandkern kernel

use sandkern_proto::{Operation, SyscallError};

use crate::host::HostError;

/// Filesystem error taxonomy
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum FsError {
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
}

pub type FsResult<T> = Result<T, FsError>;

#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("host adapter error: {0}")]
    Host(#[from] HostError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("malformed executable descriptor: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("launch target is not valid UTF-8")]
    InvalidTarget,
    #[error("unsupported executable version {0}")]
    UnsupportedVersion(u32),
    #[error("interpreter chain deeper than {0}")]
    InterpreterDepthExceeded(u32),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Umbrella error for kernel-level operations
#[derive(thiserror::Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl From<&FsError> for SyscallError {
    fn from(err: &FsError) -> Self {
        match err {
            FsError::NoSuchEntry => SyscallError::NoSuchEntry,
            FsError::NoSuchFileHandle => SyscallError::NoSuchFileHandle,
            FsError::EntryExists => SyscallError::EntryExists,
            FsError::InvalidEntryType => SyscallError::InvalidEntryType,
            FsError::OperationInaccessible(op) => SyscallError::OperationInaccessible(*op),
            FsError::ParentDoesntExist => SyscallError::ParentDoesntExist,
            FsError::IsADirectory => SyscallError::IsADirectory,
            FsError::OutOfRange => SyscallError::OutOfRange,
        }
    }
}

impl From<&ProcessError> for SyscallError {
    fn from(err: &ProcessError) -> Self {
        match err {
            ProcessError::NoSuchProcess => SyscallError::NoSuchProcess,
            ProcessError::Host(host) => SyscallError::SpawnFailed(host.to_string()),
            ProcessError::Fs(fs) => fs.into(),
        }
    }
}

impl From<&ExecError> for SyscallError {
    fn from(err: &ExecError) -> Self {
        match err {
            ExecError::Fs(fs) => fs.into(),
            ExecError::Malformed(_) | ExecError::InvalidTarget => SyscallError::NotExecutable,
            ExecError::UnsupportedVersion(v) => SyscallError::UnsupportedExecutable(*v),
            ExecError::InterpreterDepthExceeded(d) => SyscallError::InterpreterDepthExceeded(*d),
            ExecError::Process(p) => p.into(),
        }
    }
}

impl From<&KernelError> for SyscallError {
    fn from(err: &KernelError) -> Self {
        match err {
            KernelError::Fs(e) => e.into(),
            KernelError::Process(e) => e.into(),
            KernelError::Exec(e) => e.into(),
        }
    }
}

impl From<FsError> for SyscallError {
    fn from(err: FsError) -> Self {
        (&err).into()
    }
}

impl From<KernelError> for SyscallError {
    fn from(err: KernelError) -> Self {
        (&err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_errors_map_to_wire_kind() {
        let err = KernelError::Exec(ExecError::Process(ProcessError::Fs(
            FsError::NoSuchFileHandle,
        )));
        assert_eq!(SyscallError::from(err), SyscallError::NoSuchFileHandle);

        let host = KernelError::Process(ProcessError::Host(HostError::UnknownTarget(
            "ghost".into(),
        )));
        assert!(matches!(SyscallError::from(host), SyscallError::SpawnFailed(msg) if msg.contains("ghost")));
    }
}
