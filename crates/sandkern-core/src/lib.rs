// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandkern core: the kernel state behind the syscall broker
//!
//! A [`Kernel`] owns an in-memory [`Vfs`], a [`ProcessManager`] and the
//! [`KernelConfig`] they run with. Execution contexts are created through a
//! pluggable [`HostAdapter`], so several independent kernels can coexist in
//! one process (tests rely on this).

pub mod config;
pub mod error;
pub mod exec;
pub mod host;
pub mod kernel;
pub mod process;
pub mod tty;
pub mod vfs;

pub use config::KernelConfig;
pub use error::{ExecError, FsError, FsResult, KernelError, KernelResult, ProcessError};
pub use exec::{Executable, LaunchPlan, DIRECT_LAUNCH};
pub use host::{ContextSpec, ExecutionContext, HostAdapter, HostError};
pub use kernel::Kernel;
pub use process::{
    AcceptedProcess, Caller, FdTable, ProcessInfo, ProcessManager, ProcessState, SpawnRequest,
    TokenLookup,
};
pub use tty::TtyHandles;
pub use vfs::{DescriptorInfo, HandleId, IoFlags, OpenOptions, Vfs};
