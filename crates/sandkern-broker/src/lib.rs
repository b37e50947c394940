// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandkern broker: correlated syscall RPC between execution contexts and the kernel
//!
//! - [`SyscallBroker`] services the kernel inbox and answers each request on
//!   the caller's context outbox.
//! - [`SyscallClient`] is the context-side stub with its pending-call table.
//! - [`TaskHost`] realizes execution contexts as tokio tasks running
//!   registered [`Program`]s.

pub mod broker;
pub mod channel;
pub mod client;
pub mod task_host;

pub use broker::SyscallBroker;
pub use channel::{kernel_channel, KernelInbox, KernelMessage, KernelPort};
pub use client::{ClientError, SyscallClient};
pub use task_host::{Program, ProgramContext, TaskHost};
