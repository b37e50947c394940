// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandkern protocol: syscall schema and message envelopes
//!
//! This crate defines the closed set of syscalls understood by the kernel,
//! their typed arguments and replies, the wire error taxonomy, and the
//! envelope shape used on the message channel between execution contexts
//! and the kernel.

pub mod error;
pub mod messages;
pub mod types;

pub use error::{ProtoError, SyscallError};
pub use messages::{
    Envelope, InboundPacket, Outcome, PacketHeader, ResponsePacket, SYSCALL_PREFIX, SyscallName,
    SyscallRequest, process_init_envelope,
};
pub use types::{
    AccessFlag, Attributes, ByteCount, EntryInfo, EntryType, Fd, OpenType, Operation, Pid,
    ProcessLaunch, STDERR, STDIN, STDOUT, StatusFlag,
};
