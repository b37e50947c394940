// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host adapter seam
//!
//! The kernel never knows how an isolated execution context is realized. It
//! asks the host to create one addressed with a launch target and a handshake
//! token, talks to it through the context's outbox, and asks the host to tear
//! it down when the process is reaped or exits.

use sandkern_proto::{Envelope, Pid};
use tokio::sync::mpsc;

/// Parameters the host needs to bring up a new execution context
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextSpec {
    pub pid: Pid,
    pub target: String,
    pub token: String,
}

/// Kernel-side reference to a live execution context
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    id: u64,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl ExecutionContext {
    pub fn new(id: u64, outbox: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { id, outbox }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Deliver a message to the context; returns false once the context is gone
    pub fn post(&self, envelope: Envelope) -> bool {
        self.outbox.send(envelope).is_ok()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("no program registered for target {0:?}")]
    UnknownTarget(String),
    #[error("{0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
pub trait HostAdapter: Send + Sync {
    fn create_context(&self, spec: &ContextSpec) -> Result<ExecutionContext, HostError>;

    fn terminate_context(&self, context: &ExecutionContext);
}
