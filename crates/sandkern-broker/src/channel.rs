// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Message channel from execution contexts to the kernel

use sandkern_proto::{Envelope, Pid};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum KernelMessage {
    /// Syscall or handshake envelope posted by a context
    Envelope(Envelope),
    /// The host observed a process's program finishing
    Exited(Pid),
}

/// Sending half shared by every execution context
#[derive(Clone, Debug)]
pub struct KernelPort {
    tx: mpsc::UnboundedSender<KernelMessage>,
}

impl KernelPort {
    pub fn post(&self, envelope: Envelope) -> bool {
        self.tx.send(KernelMessage::Envelope(envelope)).is_ok()
    }

    pub fn notify_exit(&self, pid: Pid) -> bool {
        self.tx.send(KernelMessage::Exited(pid)).is_ok()
    }
}

pub struct KernelInbox {
    rx: mpsc::UnboundedReceiver<KernelMessage>,
}

impl KernelInbox {
    pub async fn recv(&mut self) -> Option<KernelMessage> {
        self.rx.recv().await
    }
}

pub fn kernel_channel() -> (KernelPort, KernelInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (KernelPort { tx }, KernelInbox { rx })
}
