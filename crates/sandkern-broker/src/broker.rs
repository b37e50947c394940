// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel side of the syscall protocol
//!
//! The broker authenticates every request by its handshake token, maps the
//! caller's local fds to kernel handles and runs the matching kernel
//! operation. Each request runs in its own task, so a functional read that
//! suspends never holds up the write that will resolve it.

use std::sync::Arc;

use sandkern_core::{
    AcceptedProcess, Caller, HandleId, IoFlags, Kernel, KernelError, KernelResult, OpenOptions,
    TokenLookup,
};
use sandkern_proto::{
    Envelope, Fd, InboundPacket, Outcome, PacketHeader, ProcessLaunch, SyscallError,
    SyscallName, SyscallRequest,
};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{KernelInbox, KernelMessage};

#[derive(Clone)]
pub struct SyscallBroker {
    kernel: Arc<Kernel>,
}

impl SyscallBroker {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Service the inbox until it closes or shutdown is requested
    pub async fn run(&self, mut inbox: KernelInbox, mut shutdown: oneshot::Receiver<()>) {
        info!("syscall broker running");
        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                _ = &mut shutdown => break,
            }
        }
        info!("syscall broker stopped");
    }

    pub fn handle_message(&self, message: KernelMessage) {
        match message {
            KernelMessage::Envelope(envelope) => self.handle_envelope(&envelope),
            KernelMessage::Exited(pid) => {
                if let Err(err) = self.kernel.processes().exit(pid) {
                    debug!(%pid, error = %err, "exit notification for unknown process");
                }
            }
        }
    }

    fn handle_envelope(&self, envelope: &Envelope) {
        let header = match PacketHeader::decode(envelope) {
            Ok(header) => header,
            Err(err) => {
                warn!(kind = %envelope.kind, error = %err, "dropping malformed message");
                return;
            }
        };

        if header.name == SyscallName::ProcessInit {
            match self.kernel.processes().accept(&header.token) {
                Ok(accepted) => respond_launch(accepted, header.correlation_id),
                Err(err) => debug!(error = %err, "dropping processInit with unknown token"),
            }
            return;
        }

        let caller = match self.kernel.processes().lookup(&header.token) {
            TokenLookup::Running(caller) => caller,
            TokenLookup::Spawning(pid) => {
                debug!(%pid, "dropping syscall from process before handshake");
                return;
            }
            TokenLookup::Unknown => {
                debug!(syscall = %header.name, "dropping syscall with unknown token");
                return;
            }
        };

        let name = header.name;
        let correlation_id = header.correlation_id;
        let request = match InboundPacket::decode_with_header(header, envelope) {
            Ok(InboundPacket::Syscall { request, .. }) => request,
            Ok(InboundPacket::ProcessInit { .. }) => return,
            Err(err) => {
                warn!(pid = %caller.pid, syscall = %name, error = %err, "rejecting malformed syscall");
                let rejected = SyscallError::InvalidArgument(err.to_string());
                respond(&caller, name, correlation_id, Outcome::<()>::Err(rejected));
                return;
            }
        };

        let kernel = self.kernel.clone();
        tokio::spawn(async move {
            debug!(pid = %caller.pid, syscall = %name, correlation_id, "syscall");
            let result = dispatch(&kernel, &caller, request)
                .await
                .map_err(|err| SyscallError::from(&err));
            respond(&caller, name, correlation_id, Outcome::from(result));
        });
    }
}

fn respond_launch(accepted: AcceptedProcess, correlation_id: u64) {
    let launch = ProcessLaunch {
        pid: accepted.pid,
        args: accepted.args,
        env: accepted.env,
    };
    let caller = Caller {
        pid: accepted.pid,
        context: accepted.context,
    };
    respond(&caller, SyscallName::ProcessInit, correlation_id, Outcome::Ok(launch));
}

fn respond<T: serde::Serialize>(
    caller: &Caller,
    name: SyscallName,
    correlation_id: u64,
    outcome: Outcome<T>,
) {
    match Envelope::response(name, correlation_id, &outcome) {
        Ok(envelope) => {
            if !caller.context.post(envelope) {
                debug!(pid = %caller.pid, syscall = %name, "context gone before response");
            }
        }
        Err(err) => {
            warn!(pid = %caller.pid, syscall = %name, error = %err, "failed to encode response")
        }
    }
}

/// Run one request on behalf of `caller`
async fn dispatch(kernel: &Kernel, caller: &Caller, request: SyscallRequest) -> KernelResult<Value> {
    let vfs = kernel.vfs();
    let processes = kernel.processes();
    let pid = caller.pid;

    let reply = match request {
        SyscallRequest::Open {
            path,
            access,
            status,
            kind,
        } => {
            let handle = vfs.open(&path, &OpenOptions::new(access, status, kind))?;
            let fd = install(kernel, caller, handle)?;
            json!(fd)
        }
        SyscallRequest::Close { handle } => {
            let existed = processes.close_fd(pid, handle)?;
            json!(existed)
        }
        SyscallRequest::Read {
            handle,
            count,
            offset,
        } => {
            let handle = processes.resolve_fd(pid, handle)?;
            let bytes = vfs.read(handle, count, offset, IoFlags::default()).await?;
            json!(bytes)
        }
        SyscallRequest::Write {
            handle,
            buffer,
            count,
            offset,
        } => {
            let handle = processes.resolve_fd(pid, handle)?;
            let written = vfs
                .write(handle, &buffer, count, offset, IoFlags::default())
                .await?;
            json!(written)
        }
        SyscallRequest::Opendir { path } => {
            let handle = vfs.opendir(&path)?;
            let fd = install(kernel, caller, handle)?;
            json!(fd)
        }
        SyscallRequest::Readdir { handle } => {
            let handle = processes.resolve_fd(pid, handle)?;
            let entries = vfs.readdir(handle)?;
            json!(entries)
        }
        SyscallRequest::Exec { path, args, env } => {
            let child = kernel.exec(Some(pid), &path, args, env).await?;
            json!(child)
        }
    };
    Ok(reply)
}

fn install(kernel: &Kernel, caller: &Caller, handle: HandleId) -> Result<Fd, KernelError> {
    kernel.processes().install_fd(caller.pid, handle).map_err(|err| {
        kernel.vfs().close(handle);
        err.into()
    })
}
