// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Context side of the syscall protocol
//!
//! Every call registers a pending entry under a fresh correlation id and
//! suspends on it. A pump task routes responses to pending entries by id, so
//! several calls from one context may be in flight and complete in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use sandkern_proto::{
    process_init_envelope, AccessFlag, ByteCount, EntryInfo, Envelope, Fd, OpenType, Outcome,
    Pid, ProcessLaunch, ProtoError, ResponsePacket, StatusFlag, SyscallError, SyscallRequest,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::KernelPort;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("kernel returned {0}")]
    Kernel(#[from] SyscallError),
    #[error("kernel channel disconnected")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtoError),
}

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct SyscallClient {
    token: String,
    port: KernelPort,
    pending: PendingTable,
    next_id: AtomicU64,
    pump: JoinHandle<()>,
}

impl SyscallClient {
    /// Start routing responses arriving on `responses` to pending calls
    pub fn connect(
        token: impl Into<String>,
        port: KernelPort,
        mut responses: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let pump = tokio::spawn({
            let pending = pending.clone();
            async move {
                while let Some(envelope) = responses.recv().await {
                    let packet = match ResponsePacket::decode(&envelope) {
                        Ok(packet) => packet,
                        Err(err) => {
                            debug!(kind = %envelope.kind, error = %err, "ignoring malformed response");
                            continue;
                        }
                    };
                    let waiter = pending.lock().unwrap().remove(&packet.correlation_id);
                    match waiter {
                        Some(waiter) => {
                            waiter.send(packet.payload).ok();
                        }
                        None => warn!(
                            correlation_id = packet.correlation_id,
                            syscall = %packet.name,
                            "response for unknown correlation id"
                        ),
                    }
                }
                // dropping the senders fails every call still waiting
                pending.lock().unwrap().clear();
            }
        });

        Self {
            token: token.into(),
            port,
            pending,
            next_id: AtomicU64::new(0),
            pump,
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<Value>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    async fn exchange<T: DeserializeOwned>(
        &self,
        id: u64,
        envelope: Envelope,
        reply: oneshot::Receiver<Value>,
    ) -> Result<T, ClientError> {
        if !self.port.post(envelope) {
            self.pending.lock().unwrap().remove(&id);
            return Err(ClientError::Disconnected);
        }
        let payload = reply.await.map_err(|_| ClientError::Disconnected)?;
        let outcome: Outcome<T> = serde_json::from_value(payload).map_err(ProtoError::from)?;
        Ok(outcome.into_result()?)
    }

    async fn call<T: DeserializeOwned>(&self, request: SyscallRequest) -> Result<T, ClientError> {
        let (id, reply) = self.register();
        let envelope = match request.to_envelope(&self.token, id) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(err.into());
            }
        };
        self.exchange(id, envelope, reply).await
    }

    /// Announce the context to the kernel and receive the launch parameters
    pub async fn process_init(&self) -> Result<ProcessLaunch, ClientError> {
        let (id, reply) = self.register();
        self.exchange(id, process_init_envelope(&self.token, id), reply).await
    }

    pub async fn open(
        &self,
        path: &str,
        access: AccessFlag,
        status: StatusFlag,
        kind: OpenType,
    ) -> Result<Fd, ClientError> {
        self.call(SyscallRequest::Open {
            path: path.to_string(),
            access,
            status,
            kind,
        })
        .await
    }

    pub async fn close(&self, handle: Fd) -> Result<bool, ClientError> {
        self.call(SyscallRequest::Close { handle }).await
    }

    pub async fn read(&self, handle: Fd, count: ByteCount, offset: u64) -> Result<Vec<u8>, ClientError> {
        self.call(SyscallRequest::Read {
            handle,
            count,
            offset,
        })
        .await
    }

    pub async fn write(
        &self,
        handle: Fd,
        buffer: &[u8],
        count: ByteCount,
        offset: u64,
    ) -> Result<usize, ClientError> {
        self.call(SyscallRequest::Write {
            handle,
            buffer: buffer.to_vec(),
            count,
            offset,
        })
        .await
    }

    pub async fn opendir(&self, path: &str) -> Result<Fd, ClientError> {
        self.call(SyscallRequest::Opendir {
            path: path.to_string(),
        })
        .await
    }

    pub async fn readdir(&self, handle: Fd) -> Result<Vec<EntryInfo>, ClientError> {
        self.call(SyscallRequest::Readdir { handle }).await
    }

    pub async fn exec(
        &self,
        path: &str,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> Result<Pid, ClientError> {
        self.call(SyscallRequest::Exec {
            path: path.to_string(),
            args,
            env,
        })
        .await
    }
}

impl Drop for SyscallClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
