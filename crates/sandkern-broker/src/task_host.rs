// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host adapter running programs as tokio tasks
//!
//! Each execution context is a task holding its own [`SyscallClient`]. The
//! task performs the `processInit` handshake, runs the program registered for
//! the launch target and reports the exit to the kernel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use sandkern_core::{ContextSpec, ExecutionContext, HostAdapter, HostError};
use sandkern_proto::{ByteCount, Fd, Pid, STDERR, STDOUT};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::KernelPort;
use crate::client::{ClientError, SyscallClient};

/// Code run inside an execution context
#[async_trait]
pub trait Program: Send + Sync {
    async fn run(&self, ctx: ProgramContext) -> anyhow::Result<()>;
}

/// What a running program gets: its identity, launch parameters and syscalls
pub struct ProgramContext {
    pub pid: Pid,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub sys: SyscallClient,
}

impl ProgramContext {
    pub fn var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    async fn write_fd(&self, fd: Fd, text: &str) -> Result<usize, ClientError> {
        self.sys.write(fd, text.as_bytes(), ByteCount::All, 0).await
    }

    pub async fn print(&self, text: &str) -> Result<usize, ClientError> {
        self.write_fd(STDOUT, text).await
    }

    pub async fn eprint(&self, text: &str) -> Result<usize, ClientError> {
        self.write_fd(STDERR, text).await
    }
}

pub struct TaskHost {
    port: KernelPort,
    programs: RwLock<HashMap<String, Arc<dyn Program>>>,
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_context: AtomicU64,
}

impl TaskHost {
    pub fn new(port: KernelPort) -> Self {
        Self {
            port,
            programs: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(0),
        }
    }

    /// Make `program` launchable under `target`
    pub fn register(&self, target: impl Into<String>, program: Arc<dyn Program>) {
        self.programs.write().unwrap().insert(target.into(), program);
    }

    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<_> = self.programs.read().unwrap().keys().cloned().collect();
        targets.sort();
        targets
    }

    pub fn running_contexts(&self) -> usize {
        let tasks = self.tasks.lock().unwrap();
        tasks.values().filter(|task| !task.is_finished()).count()
    }
}

impl HostAdapter for TaskHost {
    fn create_context(&self, spec: &ContextSpec) -> Result<ExecutionContext, HostError> {
        let program = self
            .programs
            .read()
            .unwrap()
            .get(&spec.target)
            .cloned()
            .ok_or_else(|| HostError::UnknownTarget(spec.target.clone()))?;

        let id = self.next_context.fetch_add(1, Ordering::Relaxed);
        let (outbox, responses) = mpsc::unbounded_channel();
        let port = self.port.clone();
        let token = spec.token.clone();
        let target = spec.target.clone();

        let task = tokio::spawn(async move {
            let sys = SyscallClient::connect(token, port.clone(), responses);
            let launch = match sys.process_init().await {
                Ok(launch) => launch,
                Err(err) => {
                    warn!(%target, error = %err, "handshake failed");
                    return;
                }
            };
            let pid = launch.pid;
            let ctx = ProgramContext {
                pid,
                args: launch.args,
                env: launch.env,
                sys,
            };
            match program.run(ctx).await {
                Ok(()) => debug!(%pid, %target, "program finished"),
                Err(err) => warn!(%pid, %target, error = %err, "program failed"),
            }
            port.notify_exit(pid);
        });
        self.tasks.lock().unwrap().insert(id, task);
        debug!(context = id, pid = %spec.pid, target = %spec.target, "created task context");
        Ok(ExecutionContext::new(id, outbox))
    }

    fn terminate_context(&self, context: &ExecutionContext) {
        if let Some(task) = self.tasks.lock().unwrap().remove(&context.id()) {
            task.abort();
            debug!(context = context.id(), "terminated task context");
        }
    }
}
