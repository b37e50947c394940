// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process table, spawn handshake and descriptor inheritance

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sandkern_proto::{AccessFlag, Fd, OpenType, Pid, StatusFlag, STDERR, STDIN, STDOUT};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FsError, ProcessError};
use crate::host::{ContextSpec, ExecutionContext, HostAdapter};
use crate::tty::TtyHandles;
use crate::vfs::{HandleId, OpenOptions, Vfs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    /// Context created, waiting for `processInit`
    Spawning,
    Running,
}

/// Process-local descriptor table, allocating the lowest free slot
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FdTable {
    slots: Vec<Option<HandleId>>,
}

impl FdTable {
    pub fn insert(&mut self, handle: HandleId) -> Fd {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => {
                self.slots[index] = Some(handle);
                index as Fd
            }
            None => {
                self.slots.push(Some(handle));
                (self.slots.len() - 1) as Fd
            }
        }
    }

    pub fn set(&mut self, fd: Fd, handle: HandleId) {
        let index = fd as usize;
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(handle);
    }

    pub fn get(&self, fd: Fd) -> Option<HandleId> {
        self.slots.get(fd as usize).copied().flatten()
    }

    pub fn remove(&mut self, fd: Fd) -> Option<HandleId> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Fd, HandleId)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.map(|handle| (fd as Fd, handle)))
    }
}

struct Process {
    pid: Pid,
    parent: Option<Pid>,
    target: String,
    token: String,
    context: ExecutionContext,
    state: ProcessState,
    fds: FdTable,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl Process {
    fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            parent_pid: self.parent,
            target: self.target.clone(),
            state: self.state,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent_pid: Option<Pid>,
    pub target: String,
    pub state: ProcessState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub target: String,
    pub parent: Option<Pid>,
    /// Parent fds duplicated into the child in addition to stdio
    pub inherit: Vec<Fd>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SpawnRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn parent(mut self, parent: Pid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn inherit(mut self, fds: impl IntoIterator<Item = Fd>) -> Self {
        self.inherit = fds.into_iter().collect();
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }
}

/// A confirmed process issuing syscalls
#[derive(Clone, Debug)]
pub struct Caller {
    pub pid: Pid,
    pub context: ExecutionContext,
}

#[derive(Clone, Debug)]
pub enum TokenLookup {
    Running(Caller),
    Spawning(Pid),
    Unknown,
}

/// Launch parameters handed back when a context completes its handshake
#[derive(Clone, Debug)]
pub struct AcceptedProcess {
    pub pid: Pid,
    pub context: ExecutionContext,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Default)]
struct ProcessTable {
    /// Indexed by pid; reaped and exited slots are cleared, never reused
    processes: Vec<Option<Process>>,
    /// Handshake token -> promised pid
    wip: HashMap<String, Pid>,
}

impl ProcessTable {
    fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(pid.as_usize()).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.get_mut(pid.as_usize()).and_then(Option::as_mut)
    }
}

pub struct ProcessManager {
    vfs: Arc<Vfs>,
    host: Arc<dyn HostAdapter>,
    handshake_timeout: Duration,
    table: Mutex<ProcessTable>,
    active_tty: Mutex<Option<TtyHandles>>,
}

impl ProcessManager {
    pub fn new(vfs: Arc<Vfs>, host: Arc<dyn HostAdapter>, handshake_timeout: Duration) -> Self {
        Self {
            vfs,
            host,
            handshake_timeout,
            table: Mutex::new(ProcessTable::default()),
            active_tty: Mutex::new(None),
        }
    }

    /// TTY whose device backs the stdio of root processes
    pub fn set_active_tty(&self, tty: TtyHandles) {
        *self.active_tty.lock().unwrap() = Some(tty);
    }

    pub fn active_tty(&self) -> Option<TtyHandles> {
        self.active_tty.lock().unwrap().clone()
    }

    /// Create a process and its execution context
    ///
    /// The pid is returned before the context completes its handshake. A
    /// context that does not call `processInit` within the handshake timeout
    /// is torn down and its slot cleared.
    pub fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<Pid, ProcessError> {
        let fds = match request.parent {
            Some(parent) => self.inherit_fds(parent, &request.inherit)?,
            None => self.root_stdio()?,
        };

        let token = Uuid::new_v4().to_string();
        let mut table = self.table.lock().unwrap();
        let pid = Pid(table.processes.len() as u32);
        let spec = ContextSpec {
            pid,
            target: request.target.clone(),
            token: token.clone(),
        };
        let context = match self.host.create_context(&spec) {
            Ok(context) => context,
            Err(err) => {
                drop(table);
                warn!(%pid, target = %request.target, error = %err, "failed to create execution context");
                self.close_all(&fds);
                return Err(err.into());
            }
        };

        table.processes.push(Some(Process {
            pid,
            parent: request.parent,
            target: request.target,
            token: token.clone(),
            context,
            state: ProcessState::Spawning,
            fds,
            args: request.args,
            env: request.env,
        }));
        table.wip.insert(token.clone(), pid);
        drop(table);

        info!(%pid, parent = ?request.parent, "spawned process");
        self.schedule_reap(pid, token);
        Ok(pid)
    }

    fn inherit_fds(&self, parent: Pid, inherit: &[Fd]) -> Result<FdTable, ProcessError> {
        let sources = {
            let table = self.table.lock().unwrap();
            let process = table.get(parent).ok_or(ProcessError::NoSuchProcess)?;
            let mut sources: Vec<(Fd, HandleId)> = [STDIN, STDOUT, STDERR]
                .into_iter()
                .filter_map(|fd| process.fds.get(fd).map(|handle| (fd, handle)))
                .collect();
            for fd in inherit {
                if sources.iter().any(|(existing, _)| existing == fd) {
                    continue;
                }
                let handle = process.fds.get(*fd).ok_or(FsError::NoSuchFileHandle)?;
                sources.push((*fd, handle));
            }
            sources
        };

        let mut fds = FdTable::default();
        for (fd, source) in sources {
            match self.vfs.open_duplicate(source) {
                Ok(duplicate) => fds.set(fd, duplicate),
                Err(err) => {
                    self.close_all(&fds);
                    return Err(err.into());
                }
            }
        }
        Ok(fds)
    }

    fn root_stdio(&self) -> Result<FdTable, ProcessError> {
        let mut fds = FdTable::default();
        let Some(tty) = self.active_tty() else {
            debug!("no active tty, root process starts without stdio");
            return Ok(fds);
        };

        let output = OpenOptions::new(AccessFlag::WriteOnly, StatusFlag::Normal, OpenType::Functional);
        let stdio = [
            (
                STDIN,
                OpenOptions::new(AccessFlag::ReadOnly, StatusFlag::Normal, OpenType::Virtual)
                    .duplicate_of(tty.input),
            ),
            (STDOUT, output.clone()),
            (STDERR, output),
        ];
        for (fd, options) in stdio {
            match self.vfs.open(&tty.path, &options) {
                Ok(handle) => fds.set(fd, handle),
                Err(err) => {
                    self.close_all(&fds);
                    return Err(err.into());
                }
            }
        }
        Ok(fds)
    }

    fn close_all(&self, fds: &FdTable) {
        for (_, handle) in fds.iter() {
            self.vfs.close(handle);
        }
    }

    fn schedule_reap(self: &Arc<Self>, pid: Pid, token: String) {
        let manager = Arc::downgrade(self);
        let timeout = self.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.reap(pid, &token);
            }
        });
    }

    fn reap(&self, pid: Pid, token: &str) {
        let process = {
            let mut table = self.table.lock().unwrap();
            if table.wip.remove(token).is_none() {
                return;
            }
            table.processes.get_mut(pid.as_usize()).and_then(Option::take)
        };
        if let Some(process) = process {
            warn!(%pid, target = %process.target, "handshake timed out, reaping process");
            self.teardown(process);
        }
    }

    fn teardown(&self, process: Process) {
        self.close_all(&process.fds);
        self.host.terminate_context(&process.context);
    }

    /// Complete the handshake for the context holding `token`
    pub fn accept(&self, token: &str) -> Result<AcceptedProcess, ProcessError> {
        let mut table = self.table.lock().unwrap();
        let pid = table.wip.remove(token).ok_or(ProcessError::NoSuchProcess)?;
        let process = table.get_mut(pid).ok_or(ProcessError::NoSuchProcess)?;
        process.state = ProcessState::Running;
        info!(%pid, target = %process.target, "process accepted");
        Ok(AcceptedProcess {
            pid,
            context: process.context.clone(),
            args: process.args.clone(),
            env: process.env.clone(),
        })
    }

    pub fn lookup(&self, token: &str) -> TokenLookup {
        let table = self.table.lock().unwrap();
        let found = table.processes.iter().flatten().find(|p| p.token == token);
        match found {
            Some(p) if p.state == ProcessState::Running => TokenLookup::Running(Caller {
                pid: p.pid,
                context: p.context.clone(),
            }),
            Some(p) => TokenLookup::Spawning(p.pid),
            None => TokenLookup::Unknown,
        }
    }

    pub fn process(&self, pid: Pid) -> Option<ProcessInfo> {
        self.table.lock().unwrap().get(pid).map(Process::info)
    }

    /// Live processes in pid order, reaped slots skipped
    pub fn all_processes(&self) -> Vec<ProcessInfo> {
        let table = self.table.lock().unwrap();
        table.processes.iter().flatten().map(Process::info).collect()
    }

    pub fn resolve_fd(&self, pid: Pid, fd: Fd) -> Result<HandleId, ProcessError> {
        let table = self.table.lock().unwrap();
        let process = table.get(pid).ok_or(ProcessError::NoSuchProcess)?;
        Ok(process.fds.get(fd).ok_or(FsError::NoSuchFileHandle)?)
    }

    pub fn install_fd(&self, pid: Pid, handle: HandleId) -> Result<Fd, ProcessError> {
        let mut table = self.table.lock().unwrap();
        let process = table.get_mut(pid).ok_or(ProcessError::NoSuchProcess)?;
        let fd = process.fds.insert(handle);
        debug!(%pid, fd, %handle, "installed descriptor");
        Ok(fd)
    }

    /// Close a local fd and the kernel handle behind it
    pub fn close_fd(&self, pid: Pid, fd: Fd) -> Result<bool, ProcessError> {
        let handle = {
            let mut table = self.table.lock().unwrap();
            let process = table.get_mut(pid).ok_or(ProcessError::NoSuchProcess)?;
            process.fds.remove(fd)
        };
        Ok(handle.is_some_and(|handle| self.vfs.close(handle)))
    }

    pub fn fds(&self, pid: Pid) -> Result<Vec<(Fd, HandleId)>, ProcessError> {
        let table = self.table.lock().unwrap();
        let process = table.get(pid).ok_or(ProcessError::NoSuchProcess)?;
        Ok(process.fds.iter().collect())
    }

    /// Tear a process down: close its descriptors and terminate its context
    pub fn exit(&self, pid: Pid) -> Result<(), ProcessError> {
        let process = {
            let mut table = self.table.lock().unwrap();
            let process = table
                .processes
                .get_mut(pid.as_usize())
                .and_then(Option::take)
                .ok_or(ProcessError::NoSuchProcess)?;
            table.wip.remove(&process.token);
            process
        };
        info!(%pid, target = %process.target, "process exited");
        self.teardown(process);
        Ok(())
    }
}
