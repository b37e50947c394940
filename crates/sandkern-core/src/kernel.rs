// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use sandkern_proto::{AccessFlag, ByteCount, OpenType, Pid, StatusFlag};
use tracing::info;

use crate::config::KernelConfig;
use crate::error::KernelResult;
use crate::exec::{self, Executable};
use crate::host::HostAdapter;
use crate::process::{ProcessManager, SpawnRequest};
use crate::tty::{self, TtyHandles};
use crate::vfs::{IoFlags, OpenOptions, Vfs};

/// One kernel instance: filesystem, process table and their configuration
pub struct Kernel {
    config: KernelConfig,
    vfs: Arc<Vfs>,
    processes: Arc<ProcessManager>,
}

impl Kernel {
    pub fn new(config: KernelConfig, host: Arc<dyn HostAdapter>) -> Self {
        let vfs = Arc::new(Vfs::new());
        let processes = Arc::new(ProcessManager::new(
            vfs.clone(),
            host,
            config.handshake_timeout(),
        ));
        Self {
            config,
            vfs,
            processes,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    /// Create TTY `id`; the first attached TTY backs root process stdio
    pub fn attach_tty(&self, id: u32) -> KernelResult<TtyHandles> {
        let handles = tty::attach(&self.vfs, &self.config.tty_directory, id)?;
        if self.processes.active_tty().is_none() {
            self.processes.set_active_tty(handles.clone());
        }
        Ok(handles)
    }

    pub fn spawn(&self, request: SpawnRequest) -> KernelResult<Pid> {
        Ok(self.processes.spawn(request)?)
    }

    /// Resolve the executable at `path` and spawn it as a child of `parent`
    pub async fn exec(
        &self,
        parent: Option<Pid>,
        path: &str,
        args: Vec<String>,
        env: Vec<(String, String)>,
    ) -> KernelResult<Pid> {
        let plan = exec::resolve(&self.vfs, path, args, self.config.max_interpreter_depth).await?;
        let mut request = SpawnRequest::new(plan.target).args(plan.args).env(env);
        request.parent = parent;
        let pid = self.processes.spawn(request)?;
        info!(%pid, %path, "exec");
        Ok(pid)
    }

    /// Write an executable descriptor to `path`, creating it if needed
    pub async fn install_executable(&self, path: &str, executable: &Executable) -> KernelResult<()> {
        let bytes = executable.to_bytes()?;
        let handle = self.vfs.open(
            path,
            &OpenOptions::new(AccessFlag::WriteOnly, StatusFlag::Create, OpenType::Normal)
                .privileged(),
        )?;
        let written = self
            .vfs
            .write(handle, &bytes, ByteCount::All, 0, IoFlags::PRIVILEGED)
            .await;
        self.vfs.close(handle);
        written?;
        Ok(())
    }
}
