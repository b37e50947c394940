// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Boot sequence: filesystem layout, console TTY, builtin programs

use std::sync::Arc;

use anyhow::Context;
use sandkern_broker::{kernel_channel, KernelInbox, SyscallBroker, TaskHost};
use sandkern_core::{Executable, FsResult, IoFlags, Kernel, OpenOptions, TtyHandles, Vfs};
use sandkern_proto::{AccessFlag, Attributes, ByteCount, OpenType, Pid, StatusFlag};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::builtins::{self, BUILTINS, INIT_SCRIPT, PROGRAM_DIR};
use crate::settings::DaemonConfig;

/// A booted kernel, ready to serve syscalls and run init
pub struct System {
    pub kernel: Arc<Kernel>,
    pub host: Arc<TaskHost>,
    pub console: TtyHandles,
    inbox: Option<KernelInbox>,
}

/// Create the base directory tree
///
/// `/system` is read and execute only; its subdirectories inherit that.
/// `/home` is open to everyone.
pub fn seed_layout(vfs: &Vfs) -> FsResult<()> {
    vfs.mkdir("/system", false, Some(Attributes::READ_EXECUTE))?;
    for dir in ["/system/device", "/system/config", PROGRAM_DIR] {
        vfs.mkdir(dir, false, None)?;
    }
    vfs.mkdir("/home", false, Some(Attributes::ALL))
}

async fn write_file(vfs: &Vfs, path: &str, contents: &[u8]) -> FsResult<()> {
    let handle = vfs.open(
        path,
        &OpenOptions::new(AccessFlag::WriteOnly, StatusFlag::Create, OpenType::Normal).privileged(),
    )?;
    let written = vfs
        .write(handle, contents, ByteCount::All, 0, IoFlags::PRIVILEGED)
        .await;
    vfs.close(handle);
    written.map(|_| ())
}

pub async fn boot(config: &DaemonConfig) -> anyhow::Result<System> {
    let (port, inbox) = kernel_channel();
    let host = Arc::new(TaskHost::new(port));
    let kernel = Arc::new(Kernel::new(config.kernel.clone(), host.clone()));

    seed_layout(kernel.vfs()).context("seeding filesystem layout")?;
    let console = kernel
        .attach_tty(config.console_tty)
        .context("attaching console tty")?;

    builtins::register(&host);
    for name in BUILTINS {
        let path = format!("{PROGRAM_DIR}/{name}");
        kernel
            .install_executable(&path, &Executable::direct(name))
            .await
            .with_context(|| format!("installing {path}"))?;
    }

    let mut script = config.boot_script.join("\n");
    script.push('\n');
    write_file(kernel.vfs(), INIT_SCRIPT, script.as_bytes())
        .await
        .context("writing init script")?;

    info!(tty = %console.path, programs = ?host.targets(), "boot complete");
    Ok(System {
        kernel,
        host,
        console,
        inbox: Some(inbox),
    })
}

impl System {
    /// Start the broker loop; it stops when `shutdown` fires or is dropped
    pub fn serve(&mut self, shutdown: oneshot::Receiver<()>) -> anyhow::Result<JoinHandle<()>> {
        let inbox = self.inbox.take().context("broker already started")?;
        let broker = SyscallBroker::new(self.kernel.clone());
        Ok(tokio::spawn(async move { broker.run(inbox, shutdown).await }))
    }

    /// Exec `path` as the root process, on the console TTY
    pub async fn start_init(&self, path: &str) -> anyhow::Result<Pid> {
        let env = vec![
            ("HOME".to_string(), "/home".to_string()),
            ("PATH".to_string(), PROGRAM_DIR.to_string()),
        ];
        let pid = self
            .kernel
            .exec(None, path, Vec::new(), env)
            .await
            .with_context(|| format!("starting {path}"))?;
        info!(%pid, %path, "init started");
        Ok(pid)
    }
}
